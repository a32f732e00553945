//! Node Registry
//!
//! Tracks registered nodes, their GPU accounting and their liveness.
//!
//! Every node sits behind its own mutex, so heartbeats from different nodes
//! never contend. GPU reservations are move-only [`Reservation`] tokens: the
//! scheduler obtains one from [`NodeRegistry::reserve`], hands it to the
//! ledger with [`NodeRegistry::commit`] once the job is assigned, and the
//! lifecycle monitor gives it back through [`NodeRegistry::release_job`].
//! Since a token can only be consumed once, a reservation is released at
//! most once.

use chrono::{DateTime, TimeDelta, Utc};
use gantry_core::domain::node::{Node, NodeStatus};
use gantry_core::dto::node::NodeHeartbeat;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::to_delta;

/// Registry error type
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} not found")]
    NotFound(String),

    #[error("invalid node data: {0}")]
    Validation(String),

    #[error("node {node_id} has {free} free GPUs, {requested} requested")]
    InsufficientResources {
        node_id: String,
        requested: u32,
        free: u32,
    },

    #[error("node {node_id} is {status}")]
    NotAvailable { node_id: String, status: NodeStatus },

    #[error("node {0} still holds reservations")]
    InUse(String),

    #[error("registry invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// GPUs held on a node on behalf of one job
///
/// Not `Clone`: the only ways to get rid of a reservation are to commit it to
/// the ledger or to release it, each of which consumes the token.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation that is neither committed nor released leaks GPUs"]
pub struct Reservation {
    job_id: Uuid,
    node_id: String,
    gpus: u32,
}

impl Reservation {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn gpus(&self) -> u32 {
        self.gpus
    }
}

struct NodeEntry {
    node: Node,
    /// GPUs held by outstanding reservations
    reserved: u32,
    /// Set under the entry lock when the node leaves the map
    removed: bool,
}

impl NodeEntry {
    fn recompute(&mut self) {
        self.node.gpu_free = self.node.gpu_count.saturating_sub(self.reserved);
        if self.node.status.is_alive() {
            self.node.status = NodeStatus::live(self.node.gpu_count, self.node.gpu_free);
        }
    }
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<Mutex<NodeEntry>>>>,
    /// Committed reservations by job id
    ledger: Mutex<HashMap<Uuid, Reservation>>,
    liveness: TimeDelta,
    down_after: TimeDelta,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NodeRegistry {
    /// Nodes silent for longer than `liveness` are OFFLINE, longer than
    /// `down_after` DOWN.
    pub fn new(liveness: Duration, down_after: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            ledger: Mutex::new(HashMap::new()),
            liveness: to_delta(liveness),
            down_after: to_delta(down_after),
        }
    }

    fn entry(&self, node_id: &str) -> Result<Arc<Mutex<NodeEntry>>> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))
    }

    fn snapshot(&self) -> Vec<Node> {
        let entries: Vec<_> = {
            let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
            nodes.values().cloned().collect()
        };
        entries.iter().map(|e| lock(e).node.clone()).collect()
    }

    // =============================================================================
    // Heartbeats
    // =============================================================================

    pub fn heartbeat(&self, node_id: &str, hb: NodeHeartbeat) -> Result<Node> {
        self.heartbeat_at(node_id, hb, Utc::now())
    }

    /// Upserts a node from a heartbeat received at `now`
    pub fn heartbeat_at(&self, node_id: &str, hb: NodeHeartbeat, now: DateTime<Utc>) -> Result<Node> {
        validate_heartbeat(node_id, &hb)?;

        let existing = {
            let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
            nodes.get(node_id).cloned()
        };

        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
                let entry = nodes.entry(node_id.to_string()).or_insert_with(|| {
                    tracing::info!("Registering node {} at {}", node_id, hb.addr);
                    Arc::new(Mutex::new(NodeEntry {
                        node: Node {
                            id: node_id.to_string(),
                            addr: hb.addr.clone(),
                            agent_version: hb.agent_version.clone(),
                            status: NodeStatus::Up,
                            gpu_count: hb.gpu_count,
                            gpu_free: hb.gpu_count,
                            gpu_utilization: None,
                            memory_total_mb: None,
                            memory_used_mb: None,
                            last_heartbeat: now,
                        },
                        reserved: 0,
                        removed: false,
                    }))
                });
                Arc::clone(entry)
            }
        };

        let mut entry = lock(&entry);
        if entry.removed {
            // lost a race with `remove`, register afresh
            drop(entry);
            return self.heartbeat_at(node_id, hb, now);
        }
        if !entry.node.status.is_alive() {
            tracing::info!("Node {} is back after {}", node_id, entry.node.status);
        }
        if entry.reserved > hb.gpu_count {
            tracing::warn!(
                "Node {} reports {} GPUs but {} are reserved",
                node_id,
                hb.gpu_count,
                entry.reserved
            );
        }

        entry.node.addr = hb.addr;
        entry.node.agent_version = hb.agent_version;
        entry.node.gpu_count = hb.gpu_count;
        entry.node.gpu_utilization = hb.gpu_utilization;
        entry.node.memory_total_mb = hb.memory_total_mb;
        entry.node.memory_used_mb = hb.memory_used_mb;
        entry.node.last_heartbeat = entry.node.last_heartbeat.max(now);
        // any live status will do, recompute picks the right one
        entry.node.status = NodeStatus::Up;
        entry.recompute();

        Ok(entry.node.clone())
    }

    /// Revises statuses from heartbeat age.
    ///
    /// Returns the ids of every node that is no longer alive.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let entries: Vec<_> = {
            let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
            nodes.values().cloned().collect()
        };

        let mut dead = Vec::new();
        for entry in entries {
            let mut entry = lock(&entry);
            let age = now - entry.node.last_heartbeat;
            let status = if age > self.down_after {
                NodeStatus::Down
            } else if age > self.liveness {
                NodeStatus::Offline
            } else {
                NodeStatus::live(entry.node.gpu_count, entry.node.gpu_free)
            };

            if status != entry.node.status {
                if status.is_alive() {
                    tracing::debug!("Node {} is {}", entry.node.id, status);
                } else {
                    tracing::warn!(
                        "Node {} is {}, last heartbeat {}s ago",
                        entry.node.id,
                        status,
                        age.num_seconds()
                    );
                }
                entry.node.status = status;
            }
            if !status.is_alive() {
                dead.push(entry.node.id.clone());
            }
        }

        dead.sort();
        dead
    }

    // =============================================================================
    // Reservations
    // =============================================================================

    /// Takes `gpus` GPUs on a live node for `job_id`
    pub fn reserve(&self, node_id: &str, job_id: Uuid, gpus: u32) -> Result<Reservation> {
        if gpus == 0 {
            return Err(RegistryError::Validation(
                "cannot reserve zero GPUs".to_string(),
            ));
        }

        let entry = self.entry(node_id)?;
        self.reserve_in(&entry, node_id, job_id, gpus)
    }

    fn reserve_in(
        &self,
        entry: &Mutex<NodeEntry>,
        node_id: &str,
        job_id: Uuid,
        gpus: u32,
    ) -> Result<Reservation> {
        let mut entry = lock(entry);

        // removed between the map lookup and taking the lock
        if entry.removed {
            return Err(RegistryError::NotFound(node_id.to_string()));
        }
        if !entry.node.status.is_alive() {
            return Err(RegistryError::NotAvailable {
                node_id: node_id.to_string(),
                status: entry.node.status,
            });
        }
        if entry.node.gpu_free < gpus {
            return Err(RegistryError::InsufficientResources {
                node_id: node_id.to_string(),
                requested: gpus,
                free: entry.node.gpu_free,
            });
        }

        entry.reserved += gpus;
        entry.recompute();
        tracing::debug!(
            "Reserved {} GPUs on {} for job {} ({} free)",
            gpus,
            node_id,
            job_id,
            entry.node.gpu_free
        );

        Ok(Reservation {
            job_id,
            node_id: node_id.to_string(),
            gpus,
        })
    }

    /// Records a reservation as belonging to its (now assigned) job
    pub fn commit(&self, reservation: Reservation) -> Result<()> {
        let job_id = reservation.job_id;
        let rejected = {
            let mut ledger = lock(&self.ledger);
            if ledger.contains_key(&job_id) {
                Some(reservation)
            } else {
                ledger.insert(job_id, reservation);
                None
            }
        };

        match rejected {
            None => Ok(()),
            Some(reservation) => {
                tracing::error!("Job {} already holds a committed reservation", job_id);
                self.release(reservation)?;
                Err(RegistryError::Invariant(format!(
                    "second reservation committed for job {}",
                    job_id
                )))
            }
        }
    }

    /// Gives a reservation's GPUs back to its node
    pub fn release(&self, reservation: Reservation) -> Result<()> {
        let entry = self.entry(&reservation.node_id)?;
        let mut entry = lock(&entry);

        if entry.reserved < reservation.gpus {
            tracing::error!(
                "Releasing {} GPUs on {} but only {} are reserved",
                reservation.gpus,
                reservation.node_id,
                entry.reserved
            );
            return Err(RegistryError::Invariant(format!(
                "reservation underflow on node {}",
                reservation.node_id
            )));
        }

        entry.reserved -= reservation.gpus;
        entry.recompute();
        tracing::debug!(
            "Released {} GPUs on {} from job {} ({} free)",
            reservation.gpus,
            reservation.node_id,
            reservation.job_id,
            entry.node.gpu_free
        );

        Ok(())
    }

    /// Releases the committed reservation of a job, if it has one
    pub fn release_job(&self, job_id: Uuid) -> Result<bool> {
        let reservation = lock(&self.ledger).remove(&job_id);
        match reservation {
            Some(reservation) => self.release(reservation).map(|_| true),
            None => Ok(false),
        }
    }

    /// Node a job's committed reservation is held on
    pub fn reservation_node(&self, job_id: Uuid) -> Option<String> {
        lock(&self.ledger).get(&job_id).map(|r| r.node_id.clone())
    }

    // =============================================================================
    // Queries
    // =============================================================================

    pub fn get(&self, node_id: &str) -> Result<Node> {
        let entry = self.entry(node_id)?;
        let node = lock(&entry).node.clone();
        Ok(node)
    }

    /// All nodes, ordered by id
    pub fn list(&self) -> Vec<Node> {
        let mut nodes = self.snapshot();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Live nodes with free GPUs, most free GPUs first
    pub fn list_available(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .snapshot()
            .into_iter()
            .filter(Node::is_schedulable)
            .collect();
        nodes.sort_by(|a, b| b.gpu_free.cmp(&a.gpu_free).then_with(|| a.id.cmp(&b.id)));
        nodes
    }

    /// Largest GPU count of any registered node
    pub fn max_gpu_count(&self) -> Option<u32> {
        self.snapshot().iter().map(|n| n.gpu_count).max()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Forgets a node that holds no reservations
    pub fn remove(&self, node_id: &str) -> Result<Node> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let entry = nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;

        // reservations are taken under the node lock, so holding it while
        // removing from the map leaves no window for a new one
        let mut entry = lock(&entry);
        if entry.reserved > 0 {
            return Err(RegistryError::InUse(node_id.to_string()));
        }
        entry.removed = true;
        nodes.remove(node_id);
        tracing::info!("Removed node {}", node_id);

        Ok(entry.node.clone())
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_heartbeat(node_id: &str, hb: &NodeHeartbeat) -> Result<()> {
    const MAX_ID_LENGTH: usize = 255;

    if node_id.trim().is_empty() {
        return Err(RegistryError::Validation(
            "node id cannot be empty".to_string(),
        ));
    }
    if node_id.len() > MAX_ID_LENGTH {
        return Err(RegistryError::Validation(format!(
            "node id too long (max: {} chars)",
            MAX_ID_LENGTH
        )));
    }
    if hb.addr.trim().is_empty() {
        return Err(RegistryError::Validation(
            "node address cannot be empty".to_string(),
        ));
    }
    if let Some(util) = hb.gpu_utilization.filter(|u| !(0.0..=100.0).contains(u)) {
        return Err(RegistryError::Validation(format!(
            "gpu_utilization must be within 0..=100, got {}",
            util
        )));
    }
    match (hb.memory_total_mb, hb.memory_used_mb) {
        (Some(total), Some(used)) if used > total => {
            return Err(RegistryError::Validation(format!(
                "memory_used_mb {} exceeds memory_total_mb {}",
                used, total
            )));
        }
        _ => {}
    }

    Ok(())
}
