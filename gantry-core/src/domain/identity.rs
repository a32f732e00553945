//! Caller identity

use serde::{Deserialize, Serialize};

/// The authenticated caller, as resolved from a bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
}
