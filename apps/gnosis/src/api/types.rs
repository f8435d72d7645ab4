//! # API Request/Response Types

use gnosis_core::{GnosisCore, PluginInfo, RejectReason};
use serde::{Deserialize, Serialize};

// =============================================================================
// HEALTH
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Counts across the subsystems plus the key that signs responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub entities: usize,
    pub versions: usize,
    pub memories: usize,
    pub self_model_levels: usize,
    pub audit_records: u64,
    pub plugins: usize,
    pub pending_transactions: usize,
    /// Hex-encoded ed25519 verifying key of the core.
    pub core_public_key: String,
}

impl StatusResponse {
    /// Gather counts from a live core. A broken self-model chain reads as zero levels.
    pub fn from_core(core: &GnosisCore) -> Self {
        Self {
            entities: core.store().entity_count(),
            versions: core.store().version_count(),
            memories: core.memory().len(),
            self_model_levels: core.selfmap().chain().map(|c| c.len()).unwrap_or(0),
            audit_records: core.audit().len(),
            plugins: core.registry().list_plugins().len(),
            pending_transactions: core.transactions().pending_count(),
            core_public_key: hex::encode(core.router().verifying_key().to_bytes()),
        }
    }
}

// =============================================================================
// PLUGINS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub operation: String,
    #[serde(flatten)]
    pub info: PluginInfo,
}

// =============================================================================
// MESSAGE REJECTION
// =============================================================================

/// Body returned when the core refuses a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectResponse {
    pub status: String,
    pub reason: RejectReason,
    pub detail: String,
}

impl RejectResponse {
    pub fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            status: "rejected".to_string(),
            reason,
            detail: detail.into(),
        }
    }
}

/// Body for failures outside the messaging protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
