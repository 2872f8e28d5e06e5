//! Concord Core - Entity Types
//!
//! Pure data structures shared by every Concord crate: messages, failure-mode
//! model, orchestration DTOs, error taxonomy and configuration.
//! This crate contains ONLY data types - no async, no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod api;
pub mod config;
pub mod error;
pub mod message;
pub mod orchestration;
pub mod quality;

pub use api::*;
pub use config::*;
pub use error::*;
pub use message::*;
pub use orchestration::*;
pub use quality::*;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Agent identifier. Agents are addressed by caller-chosen names
/// (e.g. `"researcher-1"`), so this is a plain string rather than a UUID.
pub type AgentId = String;

/// Message identifier using UUIDv7 for timestamp-sortable, never-reused IDs.
pub type MessageId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Message payload: a JSON object keyed by field name.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Generate a new UUIDv7 message id.
pub fn new_message_id() -> MessageId {
    Uuid::now_v7()
}

/// Clamp a score into `[0, 1]`. NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
