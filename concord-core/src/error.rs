//! Error types for Concord operations

use crate::{AgentId, FailureMode, MessageId, MessageType};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Message bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Message {message_id} is {size} bytes, exceeding the {limit} byte limit")]
    MessageTooLarge {
        message_id: MessageId,
        size: usize,
        limit: usize,
    },

    #[error("Message is missing routing field: {field}")]
    MissingRoutingField { field: String },

    #[error("Cannot respond to {message_id}: it is a {message_type}, not a REQUEST")]
    NotARequest {
        message_id: MessageId,
        message_type: MessageType,
    },

    #[error("Agent not registered: {agent_id}")]
    UnknownAgent { agent_id: AgentId },

    #[error("Agent already registered: {agent_id}")]
    AlreadyRegistered { agent_id: AgentId },

    #[error("Request {message_id} timed out after {timeout_ms}ms")]
    Timeout { message_id: MessageId, timeout_ms: u64 },

    #[error("Delivery of {message_id} to {agent_id} failed: {reason}")]
    Delivery {
        message_id: MessageId,
        agent_id: AgentId,
        reason: String,
    },

    #[error("A pending request already exists for {message_id}")]
    DuplicatePending { message_id: MessageId },

    #[error("Wire codec error: {reason}")]
    Codec { reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
}

/// Quality gate errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QualityError {
    #[error("Content rejected: {mode} severity {severity:.2} exceeds ceiling {ceiling:.2}")]
    Rejected {
        mode: FailureMode,
        severity: f64,
        ceiling: f64,
    },
}

/// Orchestration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("All {} agents failed for request {request_id}", .failures.len())]
    AllAgentsFailed {
        request_id: String,
        failures: Vec<String>,
    },

    #[error("No live agents available for request {request_id}")]
    NoAgentsAvailable { request_id: String },
}

/// Language model errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("No language model configured")]
    ProviderNotConfigured,

    #[error("Request to {provider} failed with status {status}: {message}")]
    RequestFailed {
        provider: String,
        status: i32,
        message: String,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Generation failed: {reason}")]
    GenerationFailed { reason: String },
}

impl LlmError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::RequestFailed { status, .. } => *status == 0 || *status >= 500 || *status == 408,
            _ => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all Concord errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConcordError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Quality error: {0}")]
    Quality(#[from] QualityError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Concord operations.
pub type ConcordResult<T> = Result<T, ConcordError>;

// ============================================================================
// ERROR KINDS & REPORTS
// ============================================================================

/// Caller-facing error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ErrorKind {
    InvalidArgument,
    Timeout,
    Delivery,
    OrchestrationFailed,
    QualityRejected,
    Llm,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Delivery => "DELIVERY",
            ErrorKind::OrchestrationFailed => "ORCHESTRATION_FAILED",
            ErrorKind::QualityRejected => "QUALITY_REJECTED",
            ErrorKind::Llm => "LLM",
            ErrorKind::Config => "CONFIG",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConcordError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConcordError::Bus(e) => match e {
                BusError::Timeout { .. } => ErrorKind::Timeout,
                BusError::Delivery { .. } | BusError::PublishFailed { .. } => ErrorKind::Delivery,
                BusError::MessageTooLarge { .. }
                | BusError::MissingRoutingField { .. }
                | BusError::NotARequest { .. }
                | BusError::UnknownAgent { .. }
                | BusError::AlreadyRegistered { .. }
                | BusError::DuplicatePending { .. }
                | BusError::Codec { .. } => ErrorKind::InvalidArgument,
            },
            ConcordError::Quality(_) => ErrorKind::QualityRejected,
            ConcordError::Orchestration(_) => ErrorKind::OrchestrationFailed,
            ConcordError::Llm(_) => ErrorKind::Llm,
            ConcordError::Config(_) => ErrorKind::Config,
        }
    }

    /// Agent named by this error, if any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            ConcordError::Bus(BusError::Delivery { agent_id, .. })
            | ConcordError::Bus(BusError::UnknownAgent { agent_id })
            | ConcordError::Bus(BusError::AlreadyRegistered { agent_id }) => Some(agent_id),
            _ => None,
        }
    }

    /// Request named by this error, if any.
    pub fn request_id(&self) -> Option<String> {
        match self {
            ConcordError::Orchestration(OrchestrationError::AllAgentsFailed { request_id, .. })
            | ConcordError::Orchestration(OrchestrationError::NoAgentsAvailable { request_id }) => {
                Some(request_id.clone())
            }
            ConcordError::Bus(BusError::Timeout { message_id, .. })
            | ConcordError::Bus(BusError::Delivery { message_id, .. }) => {
                Some(message_id.to_string())
            }
            _ => None,
        }
    }
}

/// Structured error handed to external callers instead of a raw internal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl ErrorReport {
    /// Set the request id if the error did not already carry one.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        if self.request_id.is_none() {
            self.request_id = Some(request_id.into());
        }
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

impl From<&ConcordError> for ErrorReport {
    fn from(err: &ConcordError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            request_id: err.request_id(),
            agent_id: err.agent_id().map(str::to_string),
            tenant_id: None,
        }
    }
}

impl From<ConcordError> for ErrorReport {
    fn from(err: ConcordError) -> Self {
        Self::from(&err)
    }
}

// =============================================================================
// TESTS
// =============================================================================
