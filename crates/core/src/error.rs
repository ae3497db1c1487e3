//! Error kinds surfaced by the runtime.
//!
//! None of these abort a dispatch cycle on their own: at component boundaries
//! they are converted into [`Message`](crate::message::Message)s so the caller
//! always gets a verdict plus diagnostics instead of a panic.

use thiserror::Error;

use crate::id::TypeTag;
use crate::status::StatusCode;

/// Capability contract a resolved type tag failed to satisfy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContractKind {
    Aggregate,
    Command,
    Event,
    Handler,
    Listener,
}

impl core::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ContractKind::Aggregate => "aggregate",
            ContractKind::Command => "command",
            ContractKind::Event => "event",
            ContractKind::Handler => "handler",
            ContractKind::Listener => "listener",
        };
        f.write_str(name)
    }
}

/// A type tag could not be resolved to the expected contract.
///
/// Wiring bug, not a domain outcome; reported with [`StatusCode::Error`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} type tag `{tag}`")]
pub struct TypeMismatchError {
    pub kind: ContractKind,
    pub tag: TypeTag,
}

impl TypeMismatchError {
    pub fn new(kind: ContractKind, tag: &TypeTag) -> Self {
        Self {
            kind,
            tag: tag.clone(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::Error
    }
}

/// Handler-raised rejection of a command's content.
///
/// Carries the status code that ends up on the resulting message, so a
/// handler can distinguish a malformed command from, say, a uniqueness
/// conflict it detected itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub code: StatusCode,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, code: StatusCode) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message, StatusCode::BadRequest)
    }
}

/// A textual identifier that is not a valid UUID.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid identifier: {0}")]
pub struct InvalidIdError(pub String);
