//! Closed set of outcome codes carried by messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome code attached to every [`Message`](crate::message::Message).
///
/// The set is closed: persisted numeric codes outside it are rejected at the
/// serde boundary instead of travelling through the system as bare integers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    /// No specific outcome recorded.
    Default,
    /// The operation succeeded.
    Ok,
    /// The operation created something new.
    Created,
    /// The command was semantically invalid.
    BadRequest,
    /// An optimistic concurrency collision.
    Conflict,
    /// An unclassified internal failure.
    Error,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Default => 0,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::BadRequest => 400,
            StatusCode::Conflict => 409,
            StatusCode::Error => 500,
        }
    }
}

impl core::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

impl From<StatusCode> for u16 {
    fn from(value: StatusCode) -> Self {
        value.as_u16()
    }
}

/// Numeric code with no [`StatusCode`] counterpart.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown status code {0}")]
pub struct UnknownStatusCode(pub u16);

impl TryFrom<u16> for StatusCode {
    type Error = UnknownStatusCode;

    fn try_from(value: u16) -> Result<Self, UnknownStatusCode> {
        match value {
            0 => Ok(StatusCode::Default),
            200 => Ok(StatusCode::Ok),
            201 => Ok(StatusCode::Created),
            400 => Ok(StatusCode::BadRequest),
            409 => Ok(StatusCode::Conflict),
            500 => Ok(StatusCode::Error),
            other => Err(UnknownStatusCode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_numbers() {
        assert_eq!(serde_json::to_string(&StatusCode::Conflict).unwrap(), "409");
        assert_eq!(
            serde_json::from_str::<StatusCode>("201").unwrap(),
            StatusCode::Created
        );
    }

    #[test]
    fn unknown_numeric_codes_are_rejected() {
        assert!(serde_json::from_str::<StatusCode>("404").is_err());
    }
}
