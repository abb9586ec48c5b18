// ABOUTME: Typed error taxonomy for configuration, routing, decoding and write failures
// ABOUTME: Carried inside anyhow::Error and recovered with downcast_ref at the HTTP boundary

use std::fmt;

/// Which side of a system an endpoint identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Source,
    Sink,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Source => f.write_str("source"),
            EndpointKind::Sink => f.write_str("sink"),
        }
    }
}

/// Failures that callers need to tell apart.
///
/// Database errors are not listed here: they stay `tokio_postgres::Error`
/// inside the `anyhow` chain and are always treated as server errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Invalid configuration or a sink whose table does not match it. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown system/source or system/sink pair.
    #[error("unknown system/{kind} pair '{system}/{endpoint}'")]
    NotFound {
        system: String,
        endpoint: String,
        kind: EndpointKind,
    },

    /// A wire value or entity could not be decoded.
    #[error("cannot decode field '{field}': {reason}")]
    Decode { field: String, reason: String },

    /// An entity sent to a sink lacks one of the primary-key columns.
    #[error("entity is missing a value for primary key column '{column}'")]
    MissingKey { column: String },

    /// An update matched more than one row: the key is not unique in the table.
    #[error("expected 1 row to be updated in {table}, not {count}")]
    Consistency { table: String, count: u64 },
}

impl BridgeError {
    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config(message.into())
    }

    pub fn decode(field: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::Decode {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True when the error should surface as a client-facing not-found signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound { .. })
    }
}

/// Find the first `BridgeError` in an anyhow chain.
pub fn classify(err: &anyhow::Error) -> Option<&BridgeError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BridgeError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_not_found_message() {
        let err = BridgeError::NotFound {
            system: "crm".to_string(),
            endpoint: "customers".to_string(),
            kind: EndpointKind::Source,
        };
        assert_eq!(
            err.to_string(),
            "unknown system/source pair 'crm/customers'"
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_through_context() {
        let result: anyhow::Result<()> = Err(BridgeError::Consistency {
            table: "\"public\".\"widgets\"".to_string(),
            count: 2,
        }
        .into());
        let err = result.context("Failed to apply batch").unwrap_err();

        match classify(&err) {
            Some(BridgeError::Consistency { count, .. }) => assert_eq!(*count, 2),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_classify_plain_error() {
        let err = anyhow::anyhow!("connection refused");
        assert!(classify(&err).is_none());
    }
}
