use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Length prefix announced a frame larger than the configured maximum
    /// (SECURITY: potentially malicious peer)
    #[error("Frame of {size} bytes exceeds maximum frame size of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame body was not valid JSON for the expected structure
    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// Hex text could not be decoded
    #[error("Invalid hex in {what}")]
    InvalidHex { what: &'static str },

    /// Decoded key or signature had the wrong length or was not a valid curve point
    #[error("Invalid {what}: expected {expected} bytes, got {actual}")]
    InvalidKeyMaterial {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Envelope carried a payload for a different message type than requested
    #[error("Expected a '{expected}' envelope, got '{actual}'")]
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },
}

impl CodecError {
    pub(crate) fn malformed(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            what,
            reason: err.to_string(),
        }
    }
}

/// Errors produced when validating configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Network identifier missing while networking is enabled
    #[error("networkID is required when networking is enabled")]
    MissingNetworkId,

    /// Network identifier contains characters outside [A-Za-z0-9_-]
    #[error("networkID '{network_id}' may only contain alphanumerics, '_' and '-'")]
    InvalidNetworkId { network_id: String },

    /// Peer limit outside the supported range
    #[error("maxPeers {value} out of range (0-{max})")]
    MaxPeersOutOfRange { value: usize, max: usize },

    /// Discovery port inside the privileged range
    #[error("discoveryPort {port} out of range (1024-65535)")]
    PrivilegedPort { port: u16 },

    /// A duration or ratio that must be positive was not
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    /// A value that must lie within an interval did not
    #[error("{field} = {value} out of range ({min}-{max})")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },
}
