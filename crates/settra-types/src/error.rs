//! Error types for value-domain operations.

/// Errors arising from parsing or constructing value domains.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// The textual form does not name any known value domain.
    #[error("cannot resolve setting type {0:?}")]
    UnknownType(String),

    /// An `Enum`/`Flag` option list failed to parse as a JSON array.
    #[error("{kind} options must be a JSON array: {detail}")]
    MalformedOptions { kind: &'static str, detail: String },

    /// An `Enum`/`Flag` option is not a JSON scalar.
    #[error("{kind} option {literal} is not a primitive")]
    NonScalarOption { kind: &'static str, literal: String },

    /// A version string is not of the form `MAJOR.MINOR`.
    #[error("invalid version {0:?}, expected MAJOR.MINOR")]
    InvalidVersion(String),
}
