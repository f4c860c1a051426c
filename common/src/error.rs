use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("filesystem unavailable: {0}")]
    Unavailable(String),
    #[error("i/o failure on `{path}`: {message}")]
    Io { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("malformed settings document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("broker link is not connected")]
    NotConnected,
    #[error("broker refused the request: {0}")]
    Rejected(String),
    #[error("broker transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("credential `{0}` exceeds the radio limit")]
    CredentialTooLong(&'static str),
    #[error("radio driver failure: {0}")]
    Driver(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("channel registry is full ({capacity} channels)")]
    Full { capacity: usize },
    #[error("a channel with this id is already registered")]
    DuplicateId,
}

/// Reasons an inbound command payload is dropped without touching state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty payload")]
    Empty,
    #[error("expected a single byte, got {0}")]
    Length(usize),
    #[error("expected `0` or `1`, got byte {0:#04x}")]
    Flag(u8),
    #[error("payload is not a decimal integer")]
    NotNumeric,
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("channel does not accept state commands")]
    NotWritable,
    #[error("name contains a topic separator, wildcard or control character")]
    InvalidName,
    #[error("name is already used by another channel")]
    NameTaken,
}
