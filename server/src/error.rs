use thiserror::Error;

/// Failures reported by a player or group store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a player with serial number {0} already exists")]
    DuplicateSerial(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Failures of a single check-in
#[derive(Debug, Error)]
pub enum CheckInError {
    /// The report carried no hardware serial number; nothing was touched
    #[error("check-in rejected: missing cpuSerialNumber")]
    MissingSerial,
    #[error("failed to persist player {serial}: {source}")]
    Persist {
        serial: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to look up player {serial}: {source}")]
    Lookup {
        serial: String,
        #[source]
        source: StoreError,
    },
}
