//! Error types for the versioned object store

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised while decoding or laying out an object-version file.
///
/// These never carry a protocol code: a corrupt file is a server fault,
/// not something a client can fix by changing its request.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Unrecognized object file signature: {0:?}")]
    BadSignature([u8; 3]),

    #[error("Object file is truncated: need {needed} bytes, found {found}")]
    Truncated { needed: u64, found: u64 },

    #[error("Malformed diff block: {0}")]
    MalformedDiff(#[source] serde_json::Error),

    #[error("Offset {0} does not fit in 40 bits")]
    OffsetTooLarge(u64),

    #[error("Corrupt object file: {0}")]
    Corrupt(String),
}

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown object: {0}")]
    ObjUnknown(String),

    #[error("Object already exists: {0}")]
    ObjExist(String),

    #[error("Unknown version {version} of object {obj}")]
    ObjVerUnknown { obj: String, version: u64 },

    #[error("Another transaction is in progress on object {0}")]
    ConcurrentTransaction(String),

    #[error("Unknown transaction on object {0}")]
    TransactionUnknown(String),

    #[error("Write mode does not match transaction {0}")]
    IncompatibleTransaction(String),

    #[error("Write exceeds declared size in transaction {0}")]
    WriteOverflow(String),

    #[error("Not enough space: requested {requested} bytes, {free} free")]
    NotEnoughSpace { requested: u64, free: u64 },

    #[error("Version mismatch: current version is {current_version}")]
    MismatchedObjVersion { current_version: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Symbolic code reported to protocol clients, if this error has one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            StoreError::ObjUnknown(_) => Some("OBJ_UNKNOWN"),
            StoreError::ObjExist(_) => Some("OBJ_EXIST"),
            StoreError::ObjVerUnknown { .. } => Some("OBJ_VER_UNKNOWN"),
            StoreError::ConcurrentTransaction(_) => Some("CONCURRENT_TRANSACTION"),
            StoreError::TransactionUnknown(_) => Some("TRANSACTION_UNKNOWN"),
            StoreError::IncompatibleTransaction(_) => Some("INCOMPATIBLE_TRANSACTION"),
            StoreError::WriteOverflow(_) => Some("WRITE_OVERFLOW"),
            StoreError::NotEnoughSpace { .. } => Some("NOT_ENOUGH_SPACE"),
            StoreError::MismatchedObjVersion { .. }
            | StoreError::InvalidRequest(_)
            | StoreError::Format(_)
            | StoreError::Io(_)
            | StoreError::Serialization(_) => None,
        }
    }

    /// True when the underlying cause is a missing file or directory.
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
