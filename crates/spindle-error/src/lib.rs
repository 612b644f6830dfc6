use thiserror::Error;

/// Primary error type for SpindleDB operations.
///
/// Structured variants for every client-visible failure, plus the
/// recovery-time and system error classes. Client errors carry a stable
/// numeric [`ErrorCode`] so they can be reported over a wire protocol
/// without string matching.
#[derive(Error, Debug)]
pub enum SpindleError {
    // === Request validation ===
    /// Malformed request parameters (bad iterator type, bad key, ...).
    #[error("illegal parameters: {detail}")]
    IllegalParams { detail: String },

    /// A tuple's binary payload could not be decoded.
    #[error("invalid tuple data: {detail}")]
    InvalidTupleData { detail: String },

    /// Tuple does not match the space's exact field count.
    #[error("tuple field count {actual} does not match space field count {expected}")]
    ExactFieldCount { expected: u32, actual: u32 },

    /// A key field has the wrong type for its index part.
    #[error("field {field_no} has type {actual}, expected {expected}")]
    KeyFieldType {
        field_no: u32,
        expected: &'static str,
        actual: &'static str,
    },

    /// Key has more parts than the index defines.
    #[error("invalid key part count: expected at most {expected}, got {actual}")]
    KeyPartCount { expected: u32, actual: u32 },

    /// Request type byte unknown to the engine.
    #[error("unknown request type {ty}")]
    UnknownRequestType { ty: u32 },

    // === Access control ===
    /// The current user may not perform the operation.
    #[error("{action} access denied for user '{user}'")]
    AccessDenied { action: String, user: String },

    // === Schema objects ===
    /// Space does not exist.
    #[error("space '{space}' does not exist")]
    NoSuchSpace { space: String },

    /// Index does not exist in the given space.
    #[error("no index #{index} is defined in space '{space}'")]
    NoSuchIndex { index: u32, space: String },

    /// User or role does not exist.
    #[error("user '{user}' is not found")]
    NoSuchUser { user: String },

    /// Function does not exist.
    #[error("function '{name}' does not exist")]
    NoSuchFunction { name: String },

    /// Unknown object type in a privilege record.
    #[error("unknown object type '{object}'")]
    UnknownSchemaObject { object: String },

    // === Data errors ===
    /// Duplicate key in a unique index.
    #[error("duplicate key exists in unique index {index} in space '{space}'")]
    TupleFound { index: u32, space: String },

    /// A tuple required by the replace mode was not found.
    #[error("tuple doesn't exist in index {index} in space '{space}'")]
    TupleNotFound { index: u32, space: String },

    // === DDL errors ===
    /// Space creation failed.
    #[error("failed to create space '{name}': {detail}")]
    CreateSpace { name: String, detail: String },

    /// Space already exists.
    #[error("space '{name}' already exists")]
    SpaceExists { name: String },

    /// Space drop refused.
    #[error("can't drop space {id}: {detail}")]
    DropSpace { id: u32, detail: String },

    /// Space alter refused.
    #[error("can't modify space {id}: {detail}")]
    AlterSpace { id: u32, detail: String },

    /// Index type string unknown.
    #[error("unsupported index type supplied for index '{index}' in space '{space}'")]
    IndexType { index: String, space: String },

    /// Index definition fails engine constraints.
    #[error("can't create or modify index '{index}' in space '{space}': {detail}")]
    ModifyIndex {
        index: String,
        space: String,
        detail: String,
    },

    /// Dropping the primary key of a system space.
    #[error("can't drop the primary key in a system space, space id {id}")]
    LastDrop { id: u32 },

    /// Dropping the primary key while secondary indexes exist.
    #[error("can't drop primary key in space {id} while secondary keys exist")]
    DropPrimaryKey { id: u32 },

    /// User creation failed.
    #[error("failed to create user '{user}': {detail}")]
    CreateUser { user: String, detail: String },

    /// User drop refused.
    #[error("failed to drop user '{user}': {detail}")]
    DropUser { user: String, detail: String },

    /// Function creation failed.
    #[error("failed to create function '{name}': {detail}")]
    CreateFunction { name: String, detail: String },

    /// Function drop refused.
    #[error("failed to drop function {fid}: {detail}")]
    DropFunction { fid: u32, detail: String },

    // === Cluster ===
    /// A field expected to hold a UUID did not parse.
    #[error("invalid UUID: '{value}'")]
    InvalidUuid { value: String },

    /// The cluster UUID is read-only once set.
    #[error("cluster id is read-only")]
    ClusterIdIsRo,

    /// Server records cannot be deleted.
    #[error("server id is read-only")]
    ServerIdIsRo,

    /// Server id falls in the reserved band.
    #[error("server id {id} is reserved")]
    ServerIdIsReserved { id: u32 },

    /// A snapshot row belongs to a different engine.
    #[error("a multi-engine row in a memtx snapshot")]
    CrossEngine,

    /// A replica join was attempted with no snapshot on disk.
    #[error("can't find snapshot")]
    MissingSnapshot,

    // === Log errors ===
    /// Malformed snapshot or WAL record.
    #[error("log error: {detail}")]
    XlogError { detail: String },

    /// A gap between the snapshot vclock and the first available WAL.
    #[error("log gap: {detail}")]
    XlogGap { detail: String },

    // === System errors ===
    /// OS-level failure.
    #[error("system error: {0}")]
    System(#[from] std::io::Error),

    /// Allocation failure. The engine reserves slack so that rollback
    /// paths never see this.
    #[error("failed to allocate {amount} bytes in {allocator} for {object}")]
    OutOfMemory {
        amount: usize,
        allocator: &'static str,
        object: &'static str,
    },

    /// Synthetic cancellation marker. Must be re-raised when caught.
    #[error("fiber is cancelled")]
    FiberIsCancelled,

    /// A wait finished by timeout rather than completion.
    #[error("timed out")]
    Timeout,
}

/// Stable numeric codes for client-visible errors.
///
/// The values are part of the wire contract; append, never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Unknown = 0,
    IllegalParams = 1,
    MemoryIssue = 2,
    TupleFound = 3,
    TupleNotFound = 4,
    CreateSpace = 9,
    SpaceExists = 10,
    DropSpace = 11,
    AlterSpace = 12,
    IndexType = 13,
    ModifyIndex = 14,
    LastDrop = 15,
    DropPrimaryKey = 17,
    KeyPartCount = 19,
    InvalidTupleData = 20,
    KeyFieldType = 23,
    ExactFieldCount = 24,
    UnknownRequestType = 30,
    NoSuchSpace = 36,
    NoSuchIndex = 37,
    NoSuchUser = 38,
    NoSuchFunction = 39,
    UnknownSchemaObject = 40,
    AccessDenied = 42,
    CreateUser = 43,
    DropUser = 44,
    CreateFunction = 46,
    DropFunction = 47,
    InvalidUuid = 48,
    ClusterIdIsRo = 49,
    ServerIdIsRo = 50,
    ServerIdIsReserved = 51,
    CrossEngine = 52,
    MissingSnapshot = 53,
    XlogError = 60,
    XlogGap = 61,
    System = 62,
    FiberIsCancelled = 63,
    Timeout = 64,
}

impl SpindleError {
    /// Map this error to its stable numeric code.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::IllegalParams { .. } => ErrorCode::IllegalParams,
            Self::InvalidTupleData { .. } => ErrorCode::InvalidTupleData,
            Self::ExactFieldCount { .. } => ErrorCode::ExactFieldCount,
            Self::KeyFieldType { .. } => ErrorCode::KeyFieldType,
            Self::KeyPartCount { .. } => ErrorCode::KeyPartCount,
            Self::UnknownRequestType { .. } => ErrorCode::UnknownRequestType,
            Self::AccessDenied { .. } => ErrorCode::AccessDenied,
            Self::NoSuchSpace { .. } => ErrorCode::NoSuchSpace,
            Self::NoSuchIndex { .. } => ErrorCode::NoSuchIndex,
            Self::NoSuchUser { .. } => ErrorCode::NoSuchUser,
            Self::NoSuchFunction { .. } => ErrorCode::NoSuchFunction,
            Self::UnknownSchemaObject { .. } => ErrorCode::UnknownSchemaObject,
            Self::TupleFound { .. } => ErrorCode::TupleFound,
            Self::TupleNotFound { .. } => ErrorCode::TupleNotFound,
            Self::CreateSpace { .. } => ErrorCode::CreateSpace,
            Self::SpaceExists { .. } => ErrorCode::SpaceExists,
            Self::DropSpace { .. } => ErrorCode::DropSpace,
            Self::AlterSpace { .. } => ErrorCode::AlterSpace,
            Self::IndexType { .. } => ErrorCode::IndexType,
            Self::ModifyIndex { .. } => ErrorCode::ModifyIndex,
            Self::LastDrop { .. } => ErrorCode::LastDrop,
            Self::DropPrimaryKey { .. } => ErrorCode::DropPrimaryKey,
            Self::CreateUser { .. } => ErrorCode::CreateUser,
            Self::DropUser { .. } => ErrorCode::DropUser,
            Self::CreateFunction { .. } => ErrorCode::CreateFunction,
            Self::DropFunction { .. } => ErrorCode::DropFunction,
            Self::InvalidUuid { .. } => ErrorCode::InvalidUuid,
            Self::ClusterIdIsRo => ErrorCode::ClusterIdIsRo,
            Self::ServerIdIsRo => ErrorCode::ServerIdIsRo,
            Self::ServerIdIsReserved { .. } => ErrorCode::ServerIdIsReserved,
            Self::CrossEngine => ErrorCode::CrossEngine,
            Self::MissingSnapshot => ErrorCode::MissingSnapshot,
            Self::XlogError { .. } => ErrorCode::XlogError,
            Self::XlogGap { .. } => ErrorCode::XlogGap,
            Self::System(_) => ErrorCode::System,
            Self::OutOfMemory { .. } => ErrorCode::MemoryIssue,
            Self::FiberIsCancelled => ErrorCode::FiberIsCancelled,
            Self::Timeout => ErrorCode::Timeout,
        }
    }

    /// Whether the error is recoverable by the client without operator
    /// intervention. Log and system errors are not; every validation or
    /// DDL refusal is.
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::XlogError { .. }
                | Self::XlogGap { .. }
                | Self::System(_)
                | Self::OutOfMemory { .. }
        )
    }

    /// Whether the error is the synthetic cancellation marker, which by
    /// contract must be re-raised by any code that catches it.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::FiberIsCancelled)
    }

    /// Create an `IllegalParams` error.
    pub fn illegal_params(detail: impl Into<String>) -> Self {
        Self::IllegalParams {
            detail: detail.into(),
        }
    }

    /// Create an `AlterSpace` refusal.
    pub fn alter_space(id: u32, detail: impl Into<String>) -> Self {
        Self::AlterSpace {
            id,
            detail: detail.into(),
        }
    }

    /// Create a `ModifyIndex` refusal.
    pub fn modify_index(
        index: impl Into<String>,
        space: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::ModifyIndex {
            index: index.into(),
            space: space.into(),
            detail: detail.into(),
        }
    }

    /// Create an `XlogError`.
    pub fn xlog(detail: impl Into<String>) -> Self {
        Self::XlogError {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `SpindleError`.
pub type Result<T> = std::result::Result<T, SpindleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SpindleError::TupleFound {
            index: 1,
            space: "items".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "duplicate key exists in unique index 1 in space 'items'"
        );
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            SpindleError::illegal_params("x").code(),
            ErrorCode::IllegalParams
        );
        assert_eq!(
            SpindleError::DropPrimaryKey { id: 512 }.code(),
            ErrorCode::DropPrimaryKey
        );
        assert_eq!(SpindleError::ClusterIdIsRo.code(), ErrorCode::ClusterIdIsRo);
        assert_eq!(
            SpindleError::OutOfMemory {
                amount: 16384,
                allocator: "mempool",
                object: "extent",
            }
            .code(),
            ErrorCode::MemoryIssue
        );
    }

    #[test]
    fn recoverability() {
        assert!(SpindleError::AccessDenied {
            action: "Create or drop".to_owned(),
            user: "guest".to_owned(),
        }
        .is_recoverable());
        assert!(!SpindleError::xlog("truncated row").is_recoverable());
        assert!(!SpindleError::OutOfMemory {
            amount: 1,
            allocator: "mempool",
            object: "extent",
        }
        .is_recoverable());
    }

    #[test]
    fn cancellation_marker() {
        assert!(SpindleError::FiberIsCancelled.is_cancellation());
        assert!(!SpindleError::Timeout.is_cancellation());
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro fs");
        let err: SpindleError = io.into();
        assert!(matches!(err, SpindleError::System(_)));
        assert_eq!(err.code(), ErrorCode::System);
    }

    #[test]
    fn error_code_values_are_stable() {
        assert_eq!(ErrorCode::TupleFound as u32, 3);
        assert_eq!(ErrorCode::DropPrimaryKey as u32, 17);
        assert_eq!(ErrorCode::AccessDenied as u32, 42);
        assert_eq!(ErrorCode::XlogError as u32, 60);
    }
}
