use thiserror::Error;

use crate::txn::TxnState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Database,
    Table,
    Segment,
    Block,
    Column,
    Index,
    Shard,
    Replica,
    Row,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Database => write!(f, "database"),
            EntityKind::Table => write!(f, "table"),
            EntityKind::Segment => write!(f, "segment"),
            EntityKind::Block => write!(f, "block"),
            EntityKind::Column => write!(f, "column"),
            EntityKind::Index => write!(f, "index"),
            EntityKind::Shard => write!(f, "shard"),
            EntityKind::Replica => write!(f, "replica"),
            EntityKind::Row => write!(f, "row"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    Io,
    Encode,
    Decode,
    InvalidConfig,
    InvalidRequest,
    NotFound,
    Duplicate,
    NotPermitted,
    Conflict,
    Timeout,
    TxnClosed,
    TxnNotActive,
    TxnCannotRollback,
    TxnNotCommitting,
    TxnNotRollbacking,
    NotLeaseHolder,
    LsnAlreadyTruncated,
    OutOfRange,
    Internal,
}

impl StoreErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorCode::Io => "io",
            StoreErrorCode::Encode => "encode",
            StoreErrorCode::Decode => "decode",
            StoreErrorCode::InvalidConfig => "invalid_config",
            StoreErrorCode::InvalidRequest => "invalid_request",
            StoreErrorCode::NotFound => "not_found",
            StoreErrorCode::Duplicate => "duplicate",
            StoreErrorCode::NotPermitted => "not_permitted",
            StoreErrorCode::Conflict => "conflict",
            StoreErrorCode::Timeout => "timeout",
            StoreErrorCode::TxnClosed => "txn_closed",
            StoreErrorCode::TxnNotActive => "txn_not_active",
            StoreErrorCode::TxnCannotRollback => "txn_cannot_rollback",
            StoreErrorCode::TxnNotCommitting => "txn_not_committing",
            StoreErrorCode::TxnNotRollbacking => "txn_not_rollbacking",
            StoreErrorCode::NotLeaseHolder => "not_lease_holder",
            StoreErrorCode::LsnAlreadyTruncated => "lsn_already_truncated",
            StoreErrorCode::OutOfRange => "out_of_range",
            StoreErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{entity} '{name}' not found")]
    NotFound { entity: EntityKind, name: String },
    #[error("{entity} '{name}' already exists")]
    Duplicate { entity: EntityKind, name: String },
    #[error("not permitted: {0}")]
    NotPermitted(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("transaction is closed")]
    TxnClosed,
    #[error("transaction not active (state {state:?})")]
    TxnNotActive { state: TxnState },
    #[error("transaction cannot rollback from state {state:?}")]
    TxnCannotRollback { state: TxnState },
    #[error("transaction not committing (state {state:?})")]
    TxnNotCommitting { state: TxnState },
    #[error("transaction not rollbacking (state {state:?})")]
    TxnNotRollbacking { state: TxnState },
    #[error("shard {shard_id}: append by dn {requester} but lease held by dn {holder}")]
    NotLeaseHolder {
        shard_id: u64,
        holder: u64,
        requester: u64,
    },
    #[error("shard {shard_id}: lsn {lsn} at or below truncation point {truncated}")]
    LsnAlreadyTruncated {
        shard_id: u64,
        lsn: u64,
        truncated: u64,
    },
    #[error("out of range: {0}")]
    OutOfRange(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn code(&self) -> StoreErrorCode {
        match self {
            StoreError::Io(_) => StoreErrorCode::Io,
            StoreError::Encode(_) => StoreErrorCode::Encode,
            StoreError::Decode(_) => StoreErrorCode::Decode,
            StoreError::InvalidConfig { .. } => StoreErrorCode::InvalidConfig,
            StoreError::InvalidRequest(_) => StoreErrorCode::InvalidRequest,
            StoreError::NotFound { .. } => StoreErrorCode::NotFound,
            StoreError::Duplicate { .. } => StoreErrorCode::Duplicate,
            StoreError::NotPermitted(_) => StoreErrorCode::NotPermitted,
            StoreError::Conflict(_) => StoreErrorCode::Conflict,
            StoreError::Timeout => StoreErrorCode::Timeout,
            StoreError::TxnClosed => StoreErrorCode::TxnClosed,
            StoreError::TxnNotActive { .. } => StoreErrorCode::TxnNotActive,
            StoreError::TxnCannotRollback { .. } => StoreErrorCode::TxnCannotRollback,
            StoreError::TxnNotCommitting { .. } => StoreErrorCode::TxnNotCommitting,
            StoreError::TxnNotRollbacking { .. } => StoreErrorCode::TxnNotRollbacking,
            StoreError::NotLeaseHolder { .. } => StoreErrorCode::NotLeaseHolder,
            StoreError::LsnAlreadyTruncated { .. } => StoreErrorCode::LsnAlreadyTruncated,
            StoreError::OutOfRange(_) => StoreErrorCode::OutOfRange,
            StoreError::Internal(_) => StoreErrorCode::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True for failures the 2PC coordinator may retry with the same
    /// commit timestamp instead of rolling back.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout | StoreError::NotLeaseHolder { .. } | StoreError::Io(_)
        )
    }
}
