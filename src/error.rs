// Component-boundary error types. Each component returns its own enum so
// callers can match on failure kind without downcasting; the binaries at
// the top convert these to log lines and exit codes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated input: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("bad magic bytes")]
    BadMagic,
    #[error("malformed field: {0}")]
    Malformed(&'static str),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PowError {
    #[error("hash does not satisfy target")]
    TargetNotMet,
    #[error("nonce space exhausted")]
    NonceExhausted,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record at offset {0}")]
    CorruptRecord(u64),
    #[error("index entry missing for hash")]
    IndexMiss,
    #[error("insufficient balance for sender {0}")]
    InsufficientBalance(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("block fails structural validation: {0}")]
    Validation(&'static str),
    #[error("parent block not found")]
    MissingParent,
    #[error("height discontinuity: expected {expected}, got {got}")]
    HeightDiscontinuity { expected: u32, got: u32 },
    #[error("difficulty mismatch: expected {expected}, got {got}")]
    DifficultyMismatch { expected: f64, got: f64 },
    #[error("timestamp not after parent")]
    TimestampNotMonotonic,
    #[error("timestamp too far in the future")]
    TimestampInFuture,
    #[error("insufficient balance for sender {0}")]
    InsufficientBalance(String),
    #[error("proof-of-work invalid")]
    InvalidPoW,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction already present")]
    Duplicate,
    #[error("signature verification failed")]
    BadSignature,
    #[error("double spend of ({0}, {1})")]
    DoubleSpend(String, u32),
    #[error("insufficient projected balance for {0}")]
    InsufficientBalance(String),
    #[error("transaction fails structural validation: {0}")]
    Validation(&'static str),
    #[error("mempool full and incoming fee density too low to evict")]
    Full,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds maximum size")]
    FrameTooLarge,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("peer banned")]
    Banned,
    #[error("chain id mismatch")]
    ChainIdMismatch,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request timed out")]
    Timeout,
    #[error("no peer selected")]
    NoPeer,
    #[error("header continuity gap: expected {expected}, got {got}")]
    HeaderGap { expected: u32, got: u32 },
    #[error("block at height {0} rejected by chain validation")]
    BlockRejected(u32),
    #[error("chain error: {0}")]
    Chain(#[from] StateError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}
