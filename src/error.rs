use thiserror::Error;

/// A feed row that could not be turned into a receipt. The row is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing or malformed field `{field}`")]
    Malformed { field: &'static str },
    #[error("unknown executor class {0:?}")]
    UnknownExecutorClass(String),
    #[error("bad time_started {0:?}")]
    BadTimestamp(String),
    #[error("bad time_took_us {0:?}")]
    BadDuration(String),
}

/// A well-formed receipt that failed identity or signature checks. The row is skipped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationError {
    #[error("receipt belongs to a different miner")]
    PeerMismatch,
    #[error("invalid miner signature")]
    BadMinerSignature,
    #[error("invalid validator signature")]
    BadValidatorSignature,
}

/// A peer could not be reached. Aborts the current call for that peer only.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("channel {0} is gone")]
    ChannelClosed(String),
    #[error("response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

/// The registry snapshot could not be fetched. Aborts the whole sync cycle.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("registry answered with status {0}")]
    Status(u16),
    #[error("registry snapshot is invalid: {0}")]
    Invalid(String),
}

/// The store rejected a read or write. Surfaced to the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
}

/// Failure of a whole scheduled cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Why a validator's signed request was refused. The messages are the
/// `detail` strings returned to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid Signing Timestamp")]
    InvalidTimestamp,
    #[error("Signature too old")]
    SignatureTooOld,
    #[error("No signature")]
    MissingSignature,
    #[error("ss58 address invalid")]
    InvalidAddress,
    #[error("Signature invalid")]
    InvalidSignature,
    #[error("Validator unknown")]
    UnknownValidator,
    #[error("Validator inactive")]
    InactiveValidator,
}

/// A batch of validator system events was not recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error(transparent)]
    Unauthenticated(#[from] AuthError),
    #[error("invalid event batch: {0}")]
    Invalid(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// A hardware snapshot could not be fetched, parsed or stored.
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("hardware request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("hardware source answered with status {0}")]
    Status(u16),
    #[error("hardware specs are invalid: {0}")]
    Invalid(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
