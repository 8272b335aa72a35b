use std::{fmt, io};

/// Errors surfaced by ring operations.
///
/// `CapacityTimeout` is the only recoverable kind; callers retry or back
/// off. `CorruptChain` and `ProtocolViolation` mean the shared segment no
/// longer upholds the protocol and the ring should not be used further.
#[derive(Debug)]
pub enum RingError {
    /// A bounded wait on `sem_avail` or `sem_signal` expired.
    CapacityTimeout,
    /// The payload needs more blocks than the ring can ever provide.
    OversizedMessage { blocks: u64, limit: u64 },
    /// A `next`/`prev` link is out of range or the chain never terminates.
    CorruptChain(String),
    /// A committed block contradicts the handshake (missing `done_write`,
    /// `size` beyond `block_size`, ...).
    ProtocolViolation(String),
    SharedMemory(shared_memory::ShmemError),
    /// raw_sync reports lock failures as boxed errors.
    Lock(Box<dyn std::error::Error + 'static>),
    Io(io::Error),
    Config(String),
    /// The process received a termination signal; the segment is no longer
    /// touched.
    Closing,
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::CapacityTimeout => write!(f, "wait deadline exceeded"),
            RingError::OversizedMessage { blocks, limit } => write!(
                f,
                "message needs {} blocks but the ring admits at most {}",
                blocks, limit
            ),
            RingError::CorruptChain(s) => write!(f, "corrupt block chain: {}", s),
            RingError::ProtocolViolation(s) => {
                write!(f, "shared segment protocol violation: {}", s)
            }
            RingError::SharedMemory(e) => write!(f, "shared memory error: {}", e),
            RingError::Lock(e) => write!(f, "cursor lock error: {}", e),
            RingError::Io(e) => write!(f, "IO error: {}", e),
            RingError::Config(s) => write!(f, "invalid ring configuration: {}", s),
            RingError::Closing => write!(f, "ring service is shutting down"),
        }
    }
}

impl std::error::Error for RingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RingError::SharedMemory(e) => Some(e),
            RingError::Lock(e) => Some(e.as_ref()),
            RingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<shared_memory::ShmemError> for RingError {
    fn from(err: shared_memory::ShmemError) -> Self {
        RingError::SharedMemory(err)
    }
}

impl From<io::Error> for RingError {
    fn from(err: io::Error) -> Self {
        RingError::Io(err)
    }
}
