use std::{error::Error, fmt, io};

use collective::CollectiveErr;
use seg_core::SegErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Collective(CollectiveErr),
    Training(SegErr),
    Config(String),
    DeviceUnavailable {
        ordinal: usize,
        available: usize,
    },
    LabelShape {
        got: usize,
    },
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Collective(e) => write!(f, "collective error: {e}"),
            WorkerErr::Training(e) => write!(f, "training error: {e}"),
            WorkerErr::Config(msg) => write!(f, "invalid configuration: {msg}"),
            WorkerErr::DeviceUnavailable { ordinal, available } => write!(
                f,
                "device ordinal {ordinal} does not exist on this host ({available} available)"
            ),
            WorkerErr::LabelShape { got } => write!(
                f,
                "label tensor has a non-singleton channel dimension of {got}"
            ),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Collective(e) => Some(e),
            WorkerErr::Training(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<CollectiveErr> for WorkerErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

impl From<SegErr> for WorkerErr {
    fn from(value: SegErr) -> Self {
        Self::Training(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
