use std::{error::Error, fmt, io, net::SocketAddr, time::Duration};

/// The collective module's result type.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Failures raised while bootstrapping or operating a process group.
#[derive(Debug)]
pub enum CollectiveErr {
    Io(io::Error),
    EmptyCohort,
    RankOutOfRange {
        rank: usize,
        world_size: usize,
    },
    DuplicateRank {
        rank: usize,
    },
    RendezvousTimeout {
        addr: SocketAddr,
        timeout: Duration,
    },
    WorldSizeMismatch {
        got: usize,
        expected: usize,
    },
    PayloadMismatch {
        got: usize,
        expected: usize,
    },
    UnexpectedFrame {
        got: u32,
        expected: &'static str,
    },
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveErr::Io(e) => write!(f, "io error: {e}"),
            CollectiveErr::EmptyCohort => write!(f, "world_size must be at least 1"),
            CollectiveErr::RankOutOfRange { rank, world_size } => {
                write!(f, "rank {rank} is out of range for world_size {world_size}")
            }
            CollectiveErr::DuplicateRank { rank } => {
                write!(f, "rank {rank} joined the rendezvous twice")
            }
            CollectiveErr::RendezvousTimeout { addr, timeout } => write!(
                f,
                "rendezvous at {addr} did not complete within {timeout:?}"
            ),
            CollectiveErr::WorldSizeMismatch { got, expected } => write!(
                f,
                "coordinator reported world_size {got}, this process expected {expected}"
            ),
            CollectiveErr::PayloadMismatch { got, expected } => write!(
                f,
                "tensor frame carries {got} elements, buffer holds {expected}"
            ),
            CollectiveErr::UnexpectedFrame { got, expected } => {
                write!(f, "unexpected frame kind {got}, expected {expected}")
            }
        }
    }
}

impl Error for CollectiveErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CollectiveErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectiveErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CollectiveErr> for io::Error {
    fn from(value: CollectiveErr) -> Self {
        match value {
            CollectiveErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
