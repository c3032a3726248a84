use std::{fmt, io};

#[derive(Debug)]
pub enum TransportError {
    /// No `ftbatchdone` within the batch deadline.
    Timeout { waited_ms: u64 },
    MalformedNotice(String),
    /// A notice referenced a job address that is not part of the batch.
    UnexpectedNotice(String),
    /// The remote finished the batch without confirming every job.
    JobsNotExecuted {
        /// First job not proven to have run. Write jobs carry no notice, so
        /// this is a lower bound: jobs after it may still have executed.
        first_unexecuted: usize,
        job_count: usize,
    },
    BatchTooLarge { jobs: usize, limit: usize },
    NoBeacon,
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { waited_ms } => write!(f, "no batch completion after {waited_ms} ms"),
            Self::MalformedNotice(raw) => write!(f, "malformed notice `{raw}`"),
            Self::UnexpectedNotice(raw) => write!(f, "notice for unknown job `{raw}`"),
            Self::JobsNotExecuted {
                first_unexecuted,
                job_count,
            } => write!(
                f,
                "remote did not confirm jobs {first_unexecuted}..{job_count} of the batch"
            ),
            Self::BatchTooLarge { jobs, limit } => {
                write!(f, "batch of {jobs} jobs exceeds the remote limit of {limit}")
            }
            Self::NoBeacon => write!(f, "no handshake beacon from remote"),
            Self::Io(err) => write!(f, "serial i/o failed: {err}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptVolume {
    BadSignature { sector: u32 },
    UnsupportedSectorSize(u16),
    UnsupportedSectorsPerCluster(u8),
    BadGeometry(&'static str),
    RootOutOfRange(u32),
    ChainCycle { start: u32 },
    DanglingPointer { cluster: u32, value: u32 },
    BadCluster { cluster: u32 },
    ChainTooShort { start: u32, clusters: usize, size: u32 },
}

impl fmt::Display for CorruptVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSignature { sector } => write!(f, "no 55AA signature in sector {sector}"),
            Self::UnsupportedSectorSize(size) => write!(f, "unsupported sector size {size}"),
            Self::UnsupportedSectorsPerCluster(spc) => {
                write!(f, "unsupported sectors per cluster {spc}")
            }
            Self::BadGeometry(what) => write!(f, "bad volume geometry: {what}"),
            Self::RootOutOfRange(cluster) => {
                write!(f, "root directory cluster {cluster} out of range")
            }
            Self::ChainCycle { start } => write!(f, "cluster chain from {start} loops"),
            Self::DanglingPointer { cluster, value } => {
                write!(f, "cluster {cluster} points at invalid entry ${value:08x}")
            }
            Self::BadCluster { cluster } => write!(f, "chain runs into bad cluster {cluster}"),
            Self::ChainTooShort {
                start,
                clusters,
                size,
            } => write!(
                f,
                "chain from {start} has {clusters} clusters, too short for {size} bytes"
            ),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Transport(TransportError),
    CorruptVolume(CorruptVolume),
    InsufficientSpace { needed: u32, available: u32 },
    NotFound(String),
    AlreadyExists(String),
    InvalidName(String),
    /// No free or deleted slot left in the directory; callers grow it.
    DirectoryFull,
    ClusterOutOfRange { cluster: u32, max: u32 },
    LocalIo(io::Error),
    Interrupted,
}

impl Error {
    /// Only a corrupt volume invalidates the session; everything else is
    /// reported and the session carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptVolume(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::CorruptVolume(err) => write!(f, "corrupt volume: {err}"),
            Self::InsufficientSpace { needed, available } => write!(
                f,
                "insufficient space: need {needed} clusters, {available} free"
            ),
            Self::NotFound(name) => write!(f, "{name}: not found"),
            Self::AlreadyExists(name) => write!(f, "{name}: already exists"),
            Self::InvalidName(name) => write!(f, "{name}: not a valid 8.3 name"),
            Self::DirectoryFull => write!(f, "directory is full"),
            Self::ClusterOutOfRange { cluster, max } => {
                write!(f, "cluster {cluster} outside 2..={max}")
            }
            Self::LocalIo(err) => write!(f, "local i/o error: {err}"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::LocalIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<CorruptVolume> for Error {
    fn from(value: CorruptVolume) -> Self {
        Self::CorruptVolume(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::LocalIo(value)
    }
}
