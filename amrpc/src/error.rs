//! Error types for amrpc.
//!
//! Only recoverable conditions are represented here. Protocol invariant
//! violations (double completion replies, duplicate reassembly finalization,
//! firing an unobserved future slot) indicate a broken peer or a broken
//! caller and panic after logging; they never surface as [`Error`] values.

use std::io;

use crate::fabric::Rank;

/// Recoverable runtime errors.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying fabric.
    Io(io::Error),
    /// Destination rank does not exist in this job.
    InvalidRank(Rank),
    /// Command block exceeds what the rendezvous path can carry.
    MessageTooLarge { size: usize, max: usize },
    /// One-sided access falls outside the destination segment.
    SegmentOutOfBounds { offset: usize, len: usize, segment: usize },
    /// Fabric cannot accept more in-flight sends right now.
    FabricBusy,
    /// The operation was cancelled before completing.
    Cancelled,
    /// The runtime has already been shut down.
    ShutDown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidRank(r) => write!(f, "Rank {} does not exist", r),
            Error::MessageTooLarge { size, max } => {
                write!(f, "Message of {} bytes exceeds maximum {}", size, max)
            }
            Error::SegmentOutOfBounds { offset, len, segment } => write!(
                f,
                "Access of {} bytes at offset {} exceeds segment of {} bytes",
                len, offset, segment
            ),
            Error::FabricBusy => write!(f, "Fabric send queue is full"),
            Error::Cancelled => write!(f, "Operation was cancelled"),
            Error::ShutDown => write!(f, "Runtime has been shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Abort on a broken protocol invariant.
///
/// Reached only from states no well-formed peer or caller can produce, so
/// there is nothing to return to.
#[cold]
pub(crate) fn protocol_fatal(msg: &str) -> ! {
    log::error!("protocol violation: {}", msg);
    panic!("protocol violation: {}", msg);
}

/// Result type for amrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
