use std::collections::TryReserveError;
use std::{fmt, io};

use super::Guid;

/// Failures surfaced by the routing engine and its seams.
///
/// Routing failures are local to one sweep: the caller aborts the sweep,
/// keeps the previously committed tables, and retries on the next sweep.
/// None of these are grounds to take the subnet manager process down.
#[derive(Debug)]
pub enum Error {
    /// The discovered topology cannot be routed as configured.
    UnsupportedTopology(Unsupported),
    /// An allocation failed while building path trees, the dependency
    /// graph, or forwarding tables.
    ResourceExhausted,
    /// A handler referenced a GUID that is no longer in the registry,
    /// usually because it raced with a topology change. Treated as a no-op
    /// by handlers.
    InconsistentState(Guid),
    Io(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    /// The switch advertises no linear forwarding table support.
    NoLinearTable(Guid),
    /// Cycle-breaking needs more virtual lanes than the fabric provides.
    LanesExceeded { available: u8 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnsupportedTopology(Unsupported::NoLinearTable(guid)) => {
                write!(f, "switch {guid:#018x} has no linear forwarding table")
            }
            Error::UnsupportedTopology(Unsupported::LanesExceeded {
                available,
            }) => {
                write!(
                    f,
                    "cycle-breaking needs more than {available} virtual lanes"
                )
            }
            Error::ResourceExhausted => {
                write!(f, "allocation failed during routing computation")
            }
            Error::InconsistentState(guid) => {
                write!(f, "guid {guid:#018x} is not in the subnet registry")
            }
            Error::Io(e) => write!(f, "IO error: {e}"),
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

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::ResourceExhausted
    }
}

pub type Result<T> = std::result::Result<T, Error>;
