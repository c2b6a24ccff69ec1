//! Typed errors for the reactor surface.
//!
//! Registration and timer failures are matchable so callers can tell a
//! capacity problem from a kernel one; socket helpers carry their context
//! through `anyhow` instead (see `net`).

use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Descriptor does not fit the loop's slot table.
    #[error("descriptor {fd} out of range (set size {set_size})")]
    OutOfRange { fd: RawFd, set_size: usize },

    /// A registered descriptor would no longer be representable at the
    /// requested capacity.
    #[error("cannot resize below highest registered descriptor {max_fd}")]
    ShrinkBelowMax { max_fd: RawFd },

    /// No live timer carries the given id.
    #[error("no timer with id {0}")]
    NoSuchTimer(u64),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
