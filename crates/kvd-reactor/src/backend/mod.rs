//! Kernel readiness backends.
//!
//! One backend is compiled per target, first available in descending order
//! of performance: epoll on Linux, kqueue on the BSDs and macOS, select
//! elsewhere. All expose the same inherent API; the loop consumes a single
//! notification per descriptor per poll cycle and re-polls next iteration,
//! which normalizes edge- and level-triggered kernels to the same contract.

use crate::reactor::Mask;
use std::os::unix::io::RawFd;

/// One readiness delivery: descriptor plus the mask the kernel reported.
#[derive(Debug, Clone, Copy)]
pub struct Fired {
    pub fd: RawFd,
    pub mask: Mask,
}

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Poller;

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
mod select;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub use select::Poller;
