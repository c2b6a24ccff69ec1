//! Single-threaded event-driven runtime for kvd.
//!
//! Everything here runs on one thread: the reactor drives a platform
//! readiness backend, sequences file and timer callbacks, and the support
//! structures (socket helpers, bounded lists, the slow log) assume the same
//! cooperative execution model. There are no locks because there is no
//! cross-thread mutation.

pub mod backend;
pub mod clock;
pub mod error;
pub mod list;
pub mod net;
pub mod reactor;
pub mod slowlog;

pub use error::{Error, Result};
pub use list::{Cursor, Direction, List, NodeId};
pub use reactor::{
    wait_for, EventLoop, FileHandler, Flags, Mask, SharedFileHandler, SharedTimerHandler,
    SleepHook, TimerAction, TimerHandler,
};
pub use slowlog::{SlowLog, SlowLogEntry};
