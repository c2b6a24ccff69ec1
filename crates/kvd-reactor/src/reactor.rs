//! Single-threaded readiness reactor.
//!
//! Owns a dense per-descriptor registration table and an unordered timer
//! chain, drives the platform backend, and sequences handler callbacks.
//! Everything runs on one thread: handlers may freely register and
//! unregister descriptors and timers, including the one currently firing.
//!
//! ## Dispatch order
//! Within a cycle, readable runs before writable unless the registration
//! carries [`Mask::BARRIER`], which inverts the pair; matured timers run
//! after all file events. A registrant that passes one handler object for
//! both sides is invoked at most once per cycle.

use crate::backend::{Fired, Poller};
use crate::clock;
use crate::error::{Error, Result};
use crate::list::{Direction, List};
use std::cell::RefCell;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::warn;

// ─── Masks and flags ─────────────────────────────────────────────────────────

/// Per-descriptor interest/readiness bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Mask = Mask(0);
    pub const READABLE: Mask = Mask(1);
    pub const WRITABLE: Mask = Mask(2);
    /// Invert dispatch for this descriptor: writable before readable.
    /// Only meaningful together with WRITABLE.
    pub const BARRIER: Mask = Mask(4);

    pub fn contains(self, other: Mask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Mask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn without(self, other: Mask) -> Mask {
        Mask(self.0 & !other.0)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Mask {
    type Output = Mask;
    fn bitand(self, rhs: Mask) -> Mask {
        Mask(self.0 & rhs.0)
    }
}

impl std::fmt::Debug for Mask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return write!(f, "NONE");
        }
        let mut bits = Vec::new();
        if self.intersects(Mask::READABLE) {
            bits.push("R");
        }
        if self.intersects(Mask::WRITABLE) {
            bits.push("W");
        }
        if self.intersects(Mask::BARRIER) {
            bits.push("B");
        }
        write!(f, "{}", bits.join("|"))
    }
}

/// What one `process_events` call is allowed to do.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Flags(u8);

impl Flags {
    pub const FILE_EVENTS: Flags = Flags(1);
    pub const TIME_EVENTS: Flags = Flags(2);
    pub const ALL_EVENTS: Flags = Flags(1 | 2);
    /// Never block in the backend, regardless of pending timers.
    pub const DONT_WAIT: Flags = Flags(4);
    pub const CALL_BEFORE_SLEEP: Flags = Flags(8);
    pub const CALL_AFTER_SLEEP: Flags = Flags(16);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

// ─── Handler capabilities ────────────────────────────────────────────────────

/// Capability a registrant implements for a descriptor. Register the same
/// object for both sides to get the invoked-once-per-cycle guarantee; the
/// loop compares handler identity, not function pointers.
pub trait FileHandler {
    fn readable(&mut self, el: &mut EventLoop, fd: RawFd, mask: Mask) {
        let _ = (el, fd, mask);
    }

    fn writable(&mut self, el: &mut EventLoop, fd: RawFd, mask: Mask) {
        let _ = (el, fd, mask);
    }
}

pub type SharedFileHandler = Rc<RefCell<dyn FileHandler>>;

/// What a timer handler wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Fire again after this many milliseconds.
    Rearm(u64),
    /// One-shot: mark the timer deleted.
    Done,
}

pub trait TimerHandler {
    fn fire(&mut self, el: &mut EventLoop, id: u64) -> TimerAction;

    /// Invoked once at physical removal of the timer node.
    fn finalize(&mut self, el: &mut EventLoop) {
        let _ = el;
    }
}

impl<F> TimerHandler for F
where
    F: FnMut(&mut EventLoop, u64) -> TimerAction,
{
    fn fire(&mut self, el: &mut EventLoop, id: u64) -> TimerAction {
        self(el, id)
    }
}

pub type SharedTimerHandler = Rc<RefCell<dyn TimerHandler>>;

/// Hook run immediately around the backend sleep.
pub type SleepHook = Box<dyn FnMut(&mut EventLoop)>;

// ─── Loop state ──────────────────────────────────────────────────────────────

/// Id a logically-deleted timer carries until the dispatcher reclaims it.
const DELETED_TIMER_ID: u64 = u64::MAX;

struct FileEvent {
    mask: Mask,
    reader: Option<SharedFileHandler>,
    writer: Option<SharedFileHandler>,
}

impl FileEvent {
    fn unused() -> Self {
        Self { mask: Mask::NONE, reader: None, writer: None }
    }
}

struct TimeEvent {
    id: u64,
    when_sec: i64,
    when_ms: i64,
    handler: SharedTimerHandler,
    /// Held nonzero while the handler is on the stack; physical removal
    /// waits for it to drop back to zero.
    refcount: u32,
}

pub struct EventLoop {
    events: Vec<FileEvent>,
    fired: Vec<Fired>,
    max_fd: RawFd,
    timers: List<TimeEvent>,
    next_timer_id: u64,
    last_wall_secs: i64,
    stop: bool,
    dont_wait: bool,
    before_sleep: Option<SleepHook>,
    after_sleep: Option<SleepHook>,
    poller: Poller,
}

impl EventLoop {
    /// A loop able to watch descriptors in `[0, set_size)`.
    pub fn new(set_size: usize) -> Result<Self> {
        let poller = Poller::new(set_size)?;
        Ok(Self {
            events: (0..set_size).map(|_| FileEvent::unused()).collect(),
            fired: Vec::with_capacity(set_size),
            max_fd: -1,
            timers: List::new(),
            next_timer_id: 0,
            last_wall_secs: clock::unix_seconds(),
            stop: false,
            dont_wait: false,
            before_sleep: None,
            after_sleep: None,
            poller,
        })
    }

    pub fn set_size(&self) -> usize {
        self.events.len()
    }

    pub fn backend_name(&self) -> &'static str {
        self.poller.name()
    }

    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    /// Grow or shrink the slot table. Fails without side effects while a
    /// descriptor at or above the requested capacity is registered.
    pub fn resize(&mut self, set_size: usize) -> Result<()> {
        if set_size == self.events.len() {
            return Ok(());
        }
        if self.max_fd >= set_size as RawFd {
            return Err(Error::ShrinkBelowMax { max_fd: self.max_fd });
        }
        self.poller.resize(set_size)?;
        self.events.resize_with(set_size, FileEvent::unused);
        Ok(())
    }

    /// Request exit from `run` at the next iteration boundary. Only
    /// meaningful from within a handler on the loop's thread.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    /// Sticky zero-timeout mode for the backend poll.
    pub fn set_dont_wait(&mut self, dont_wait: bool) {
        self.dont_wait = dont_wait;
    }

    pub fn set_before_sleep(&mut self, hook: Option<SleepHook>) {
        self.before_sleep = hook;
    }

    pub fn set_after_sleep(&mut self, hook: Option<SleepHook>) {
        self.after_sleep = hook;
    }

    // ─── File events ─────────────────────────────────────────────────────

    /// Watch `fd` for `mask` and attach `handler` to the requested sides.
    /// The backend is updated first; on failure the stored mask is
    /// untouched.
    pub fn register_file(&mut self, fd: RawFd, mask: Mask, handler: SharedFileHandler) -> Result<()> {
        if fd < 0 || fd as usize >= self.events.len() {
            return Err(Error::OutOfRange { fd, set_size: self.events.len() });
        }
        let old = self.events[fd as usize].mask;
        self.poller.add(fd, old, mask)?;
        let slot = &mut self.events[fd as usize];
        slot.mask |= mask;
        if mask.intersects(Mask::READABLE) {
            slot.reader = Some(handler.clone());
        }
        if mask.intersects(Mask::WRITABLE) {
            slot.writer = Some(handler);
        }
        if fd > self.max_fd {
            self.max_fd = fd;
        }
        Ok(())
    }

    /// Stop watching the given bits. Idempotent; removing WRITABLE also
    /// removes BARRIER. No handler is invoked.
    pub fn unregister_file(&mut self, fd: RawFd, mask: Mask) {
        if fd < 0 || fd as usize >= self.events.len() {
            return;
        }
        let old = self.events[fd as usize].mask;
        if old.is_none() {
            return;
        }
        let mut mask = mask;
        if mask.intersects(Mask::WRITABLE) {
            mask |= Mask::BARRIER;
        }
        if let Err(e) = self.poller.del(fd, old, mask) {
            warn!(fd, error = %e, "backend del failed");
        }
        let slot = &mut self.events[fd as usize];
        slot.mask = old.without(mask);
        if !slot.mask.intersects(Mask::READABLE) {
            slot.reader = None;
        }
        if !slot.mask.intersects(Mask::WRITABLE) {
            slot.writer = None;
        }
        if slot.mask.is_none() && fd == self.max_fd {
            let mut j = self.max_fd - 1;
            while j >= 0 && self.events[j as usize].mask.is_none() {
                j -= 1;
            }
            self.max_fd = j;
        }
    }

    /// Bits currently registered for `fd`.
    pub fn file_mask(&self, fd: RawFd) -> Mask {
        if fd < 0 || fd as usize >= self.events.len() {
            return Mask::NONE;
        }
        self.events[fd as usize].mask
    }

    // ─── Timers ──────────────────────────────────────────────────────────

    /// Schedule `handler` to fire `delay_ms` milliseconds from now. The
    /// node goes at the head of the chain; the chain is unordered and the
    /// nearest-deadline lookup is a linear scan, which stays cheap at the
    /// timer counts this loop carries.
    pub fn create_timer(&mut self, delay_ms: u64, handler: SharedTimerHandler) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let (when_sec, when_ms) = clock::after_ms(delay_ms);
        self.timers.push_front(TimeEvent { id, when_sec, when_ms, handler, refcount: 0 });
        id
    }

    /// Logically delete a timer. The node is reclaimed (and its finalize
    /// hook runs) on a later dispatch walk once no handler holds it.
    pub fn delete_timer(&mut self, id: u64) -> Result<()> {
        let mut cur = self.timers.cursor(Direction::HeadToTail);
        while let Some(node) = cur.next(&self.timers) {
            if let Some(te) = self.timers.get_mut(node) {
                if te.id == id {
                    te.id = DELETED_TIMER_ID;
                    return Ok(());
                }
            }
        }
        Err(Error::NoSuchTimer(id))
    }

    fn nearest_timer_deadline(&self) -> Option<(i64, i64)> {
        let mut nearest: Option<(i64, i64)> = None;
        let mut cur = self.timers.cursor(Direction::HeadToTail);
        while let Some(node) = cur.next(&self.timers) {
            if let Some(te) = self.timers.get(node) {
                let when = (te.when_sec, te.when_ms);
                if nearest.map_or(true, |n| when < n) {
                    nearest = Some(when);
                }
            }
        }
        nearest
    }

    fn process_time_events(&mut self) -> usize {
        let mut processed = 0;

        // Clock moved backward: firing everything early beats delaying it
        // indefinitely, so force every deadline due.
        let now_secs = clock::unix_seconds();
        if now_secs < self.last_wall_secs {
            let mut cur = self.timers.cursor(Direction::HeadToTail);
            while let Some(node) = cur.next(&self.timers) {
                if let Some(te) = self.timers.get_mut(node) {
                    te.when_sec = 0;
                }
            }
        }
        self.last_wall_secs = now_secs;

        // Timers registered by handlers during this walk carry ids past
        // this snapshot and wait for the next cycle. Head insertion makes
        // the check redundant today; kept against a change of insertion
        // policy.
        let max_id = self.next_timer_id.wrapping_sub(1);

        let mut cur = self.timers.cursor(Direction::HeadToTail);
        while let Some(node) = cur.next(&self.timers) {
            let (id, when_sec, when_ms, refcount) = match self.timers.get(node) {
                Some(te) => (te.id, te.when_sec, te.when_ms, te.refcount),
                None => continue,
            };

            if id == DELETED_TIMER_ID {
                if refcount > 0 {
                    continue;
                }
                if let Some(te) = self.timers.remove(node) {
                    te.handler.borrow_mut().finalize(self);
                }
                continue;
            }

            if id > max_id {
                continue;
            }

            let (now_sec, now_ms) = clock::now();
            if now_sec > when_sec || (now_sec == when_sec && now_ms >= when_ms) {
                let handler = match self.timers.get_mut(node) {
                    Some(te) => {
                        te.refcount += 1;
                        te.handler.clone()
                    }
                    None => continue,
                };
                let action = handler.borrow_mut().fire(self, id);
                processed += 1;
                if let Some(te) = self.timers.get_mut(node) {
                    te.refcount -= 1;
                    match action {
                        TimerAction::Rearm(ms) => {
                            let (sec, msec) = clock::after_ms(ms);
                            te.when_sec = sec;
                            te.when_ms = msec;
                        }
                        TimerAction::Done => te.id = DELETED_TIMER_ID,
                    }
                }
            }
        }
        processed
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    fn wants(&self, idx: usize, delivered: Mask, bit: Mask) -> bool {
        self.events
            .get(idx)
            .map_or(false, |s| (s.mask & delivered).intersects(bit))
    }

    fn reader_of(&self, idx: usize) -> Option<SharedFileHandler> {
        self.events.get(idx).and_then(|s| s.reader.clone())
    }

    fn writer_of(&self, idx: usize) -> Option<SharedFileHandler> {
        self.events.get(idx).and_then(|s| s.writer.clone())
    }

    /// Whether the two sides are backed by different handler objects.
    fn handlers_distinct(&self, idx: usize) -> bool {
        match self.events.get(idx) {
            Some(FileEvent { reader: Some(r), writer: Some(w), .. }) => !Rc::ptr_eq(r, w),
            _ => true,
        }
    }

    fn run_before_sleep(&mut self) {
        if let Some(mut hook) = self.before_sleep.take() {
            hook(self);
            if self.before_sleep.is_none() {
                self.before_sleep = Some(hook);
            }
        }
    }

    fn run_after_sleep(&mut self) {
        if let Some(mut hook) = self.after_sleep.take() {
            hook(self);
            if self.after_sleep.is_none() {
                self.after_sleep = Some(hook);
            }
        }
    }

    /// One dispatch cycle: compute the sleep budget, poll the backend, fire
    /// ready file events, then matured timers. Returns the number of
    /// handler invocations.
    pub fn process_events(&mut self, flags: Flags) -> usize {
        let mut processed = 0;

        if !flags.intersects(Flags::ALL_EVENTS) {
            return 0;
        }

        // Poll even with no descriptors registered when timer processing
        // may block, so the sleep lands exactly on the next deadline.
        if self.max_fd != -1
            || (flags.contains(Flags::TIME_EVENTS) && !flags.contains(Flags::DONT_WAIT))
        {
            let mut timeout: Option<Duration> = None;
            let mut budgeted = false;
            if flags.contains(Flags::TIME_EVENTS) && !flags.contains(Flags::DONT_WAIT) {
                if let Some((when_sec, when_ms)) = self.nearest_timer_deadline() {
                    let (now_sec, now_ms) = clock::now();
                    let ms = (when_sec - now_sec) * 1000 + (when_ms - now_ms);
                    timeout = Some(Duration::from_millis(ms.max(0) as u64));
                    budgeted = true;
                }
            }
            if !budgeted && flags.contains(Flags::DONT_WAIT) {
                timeout = Some(Duration::ZERO);
            }
            if self.dont_wait {
                timeout = Some(Duration::ZERO);
            }

            if flags.contains(Flags::CALL_BEFORE_SLEEP) {
                self.run_before_sleep();
            }

            let mut fired = std::mem::take(&mut self.fired);
            let n = match self.poller.poll(timeout, &mut fired) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "backend poll failed");
                    0
                }
            };
            self.fired = fired;

            if flags.contains(Flags::CALL_AFTER_SLEEP) {
                self.run_after_sleep();
            }

            for j in 0..n {
                let Fired { fd, mask } = match self.fired.get(j) {
                    Some(f) => *f,
                    None => break,
                };
                let idx = fd as usize;
                let invert = self
                    .events
                    .get(idx)
                    .map_or(false, |s| s.mask.intersects(Mask::BARRIER));
                let mut fired_count = 0;

                // The stored event is re-read before every call: a handler
                // that already ran may have unregistered or replaced what
                // the kernel reported on.
                if !invert && self.wants(idx, mask, Mask::READABLE) {
                    if let Some(h) = self.reader_of(idx) {
                        h.borrow_mut().readable(self, fd, mask);
                        fired_count += 1;
                    }
                }

                if self.wants(idx, mask, Mask::WRITABLE)
                    && (fired_count == 0 || self.handlers_distinct(idx))
                {
                    if let Some(h) = self.writer_of(idx) {
                        h.borrow_mut().writable(self, fd, mask);
                        fired_count += 1;
                    }
                }

                if invert
                    && self.wants(idx, mask, Mask::READABLE)
                    && (fired_count == 0 || self.handlers_distinct(idx))
                {
                    if let Some(h) = self.reader_of(idx) {
                        h.borrow_mut().readable(self, fd, mask);
                        fired_count += 1;
                    }
                }

                processed += fired_count;
            }
        }

        if flags.contains(Flags::TIME_EVENTS) {
            processed += self.process_time_events();
        }

        processed
    }

    /// Drive `process_events` until a handler calls [`EventLoop::stop`].
    pub fn run(&mut self) {
        self.stop = false;
        while !self.stop {
            self.process_events(
                Flags::ALL_EVENTS | Flags::CALL_BEFORE_SLEEP | Flags::CALL_AFTER_SLEEP,
            );
        }
    }
}

/// Block up to `timeout_ms` for `fd` to match `mask`, outside any loop.
/// Returns the ready bits, `Mask::NONE` on timeout.
pub fn wait_for(fd: RawFd, mask: Mask, timeout_ms: i64) -> io::Result<Mask> {
    let mut pfd = libc::pollfd { fd, events: 0, revents: 0 };
    if mask.intersects(Mask::READABLE) {
        pfd.events |= libc::POLLIN;
    }
    if mask.intersects(Mask::WRITABLE) {
        pfd.events |= libc::POLLOUT;
    }
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms as libc::c_int) };
    match rc {
        1 => {
            let mut out = Mask::NONE;
            if pfd.revents & libc::POLLIN != 0 {
                out |= Mask::READABLE;
            }
            if pfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) != 0 {
                out |= Mask::WRITABLE;
            }
            Ok(out)
        }
        0 => Ok(Mask::NONE),
        _ => Err(io::Error::last_os_error()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    /// Unnamed pipe; both ends closed on drop.
    struct Pipe {
        read: RawFd,
        write: RawFd,
    }

    impl Pipe {
        fn new() -> Self {
            let mut fds = [0 as RawFd; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            Self { read: fds[0], write: fds[1] }
        }

        fn feed(&self, data: &[u8]) {
            let n = unsafe {
                libc::write(self.write, data.as_ptr() as *const libc::c_void, data.len())
            };
            assert_eq!(n, data.len() as isize);
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read);
                libc::close(self.write);
            }
        }
    }

    /// Connected stream pair; writable immediately, readable once fed.
    struct SocketPair {
        a: RawFd,
        b: RawFd,
    }

    impl SocketPair {
        fn new() -> Self {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe {
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
            };
            assert_eq!(rc, 0);
            Self { a: fds[0], b: fds[1] }
        }

        fn feed_a(&self, data: &[u8]) {
            let n = unsafe {
                libc::write(self.b, data.as_ptr() as *const libc::c_void, data.len())
            };
            assert_eq!(n, data.len() as isize);
        }
    }

    impl Drop for SocketPair {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.a);
                libc::close(self.b);
            }
        }
    }

    type CallLog = Rc<RefCell<Vec<(&'static str, RawFd, Mask)>>>;

    struct Recorder {
        log: CallLog,
        stop_after: bool,
    }

    impl Recorder {
        fn shared(log: CallLog) -> SharedFileHandler {
            Rc::new(RefCell::new(Recorder { log, stop_after: false }))
        }
    }

    impl FileHandler for Recorder {
        fn readable(&mut self, el: &mut EventLoop, fd: RawFd, mask: Mask) {
            self.log.borrow_mut().push(("r", fd, mask));
            if self.stop_after {
                el.stop();
            }
        }

        fn writable(&mut self, el: &mut EventLoop, fd: RawFd, mask: Mask) {
            self.log.borrow_mut().push(("w", fd, mask));
            if self.stop_after {
                el.stop();
            }
        }
    }

    fn timer_log() -> Rc<RefCell<Vec<u64>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn recording_timer(log: Rc<RefCell<Vec<u64>>>) -> SharedTimerHandler {
        Rc::new(RefCell::new(move |_el: &mut EventLoop, id: u64| {
            log.borrow_mut().push(id);
            TimerAction::Done
        }))
    }

    #[test]
    fn test_register_unregister_round_trip() {
        let mut el = EventLoop::new(128).unwrap();
        let pipe = Pipe::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));

        assert_eq!(el.file_mask(pipe.read), Mask::NONE);
        el.register_file(pipe.read, Mask::READABLE, Recorder::shared(log))
            .unwrap();
        assert_eq!(el.file_mask(pipe.read), Mask::READABLE);
        assert_eq!(el.max_fd(), pipe.read);

        el.unregister_file(pipe.read, Mask::READABLE);
        assert_eq!(el.file_mask(pipe.read), Mask::NONE);
        assert_eq!(el.max_fd(), -1);

        // Idempotent: a second unregister changes nothing.
        el.unregister_file(pipe.read, Mask::READABLE);
        assert_eq!(el.file_mask(pipe.read), Mask::NONE);
    }

    #[test]
    fn test_capacity_boundary() {
        let pipe = Pipe::new();
        // Size the table so the pipe's read end is the last representable
        // descriptor.
        let set_size = pipe.read as usize + 1;
        let mut el = EventLoop::new(set_size).unwrap();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));

        let err = el
            .register_file(set_size as RawFd, Mask::READABLE, Recorder::shared(log.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { fd, .. } if fd == set_size as RawFd));
        assert_eq!(el.max_fd(), -1);

        el.register_file(pipe.read, Mask::READABLE, Recorder::shared(log))
            .unwrap();
        assert_eq!(el.max_fd(), pipe.read);
        el.unregister_file(pipe.read, Mask::READABLE);
    }

    #[test]
    fn test_resize_refuses_to_orphan_descriptors() {
        let mut el = EventLoop::new(128).unwrap();
        let pipe = Pipe::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        el.register_file(pipe.read, Mask::READABLE, Recorder::shared(log))
            .unwrap();

        let err = el.resize(pipe.read as usize).unwrap_err();
        assert!(matches!(err, Error::ShrinkBelowMax { .. }));
        assert_eq!(el.set_size(), 128);

        el.resize(256).unwrap();
        assert_eq!(el.set_size(), 256);
    }

    #[test]
    fn test_pipe_readable_dispatch_and_stop() {
        let mut el = EventLoop::new(128).unwrap();
        let pipe = Pipe::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        let handler = Rc::new(RefCell::new(Recorder { log: log.clone(), stop_after: true }));
        el.register_file(pipe.read, Mask::READABLE, handler).unwrap();

        pipe.feed(b"x");
        let started = Instant::now();
        el.run();

        let calls = log.borrow();
        assert_eq!(calls.len(), 1);
        let (kind, fd, mask) = calls[0];
        assert_eq!(kind, "r");
        assert_eq!(fd, pipe.read);
        assert!(mask.intersects(Mask::READABLE));
        // run() must have exited promptly rather than blocking again.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_only_matured_timers_fire() {
        let mut el = EventLoop::new(8).unwrap();
        let log = timer_log();
        let mut by_delay = Vec::new();
        for delay in [1000u64, 200, 500, 100, 800] {
            let id = el.create_timer(delay, recording_timer(log.clone()));
            by_delay.push((delay, id));
        }

        std::thread::sleep(Duration::from_millis(600));
        el.process_events(Flags::TIME_EVENTS);

        let mut fired = log.borrow().clone();
        fired.sort_unstable();
        let mut expected: Vec<u64> = by_delay
            .iter()
            .filter(|(d, _)| *d <= 500)
            .map(|(_, id)| *id)
            .collect();
        expected.sort_unstable();
        assert_eq!(fired, expected);
    }

    #[test]
    fn test_timer_ids_strictly_increase() {
        let mut el = EventLoop::new(8).unwrap();
        let log = timer_log();
        let a = el.create_timer(10, recording_timer(log.clone()));
        let b = el.create_timer(10, recording_timer(log.clone()));
        let c = el.create_timer(10, recording_timer(log));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_self_deleting_timer_fires_once() {
        let mut el = EventLoop::new(8).unwrap();
        let fires = Rc::new(RefCell::new(0u32));
        let fires2 = fires.clone();
        let id_cell = Rc::new(RefCell::new(0u64));
        let id_cell2 = id_cell.clone();
        let handler = Rc::new(RefCell::new(move |el: &mut EventLoop, id: u64| {
            *fires2.borrow_mut() += 1;
            assert_eq!(id, *id_cell2.borrow());
            el.delete_timer(id).unwrap();
            TimerAction::Done
        }));
        *id_cell.borrow_mut() = el.create_timer(0, handler);

        std::thread::sleep(Duration::from_millis(5));
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        assert_eq!(*fires.borrow(), 1);
    }

    #[test]
    fn test_deleted_timer_runs_finalizer() {
        struct Finalizing {
            finalized: Rc<RefCell<bool>>,
        }
        impl TimerHandler for Finalizing {
            fn fire(&mut self, _el: &mut EventLoop, _id: u64) -> TimerAction {
                TimerAction::Done
            }
            fn finalize(&mut self, _el: &mut EventLoop) {
                *self.finalized.borrow_mut() = true;
            }
        }

        let mut el = EventLoop::new(8).unwrap();
        let finalized = Rc::new(RefCell::new(false));
        el.create_timer(0, Rc::new(RefCell::new(Finalizing { finalized: finalized.clone() })));

        std::thread::sleep(Duration::from_millis(5));
        // First walk fires and marks deleted; second physically reclaims.
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        assert!(!*finalized.borrow());
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        assert!(*finalized.borrow());
    }

    #[test]
    fn test_timer_created_during_dispatch_waits_a_cycle() {
        let mut el = EventLoop::new(8).unwrap();
        let log = timer_log();
        let log2 = log.clone();
        let outer = Rc::new(RefCell::new(move |el: &mut EventLoop, _id: u64| {
            let inner_log = log2.clone();
            el.create_timer(
                0,
                Rc::new(RefCell::new(move |_el: &mut EventLoop, id: u64| {
                    inner_log.borrow_mut().push(id);
                    TimerAction::Done
                })),
            );
            TimerAction::Done
        }));
        el.create_timer(0, outer);

        std::thread::sleep(Duration::from_millis(5));
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        // The inner zero-delay timer must not fire in the cycle that made it.
        assert!(log.borrow().is_empty());
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_clock_regression_forces_timers_due() {
        let mut el = EventLoop::new(8).unwrap();
        let log = timer_log();
        el.create_timer(3_600_000, recording_timer(log.clone()));

        // Pretend an earlier cycle observed a clock far in the future.
        el.last_wall_secs = clock::unix_seconds() + 1_000;
        el.process_events(Flags::TIME_EVENTS | Flags::DONT_WAIT);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_delete_unknown_timer_is_reported() {
        let mut el = EventLoop::new(8).unwrap();
        assert!(matches!(el.delete_timer(42), Err(Error::NoSuchTimer(42))));
    }

    #[test]
    fn test_shared_handler_fires_once_for_both_sides() {
        let mut el = EventLoop::new(128).unwrap();
        let pair = SocketPair::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        let handler = Recorder::shared(log.clone());
        el.register_file(pair.a, Mask::READABLE | Mask::WRITABLE, handler)
            .unwrap();

        pair.feed_a(b"ping");
        el.process_events(Flags::FILE_EVENTS | Flags::DONT_WAIT);

        let calls = log.borrow();
        assert_eq!(calls.len(), 1);
        let (kind, _, mask) = calls[0];
        // Read side wins without a barrier; both bits are delivered.
        assert_eq!(kind, "r");
        assert!(mask.contains(Mask::READABLE | Mask::WRITABLE));
    }

    #[test]
    fn test_barrier_shared_handler_takes_write_path() {
        let mut el = EventLoop::new(128).unwrap();
        let pair = SocketPair::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        let handler = Recorder::shared(log.clone());
        el.register_file(pair.a, Mask::READABLE | Mask::WRITABLE | Mask::BARRIER, handler)
            .unwrap();

        pair.feed_a(b"ping");
        el.process_events(Flags::FILE_EVENTS | Flags::DONT_WAIT);

        let calls = log.borrow();
        assert_eq!(calls.len(), 1);
        let (kind, _, mask) = calls[0];
        assert_eq!(kind, "w");
        assert!(mask.contains(Mask::READABLE | Mask::WRITABLE));
    }

    #[test]
    fn test_barrier_orders_write_before_read_for_distinct_handlers() {
        let mut el = EventLoop::new(128).unwrap();
        let pair = SocketPair::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        el.register_file(pair.a, Mask::READABLE, Recorder::shared(log.clone()))
            .unwrap();
        el.register_file(pair.a, Mask::WRITABLE | Mask::BARRIER, Recorder::shared(log.clone()))
            .unwrap();

        pair.feed_a(b"ping");
        el.process_events(Flags::FILE_EVENTS | Flags::DONT_WAIT);

        let kinds: Vec<&'static str> = log.borrow().iter().map(|(k, _, _)| *k).collect();
        assert_eq!(kinds, vec!["w", "r"]);
    }

    #[test]
    fn test_unregister_writable_clears_barrier() {
        let mut el = EventLoop::new(128).unwrap();
        let pair = SocketPair::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        el.register_file(
            pair.a,
            Mask::READABLE | Mask::WRITABLE | Mask::BARRIER,
            Recorder::shared(log),
        )
        .unwrap();

        el.unregister_file(pair.a, Mask::WRITABLE);
        assert_eq!(el.file_mask(pair.a), Mask::READABLE);
        el.unregister_file(pair.a, Mask::READABLE);
    }

    #[test]
    fn test_max_fd_recomputed_downward() {
        let mut el = EventLoop::new(128).unwrap();
        let low = Pipe::new();
        let high = Pipe::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        el.register_file(low.read, Mask::READABLE, Recorder::shared(log.clone()))
            .unwrap();
        el.register_file(high.read, Mask::READABLE, Recorder::shared(log))
            .unwrap();
        assert_eq!(el.max_fd(), low.read.max(high.read));

        let (top, rest) = if high.read > low.read {
            (high.read, low.read)
        } else {
            (low.read, high.read)
        };
        el.unregister_file(top, Mask::READABLE);
        assert_eq!(el.max_fd(), rest);
        el.unregister_file(rest, Mask::READABLE);
        assert_eq!(el.max_fd(), -1);
    }

    #[test]
    fn test_handler_can_unregister_itself_mid_cycle() {
        struct OneShot {
            log: CallLog,
        }
        impl FileHandler for OneShot {
            fn readable(&mut self, el: &mut EventLoop, fd: RawFd, mask: Mask) {
                self.log.borrow_mut().push(("r", fd, mask));
                el.unregister_file(fd, Mask::READABLE | Mask::WRITABLE);
            }
        }

        let mut el = EventLoop::new(128).unwrap();
        let pipe = Pipe::new();
        let log: CallLog = Rc::new(RefCell::new(Vec::new()));
        el.register_file(
            pipe.read,
            Mask::READABLE,
            Rc::new(RefCell::new(OneShot { log: log.clone() })),
        )
        .unwrap();

        pipe.feed(b"xx");
        el.process_events(Flags::FILE_EVENTS | Flags::DONT_WAIT);
        el.process_events(Flags::FILE_EVENTS | Flags::DONT_WAIT);
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(el.file_mask(pipe.read), Mask::NONE);
    }

    #[test]
    fn test_hooks_run_around_sleep() {
        let mut el = EventLoop::new(8).unwrap();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let before = order.clone();
        let after = order.clone();
        el.set_before_sleep(Some(Box::new(move |_el| before.borrow_mut().push("before"))));
        el.set_after_sleep(Some(Box::new(move |_el| after.borrow_mut().push("after"))));
        el.create_timer(0, recording_timer(timer_log()));

        el.process_events(
            Flags::ALL_EVENTS | Flags::CALL_BEFORE_SLEEP | Flags::CALL_AFTER_SLEEP,
        );
        assert_eq!(*order.borrow(), vec!["before", "after"]);
    }

    #[test]
    fn test_wait_for_reports_readiness_and_timeout() {
        let pipe = Pipe::new();
        assert_eq!(
            wait_for(pipe.read, Mask::READABLE, 0).unwrap(),
            Mask::NONE
        );
        pipe.feed(b"y");
        let ready = wait_for(pipe.read, Mask::READABLE, 100).unwrap();
        assert!(ready.intersects(Mask::READABLE));
        let writable = wait_for(pipe.write, Mask::WRITABLE, 100).unwrap();
        assert!(writable.intersects(Mask::WRITABLE));
    }
}
