//! epoll backend (Linux).

use super::Fired;
use crate::reactor::Mask;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct Poller {
    epfd: RawFd,
    /// Kernel-filled scratch, sized to the loop's slot table.
    events: Vec<libc::epoll_event>,
}

fn interest(mask: Mask) -> u32 {
    let mut ev = 0;
    if mask.intersects(Mask::READABLE) {
        ev |= libc::EPOLLIN as u32;
    }
    if mask.intersects(Mask::WRITABLE) {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

impl Poller {
    pub fn new(set_size: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd,
            events: vec![unsafe { std::mem::zeroed() }; set_size.max(1)],
        })
    }

    pub fn name(&self) -> &'static str {
        "epoll"
    }

    pub fn resize(&mut self, set_size: usize) -> io::Result<()> {
        self.events
            .resize_with(set_size.max(1), || unsafe { std::mem::zeroed() });
        Ok(())
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, mask: Mask) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest(mask),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, old: Mask, added: Mask) -> io::Result<()> {
        let op = if old.is_none() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, old | added)
    }

    pub fn del(&mut self, fd: RawFd, old: Mask, removed: Mask) -> io::Result<()> {
        let left = old.without(removed);
        if interest(left) == 0 {
            self.ctl(libc::EPOLL_CTL_DEL, fd, Mask::NONE)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, left)
        }
    }

    pub fn poll(&mut self, timeout: Option<Duration>, fired: &mut Vec<Fired>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        fired.clear();
        if n == -1 {
            let err = io::Error::last_os_error();
            // A signal landing mid-wait is not a poll failure.
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        for e in &self.events[..n as usize] {
            let mut mask = Mask::NONE;
            if e.events & libc::EPOLLIN as u32 != 0 {
                mask |= Mask::READABLE;
            }
            if e.events & libc::EPOLLOUT as u32 != 0 {
                mask |= Mask::WRITABLE;
            }
            // Error and hang-up conditions surface through both handlers so
            // whichever side is registered gets a chance to observe them.
            if e.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                mask |= Mask::READABLE | Mask::WRITABLE;
            }
            fired.push(Fired { fd: e.u64 as RawFd, mask });
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
