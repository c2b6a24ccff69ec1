//! kqueue backend (macOS and the BSDs).

use super::Fired;
use crate::reactor::Mask;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

pub struct Poller {
    kq: RawFd,
    events: Vec<libc::kevent>,
    /// Per-fd merge scratch: kqueue reports read and write readiness as
    /// separate kevents, and the loop contract is one notification per
    /// descriptor per cycle.
    merged: Vec<Mask>,
}

fn kevent_of(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as usize;
    ev.filter = filter;
    ev.flags = flags;
    ev
}

impl Poller {
    pub fn new(set_size: usize) -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Self {
            kq,
            events: vec![unsafe { std::mem::zeroed() }; set_size.max(1)],
            merged: vec![Mask::NONE; set_size.max(1)],
        })
    }

    pub fn name(&self) -> &'static str {
        "kqueue"
    }

    pub fn resize(&mut self, set_size: usize) -> io::Result<()> {
        self.events
            .resize_with(set_size.max(1), || unsafe { std::mem::zeroed() });
        self.merged.resize(set_size.max(1), Mask::NONE);
        Ok(())
    }

    fn change(&mut self, ev: libc::kevent) -> io::Result<()> {
        let rc = unsafe {
            libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null())
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, _old: Mask, added: Mask) -> io::Result<()> {
        if added.intersects(Mask::READABLE) {
            self.change(kevent_of(fd, libc::EVFILT_READ, libc::EV_ADD))?;
        }
        if added.intersects(Mask::WRITABLE) {
            self.change(kevent_of(fd, libc::EVFILT_WRITE, libc::EV_ADD))?;
        }
        Ok(())
    }

    pub fn del(&mut self, fd: RawFd, old: Mask, removed: Mask) -> io::Result<()> {
        // Only delete filters that are actually installed; ENOENT from a
        // racing close is not a failure.
        if removed.intersects(Mask::READABLE) && old.intersects(Mask::READABLE) {
            match self.change(kevent_of(fd, libc::EVFILT_READ, libc::EV_DELETE)) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                other => other?,
            }
        }
        if removed.intersects(Mask::WRITABLE) && old.intersects(Mask::WRITABLE) {
            match self.change(kevent_of(fd, libc::EVFILT_WRITE, libc::EV_DELETE)) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                other => other?,
            }
        }
        Ok(())
    }

    pub fn poll(&mut self, timeout: Option<Duration>, fired: &mut Vec<Fired>) -> io::Result<usize> {
        let ts;
        let ts_ptr = match timeout {
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                };
                &ts as *const libc::timespec
            }
            None => ptr::null(),
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                ts_ptr,
            )
        };
        fired.clear();
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        // A descriptor ready for both directions arrives as two kevents;
        // merge them so the loop sees a single delivery per fd per cycle.
        let mut touched: Vec<RawFd> = Vec::with_capacity(n as usize);
        for e in &self.events[..n as usize] {
            let bit = match e.filter {
                libc::EVFILT_READ => Mask::READABLE,
                libc::EVFILT_WRITE => Mask::WRITABLE,
                _ => continue,
            };
            let fd = e.ident as RawFd;
            match self.merged.get_mut(fd as usize) {
                Some(slot) => {
                    if slot.is_none() {
                        touched.push(fd);
                    }
                    *slot |= bit;
                }
                None => fired.push(Fired { fd, mask: bit }),
            }
        }
        for fd in touched {
            let mask = std::mem::take(&mut self.merged[fd as usize]);
            fired.push(Fired { fd, mask });
        }
        Ok(fired.len())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
