//! select backend (portable fallback).
//!
//! Keeps a per-descriptor mask table and rebuilds the fd_sets on every call.
//! Capacity is additionally bounded by FD_SETSIZE.

use super::Fired;
use crate::reactor::Mask;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

pub struct Poller {
    masks: Vec<Mask>,
}

impl Poller {
    pub fn new(set_size: usize) -> io::Result<Self> {
        Ok(Self { masks: vec![Mask::NONE; set_size] })
    }

    pub fn name(&self) -> &'static str {
        "select"
    }

    pub fn resize(&mut self, set_size: usize) -> io::Result<()> {
        self.masks.resize(set_size, Mask::NONE);
        Ok(())
    }

    pub fn add(&mut self, fd: RawFd, old: Mask, added: Mask) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if let Some(slot) = self.masks.get_mut(fd as usize) {
            *slot = old | added;
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        }
    }

    pub fn del(&mut self, fd: RawFd, old: Mask, removed: Mask) -> io::Result<()> {
        if let Some(slot) = self.masks.get_mut(fd as usize) {
            *slot = old.without(removed);
        }
        Ok(())
    }

    pub fn poll(&mut self, timeout: Option<Duration>, fired: &mut Vec<Fired>) -> io::Result<usize> {
        let mut rfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut wfds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut rfds);
            libc::FD_ZERO(&mut wfds);
        }
        let mut max_fd: RawFd = -1;
        for (fd, mask) in self.masks.iter().enumerate() {
            if mask.is_none() {
                continue;
            }
            let fd = fd as RawFd;
            unsafe {
                if mask.intersects(Mask::READABLE) {
                    libc::FD_SET(fd, &mut rfds);
                }
                if mask.intersects(Mask::WRITABLE) {
                    libc::FD_SET(fd, &mut wfds);
                }
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        let n = unsafe {
            libc::select(max_fd + 1, &mut rfds, &mut wfds, ptr::null_mut(), tv_ptr)
        };
        fired.clear();
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if n > 0 {
            for (fd, mask) in self.masks.iter().enumerate() {
                if mask.is_none() {
                    continue;
                }
                let fd = fd as RawFd;
                let mut delivered = Mask::NONE;
                unsafe {
                    if mask.intersects(Mask::READABLE) && libc::FD_ISSET(fd, &mut rfds) {
                        delivered |= Mask::READABLE;
                    }
                    if mask.intersects(Mask::WRITABLE) && libc::FD_ISSET(fd, &mut wfds) {
                        delivered |= Mask::WRITABLE;
                    }
                }
                if !delivered.is_none() {
                    fired.push(Fired { fd, mask: delivered });
                }
            }
        }
        Ok(fired.len())
    }
}
