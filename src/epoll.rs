//! epoll back end. The kernel owns the registration table; only a running
//! count of registered fds (the shadow) is kept here so the loop can tell
//! when nothing is left to wait for.

use crate::event::{EventMask, PollEvent};
use crate::logmsg;
use std::io;
use std::os::unix::io::RawFd;

/// Events fetched per wait. Bursts beyond this just take another wait call.
const MAX_EVENTS: usize = 64;

pub(crate) struct Poller {
    epfd: RawFd,
    shadow: usize,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd, shadow: 0 })
    }

    pub fn registered(&self) -> usize {
        self.shadow
    }

    /// Wait up to `timeout_ms` (-1 blocks indefinitely) and append ready
    /// events to `out`. `EINTR` retries; any other failure is fatal to the
    /// loop and surfaces as an error.
    pub fn wait(&mut self, out: &mut Vec<PollEvent>, timeout_ms: i32) -> io::Result<()> {
        let mut buf = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, buf.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            for ev in buf.iter().take(n as usize) {
                out.push(PollEvent {
                    fd: ev.u64 as RawFd,
                    mask: mask_of(ev.events),
                });
            }
            return Ok(());
        }
    }

    /// Commit an interest change. Registration bookkeeping errors are
    /// logged and reconciled against the shadow count rather than
    /// propagated; the loop stays internally consistent.
    pub fn apply(&mut self, fd: RawFd, old: EventMask, new: EventMask) {
        if old == new {
            return;
        }
        if old.is_empty() {
            match self.ctl(libc::EPOLL_CTL_ADD, fd, new) {
                Ok(()) => self.shadow += 1,
                Err(libc::EEXIST) => {
                    logmsg!("epoll: fd {} was already registered, modifying instead", fd);
                    if self.ctl(libc::EPOLL_CTL_MOD, fd, new).is_ok() {
                        self.shadow += 1;
                    }
                }
                Err(errno) => {
                    logmsg!(
                        "epoll: add fd {} failed: {}",
                        fd,
                        io::Error::from_raw_os_error(errno)
                    );
                }
            }
        } else if new.is_empty() {
            match self.ctl(libc::EPOLL_CTL_DEL, fd, new) {
                Ok(()) => {}
                Err(libc::ENOENT) => {
                    logmsg!("epoll: fd {} was not registered, delete skipped", fd);
                }
                Err(errno) => {
                    // EBADF and friends mean the kernel dropped it already
                    logmsg!(
                        "epoll: delete fd {} failed: {}",
                        fd,
                        io::Error::from_raw_os_error(errno)
                    );
                }
            }
            self.shadow = self.shadow.saturating_sub(1);
        } else {
            match self.ctl(libc::EPOLL_CTL_MOD, fd, new) {
                Ok(()) => {}
                Err(libc::ENOENT) => {
                    logmsg!("epoll: fd {} was not registered, adding instead", fd);
                    if self.ctl(libc::EPOLL_CTL_ADD, fd, new).is_err() {
                        self.shadow = self.shadow.saturating_sub(1);
                    }
                }
                Err(errno) => {
                    logmsg!(
                        "epoll: modify fd {} failed: {}",
                        fd,
                        io::Error::from_raw_os_error(errno)
                    );
                }
            }
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: EventMask) -> Result<(), libc::c_int> {
        let mut ev = libc::epoll_event {
            events: events_of(mask),
            u64: fd as u64,
        };
        let evp = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev
        };
        let res = unsafe { libc::epoll_ctl(self.epfd, op, fd, evp) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn events_of(mask: EventMask) -> u32 {
    let mut events = 0u32;
    if mask.readable() {
        events |= libc::EPOLLIN as u32;
    }
    if mask.writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn mask_of(events: u32) -> EventMask {
    let mut mask = EventMask::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        mask = mask | EventMask::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        mask = mask | EventMask::WRITE;
    }
    if events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
        mask = mask | EventMask::ERROR;
    }
    mask
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sockets;

    #[test]
    pub fn test_shadow_counting() {
        let mut poller = Poller::new().unwrap();
        assert_eq!(poller.registered(), 0);
        let (rd, wr) = sockets::new_pipe().unwrap();

        poller.apply(rd, EventMask::NONE, EventMask::READ);
        assert_eq!(poller.registered(), 1);
        poller.apply(rd, EventMask::READ, EventMask::READ | EventMask::WRITE);
        assert_eq!(poller.registered(), 1);
        poller.apply(rd, EventMask::READ | EventMask::WRITE, EventMask::NONE);
        assert_eq!(poller.registered(), 0);

        // double-delete reconciles instead of failing
        poller.apply(rd, EventMask::READ, EventMask::NONE);
        poller.apply(rd, EventMask::NONE, EventMask::READ);
        assert_eq!(poller.registered(), 1);

        sockets::close_socket(rd);
        sockets::close_socket(wr);
    }

    #[test]
    pub fn test_wait_reports_readable_pipe() {
        let mut poller = Poller::new().unwrap();
        let (rd, wr) = sockets::new_pipe().unwrap();
        poller.apply(rd, EventMask::NONE, EventMask::READ);

        let mut out = Vec::new();
        poller.wait(&mut out, 0).unwrap();
        assert!(out.is_empty());

        let byte = 1u8;
        unsafe { libc::write(wr, &byte as *const u8 as *const libc::c_void, 1) };
        poller.wait(&mut out, 100).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fd, rd);
        assert!(out[0].mask.readable());

        sockets::close_socket(rd);
        sockets::close_socket(wr);
    }

    #[test]
    pub fn test_mask_translation() {
        let both = EventMask::READ | EventMask::WRITE;
        assert_eq!(mask_of(events_of(both)), both);
        assert!(mask_of(libc::EPOLLHUP as u32).has_error());
        assert!(mask_of(libc::EPOLLERR as u32 | libc::EPOLLIN as u32).readable());
    }
}
