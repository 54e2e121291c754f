//! poll(2) back end for non-Linux hosts (or builds without the `epoll`
//! feature). A single fd-sorted pollfd vector mirrors the registration
//! set; lookups are lower-bound binary searches.

use crate::event::{EventMask, PollEvent};
use crate::logmsg;
use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct Poller {
    // sorted by fd; relies on the kernel not reissuing an fd while it is
    // still registered here
    pollset: Vec<libc::pollfd>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            pollset: Vec::new(),
        })
    }

    pub fn registered(&self) -> usize {
        self.pollset.len()
    }

    /// Wait up to `timeout_ms` (-1 blocks indefinitely) and append ready
    /// events to `out`. `EINTR` retries, `ENOMEM` logs and retries; any
    /// other failure is fatal to the loop.
    pub fn wait(&mut self, out: &mut Vec<PollEvent>, timeout_ms: i32) -> io::Result<()> {
        loop {
            let n = unsafe {
                libc::poll(
                    self.pollset.as_mut_ptr(),
                    self.pollset.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ENOMEM) => {
                        logmsg!("poll: transient ENOMEM, retrying");
                        continue;
                    }
                    _ => return Err(err),
                }
            }
            for p in &self.pollset {
                if p.revents != 0 {
                    out.push(PollEvent {
                        fd: p.fd,
                        mask: mask_of(p.revents),
                    });
                }
            }
            return Ok(());
        }
    }

    /// Commit an interest change by lower-bound lookup: insert, update or
    /// erase the pollfd entry.
    pub fn apply(&mut self, fd: RawFd, _old: EventMask, new: EventMask) {
        debug_assert!(
            self.pollset.windows(2).all(|w| w[0].fd < w[1].fd),
            "pollset must stay sorted by fd"
        );
        match self.pollset.binary_search_by_key(&fd, |p| p.fd) {
            Ok(pos) => {
                if new.is_empty() {
                    self.pollset.remove(pos);
                } else {
                    self.pollset[pos].events = events_of(new);
                }
            }
            Err(pos) => {
                if new.is_empty() {
                    logmsg!("poll: delete for unregistered fd {}", fd);
                } else {
                    self.pollset.insert(
                        pos,
                        libc::pollfd {
                            fd,
                            events: events_of(new),
                            revents: 0,
                        },
                    );
                }
            }
        }
    }
}

fn events_of(mask: EventMask) -> libc::c_short {
    let mut events = 0 as libc::c_short;
    if mask.readable() {
        events |= libc::POLLIN;
    }
    if mask.writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn mask_of(revents: libc::c_short) -> EventMask {
    let mut mask = EventMask::NONE;
    if revents & libc::POLLIN != 0 {
        mask = mask | EventMask::READ;
    }
    if revents & libc::POLLOUT != 0 {
        mask = mask | EventMask::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        mask = mask | EventMask::ERROR;
    }
    mask
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sockets;

    #[test]
    pub fn test_pollset_stays_sorted() {
        let mut poller = Poller::new().unwrap();
        let (rd1, wr1) = sockets::new_pipe().unwrap();
        let (rd2, wr2) = sockets::new_pipe().unwrap();

        // insert in descending fd order; the vector must come out sorted
        poller.apply(rd2, EventMask::NONE, EventMask::READ);
        poller.apply(rd1, EventMask::NONE, EventMask::READ | EventMask::WRITE);
        assert_eq!(poller.registered(), 2);
        assert!(poller.pollset.windows(2).all(|w| w[0].fd < w[1].fd));

        poller.apply(rd1, EventMask::READ | EventMask::WRITE, EventMask::READ);
        assert_eq!(poller.registered(), 2);
        poller.apply(rd1, EventMask::READ, EventMask::NONE);
        assert_eq!(poller.registered(), 1);
        // deleting twice only logs
        poller.apply(rd1, EventMask::READ, EventMask::NONE);
        assert_eq!(poller.registered(), 1);

        for fd in [rd1, wr1, rd2, wr2] {
            sockets::close_socket(fd);
        }
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
        assert!(mask_of(libc::POLLHUP).has_error());
        assert!(mask_of(libc::POLLNVAL).has_error());
    }
}
