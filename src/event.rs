use std::fmt;
use std::os::unix::io::RawFd;

/// A registerable I/O direction. Errors are always delivered by the OS and
/// never explicitly requested, so they are not an `Operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Bit set over {read, write, error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(0b001);
    pub const WRITE: EventMask = EventMask(0b010);
    pub const ERROR: EventMask = EventMask(0b100);

    pub fn of(op: Operation) -> EventMask {
        match op {
            Operation::Read => EventMask::READ,
            Operation::Write => EventMask::WRITE,
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn with(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }
    pub fn without(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }

    pub fn readable(self) -> bool {
        self.contains(EventMask::READ)
    }
    pub fn writable(self) -> bool {
        self.contains(EventMask::WRITE)
    }
    pub fn has_error(self) -> bool {
        self.contains(EventMask::ERROR)
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, other: EventMask) -> EventMask {
        self.with(other)
    }
}

impl std::ops::BitAnd for EventMask {
    type Output = EventMask;
    fn bitand(self, other: EventMask) -> EventMask {
        EventMask(self.0 & other.0)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.readable() { "r" } else { "-" },
            if self.writable() { "w" } else { "-" },
            if self.has_error() { "e" } else { "-" }
        )
    }
}

/// One readiness notification as reported by the back end.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub mask: EventMask,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_mask_ops() {
        let mut m = EventMask::NONE;
        assert!(m.is_empty());
        m = m | EventMask::READ;
        assert!(m.readable() && !m.writable());
        m = m.with(EventMask::WRITE);
        assert!(m.contains(EventMask::READ | EventMask::WRITE));
        m = m.without(EventMask::READ);
        assert_eq!(m, EventMask::WRITE);
        assert_eq!(m.without(EventMask::WRITE), EventMask::NONE);
        assert_eq!(EventMask::of(Operation::Read), EventMask::READ);
        assert_eq!(EventMask::of(Operation::Write), EventMask::WRITE);
    }

    #[test]
    pub fn test_mask_display() {
        let m = EventMask::READ | EventMask::ERROR;
        assert_eq!(format!("{}", m), "r-e");
    }
}
