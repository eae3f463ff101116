//! Poll Descriptors
//!
//! A poll descriptor mirrors an object's readiness into the same poll loop
//! that services file I/O. The owner registers which events it is
//! interested in; the poll loop reports what actually happened.

bitflags::bitflags! {
    /// poll(2) event bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: u16 {
        const POLLIN = 0x0001;
        const POLLPRI = 0x0002;
        const POLLOUT = 0x0004;
        const POLLERR = 0x0008;
        const POLLHUP = 0x0010;
        const POLLNVAL = 0x0020;
    }
}

/// Client descriptor registered with the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDescriptor {
    /// Client-side descriptor number
    fd: i32,
    /// Events the poll loop should wait for; `None` once disabled
    interest: Option<PollEvents>,
    /// Events last reported by the poll loop
    ready: PollEvents,
}

impl PollDescriptor {
    pub fn new(fd: i32) -> Self {
        Self {
            fd,
            interest: Some(PollEvents::empty()),
            ready: PollEvents::empty(),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Change the interest set (ignored once disabled)
    pub fn set_events(&mut self, events: PollEvents) {
        if let Some(interest) = self.interest.as_mut() {
            *interest = events;
        }
    }

    /// Stop polling this descriptor for good
    pub fn disable(&mut self) {
        self.interest = None;
        self.ready = PollEvents::empty();
    }

    pub fn is_disabled(&self) -> bool {
        self.interest.is_none()
    }

    /// Events the poll loop is currently asked to wait for
    pub fn interest(&self) -> PollEvents {
        self.interest.unwrap_or_default()
    }

    /// Record the events the poll loop saw
    pub fn report(&mut self, events: PollEvents) {
        if !self.is_disabled() {
            self.ready = events;
        }
    }

    /// Which of `mask` are currently ready
    pub fn check_events(&self, mask: PollEvents) -> PollEvents {
        self.ready & mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interest_and_ready() {
        let mut fd = PollDescriptor::new(5);
        fd.set_events(PollEvents::POLLIN);
        assert_eq!(fd.interest(), PollEvents::POLLIN);
        assert!(fd.check_events(PollEvents::POLLIN).is_empty());

        fd.report(PollEvents::POLLIN | PollEvents::POLLOUT);
        assert_eq!(fd.check_events(PollEvents::POLLIN), PollEvents::POLLIN);
    }

    #[test]
    fn test_disable_is_final() {
        let mut fd = PollDescriptor::new(5);
        fd.disable();
        fd.set_events(PollEvents::POLLIN);
        fd.report(PollEvents::POLLIN);
        assert!(fd.is_disabled());
        assert!(fd.interest().is_empty());
        assert!(fd.check_events(PollEvents::POLLIN).is_empty());
    }
}
