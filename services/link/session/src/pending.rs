//! Caller-owned handles for requests awaiting a response.
//!
//! The caller holds the only strong reference to a request's slot. The session
//! manager keeps a `Weak` back-reference, so dropping the handle invalidates
//! the manager's view immediately and no stale reference can survive it.

use link_wire::{PeerId, Response};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Queued or in flight
    Pending,
    /// No response arrived before the timeout
    TimedOut,
    /// Response received
    Obtained,
}

#[derive(Debug)]
pub(crate) struct Slot {
    status: ResponseStatus,
    time_left: Duration,
    expected_source: PeerId,
    transmitted: bool,
    response: Option<Response>,
}

impl Slot {
    pub(crate) fn resolve(&mut self, response: Response) {
        if self.status == ResponseStatus::Pending {
            self.status = ResponseStatus::Obtained;
            self.response = Some(response);
        }
    }

    pub(crate) fn time_out(&mut self) {
        if self.status == ResponseStatus::Pending {
            self.status = ResponseStatus::TimedOut;
            self.time_left = Duration::ZERO;
        }
    }

    pub(crate) fn mark_transmitted(&mut self) {
        self.transmitted = true;
    }

    pub(crate) fn set_time_left(&mut self, time_left: Duration) {
        self.time_left = time_left;
    }
}

/// Manager-side reference to a caller's slot
pub(crate) type SlotRef = Weak<RefCell<Slot>>;

/// Handle to a request's eventual response
#[derive(Debug)]
pub struct PendingResponse {
    slot: Rc<RefCell<Slot>>,
}

impl PendingResponse {
    pub(crate) fn new(expected_source: PeerId, timeout: Duration) -> (Self, SlotRef) {
        let slot = Rc::new(RefCell::new(Slot {
            status: ResponseStatus::Pending,
            time_left: timeout,
            expected_source,
            transmitted: false,
            response: None,
        }));
        let weak = Rc::downgrade(&slot);
        (Self { slot }, weak)
    }

    /// Current status
    pub fn status(&self) -> ResponseStatus {
        self.slot.borrow().status
    }

    /// Still waiting
    pub fn is_pending(&self) -> bool {
        self.status() == ResponseStatus::Pending
    }

    /// Response arrived
    pub fn is_obtained(&self) -> bool {
        self.status() == ResponseStatus::Obtained
    }

    /// Gave up waiting
    pub fn is_timed_out(&self) -> bool {
        self.status() == ResponseStatus::TimedOut
    }

    /// Remaining time before the request times out
    pub fn time_left(&self) -> Duration {
        self.slot.borrow().time_left
    }

    /// Whether the request has been written to the send queue.
    /// Requests queued behind another one to the same peer are not.
    pub fn is_transmitted(&self) -> bool {
        self.slot.borrow().transmitted
    }

    /// Peer the response must come from
    pub fn expected_source(&self) -> PeerId {
        self.slot.borrow().expected_source
    }

    /// Copy of the response, once obtained
    pub fn response(&self) -> Option<Response> {
        self.slot.borrow().response.clone()
    }

    /// Move the response out, once obtained
    pub fn take_response(&mut self) -> Option<Response> {
        self.slot.borrow_mut().response.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_wire::status;

    #[test]
    fn test_drop_invalidates_back_reference() {
        let (handle, weak) = PendingResponse::new(PeerId(3), Duration::from_secs(1));
        assert!(weak.upgrade().is_some());

        drop(handle);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_resolution_is_final() {
        let (mut handle, weak) = PendingResponse::new(PeerId(3), Duration::from_secs(1));
        let slot = weak.upgrade().unwrap();

        slot.borrow_mut().time_out();
        slot.borrow_mut()
            .resolve(Response::new(PeerId(1), status::OK, "late"));

        assert!(handle.is_timed_out());
        assert_eq!(handle.time_left(), Duration::ZERO);
        assert!(handle.take_response().is_none());
    }

    #[test]
    fn test_obtained_response() {
        let (mut handle, weak) = PendingResponse::new(PeerId(3), Duration::from_secs(1));
        assert_eq!(handle.expected_source(), PeerId(3));
        assert!(!handle.is_transmitted());

        let slot = weak.upgrade().unwrap();
        slot.borrow_mut().mark_transmitted();
        slot.borrow_mut()
            .resolve(Response::new(PeerId(1), status::OK, "ok"));
        slot.borrow_mut().time_out();

        assert!(handle.is_transmitted());
        assert!(handle.is_obtained());
        assert_eq!(handle.take_response().unwrap().status_code(), status::OK);
        assert!(handle.take_response().is_none());
    }
}
