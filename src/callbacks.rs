//! # Callback Registration
//!
//! Every callback fires synchronously from inside [`crate::Context::poll`]
//! or [`crate::Context::poll_fast`] (spec.md §4.9/§5); none may re-enter
//! `poll`. Stored as boxed `FnMut` closures rather than a trait object
//! collection since a context has exactly one set, set once via
//! [`crate::Context::set_callbacks`].

use crate::peer::PeerId;

/// Raised when a new peer is first observed via discovery or an inbound
/// connection, before any capability negotiation has happened.
pub type DiscoveredCallback = Box<dyn FnMut(PeerId, &str)>;
/// Raised once a peer finishes capability negotiation and becomes usable.
pub type ConnectedCallback = Box<dyn FnMut(PeerId)>;
/// Raised when a peer is torn down for a protocol or I/O reason, carrying
/// the specific error kind that caused it.
pub type DisconnectedCallback = Box<dyn FnMut(PeerId, crate::error::Error)>;
/// Raised when a `DISCOVERED` peer ages out without ever connecting, or
/// receives a `GOODBYE`.
pub type LostCallback = Box<dyn FnMut(PeerId)>;
/// Raised once per complete inbound message (plain or reassembled).
pub type MessageReceivedCallback = Box<dyn FnMut(PeerId, &[u8])>;
/// Raised when an outbound stream finishes, successfully or via
/// cancellation (in which case `err` is `Some(Error::Cancelled)`).
pub type StreamCompleteCallback = Box<dyn FnMut(PeerId, Option<crate::error::Error>)>;

/// The full set of callbacks a caller may register on a context.
#[derive(Default)]
pub struct Callbacks {
    pub on_discovered: Option<DiscoveredCallback>,
    pub on_connected: Option<ConnectedCallback>,
    pub on_disconnected: Option<DisconnectedCallback>,
    pub on_lost: Option<LostCallback>,
    pub on_message_received: Option<MessageReceivedCallback>,
    pub on_stream_complete: Option<StreamCompleteCallback>,
}

impl Callbacks {
    pub fn fire_discovered(&mut self, id: PeerId, name: &str) {
        if let Some(cb) = self.on_discovered.as_mut() {
            cb(id, name);
        }
    }

    pub fn fire_connected(&mut self, id: PeerId) {
        if let Some(cb) = self.on_connected.as_mut() {
            cb(id);
        }
    }

    pub fn fire_disconnected(&mut self, id: PeerId, err: crate::error::Error) {
        if let Some(cb) = self.on_disconnected.as_mut() {
            cb(id, err);
        }
    }

    pub fn fire_lost(&mut self, id: PeerId) {
        if let Some(cb) = self.on_lost.as_mut() {
            cb(id);
        }
    }

    pub fn fire_message_received(&mut self, id: PeerId, data: &[u8]) {
        if let Some(cb) = self.on_message_received.as_mut() {
            cb(id, data);
        }
    }

    pub fn fire_stream_complete(&mut self, id: PeerId, err: Option<crate::error::Error>) {
        if let Some(cb) = self.on_stream_complete.as_mut() {
            cb(id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unset_callback_is_a_no_op() {
        let mut cb = Callbacks::default();
        cb.fire_connected(PeerId(0));
    }

    #[test]
    fn registered_callback_fires_with_expected_args() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let mut cb = Callbacks::default();
        cb.on_message_received = Some(Box::new(move |id, data| {
            seen2.borrow_mut().push((id, data.to_vec()));
        }));
        cb.fire_message_received(PeerId(3), b"hi");
        assert_eq!(seen.borrow()[0], (PeerId(3), b"hi".to_vec()));
    }
}
