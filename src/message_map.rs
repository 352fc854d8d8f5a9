//! Key-indexed message tables owned by the supervisor loop.
//!
//! The supervisor keeps two of these: `processing` (at most one active
//! message per key) and `waiting` (at most one parked successor per key).
//! [`MessageMap::contains_message`] combines key lookup with exact envelope
//! identity so a displaced waiter's late end message cannot remove its
//! replacement.

use std::collections::HashMap;

use crate::message::Envelope;

#[derive(Default)]
pub(crate) struct MessageMap {
    entries: HashMap<i64, Envelope>,
}

impl MessageMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the message stored for `key`, if any.
    pub(crate) fn get(&self, key: i64) -> Option<&Envelope> {
        self.entries.get(&key)
    }

    /// Whether the exact message (key plus identity) is stored.
    pub(crate) fn contains_message(&self, message: &Envelope) -> bool {
        self.entries
            .get(&message.key())
            .is_some_and(|stored| stored.same(message))
    }

    /// Stores the message under its key, replacing any previous entry.
    pub(crate) fn add(&mut self, message: Envelope) {
        self.entries.insert(message.key(), message);
    }

    /// Removes and returns the entry for `key`.
    pub(crate) fn remove(&mut self, key: i64) -> Option<Envelope> {
        self.entries.remove(&key)
    }

    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Arc;

    use super::*;
    use crate::error::BoxError;
    use crate::message::{ReplyHandle, Signal};
    use crate::request::Request;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct StubReq {
        key: i64,
    }

    impl Request for StubReq {
        fn key(&self) -> i64 {
            self.key
        }

        fn valid(&self) -> Result<(), BoxError> {
            Ok(())
        }

        fn supersedes(&self, _other: &dyn Request) -> Result<(), BoxError> {
            Ok(())
        }

        fn finalize(&self) -> Result<(), BoxError> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn reply() -> ReplyHandle {
        let (tx, _rx) = mpsc::channel(1);
        ReplyHandle::new(tx, CancellationToken::new())
    }

    #[test]
    fn add_overwrites_same_key() {
        let mut map = MessageMap::new();
        let first: Arc<dyn Request> = Arc::new(StubReq { key: 7 });
        let second: Arc<dyn Request> = Arc::new(StubReq { key: 7 });
        map.add(Envelope::begin(Arc::clone(&first), reply(), 1));
        map.add(Envelope::begin(Arc::clone(&second), reply(), 2));

        assert_eq!(map.len(), 1);
        let probe = Envelope::begin(second, reply(), 2);
        assert!(map.contains_message(&probe));
    }

    #[test]
    fn contains_message_requires_identity_not_just_key() {
        let mut map = MessageMap::new();
        let req: Arc<dyn Request> = Arc::new(StubReq { key: 3 });
        map.add(Envelope::begin(Arc::clone(&req), reply(), 10));

        // Same request from the same worker: the end half matches.
        let end_same = Envelope::end(Arc::clone(&req), reply(), 10, Signal::Success);
        assert!(map.contains_message(&end_same));

        // Same request from a different worker does not match.
        let end_other_worker = Envelope::end(Arc::clone(&req), reply(), 11, Signal::Success);
        assert!(!map.contains_message(&end_other_worker));

        // Equal-looking request from a different allocation does not match.
        let other: Arc<dyn Request> = Arc::new(StubReq { key: 3 });
        let end_other_req = Envelope::end(other, reply(), 10, Signal::Success);
        assert!(!map.contains_message(&end_other_req));
    }

    #[test]
    fn remove_returns_the_entry() {
        let mut map = MessageMap::new();
        let req: Arc<dyn Request> = Arc::new(StubReq { key: 5 });
        map.add(Envelope::begin(req, reply(), 1));

        let removed = map.remove(5).map(|m| m.key());
        assert_eq!(removed, Some(5));
        assert_eq!(map.len(), 0);
        assert!(map.remove(5).is_none());
    }
}
