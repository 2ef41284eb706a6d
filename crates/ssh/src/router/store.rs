//! Per-consumer mailboxes.

use crate::lock;
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Ordered list of messages waiting for a consumer.
///
/// Messages are handed out in arrival order, first match wins. Sticky
/// messages (CHANNEL_EOF, CHANNEL_CLOSE) are returned as copies and stay
/// in place, so every later waiter observes the end of the stream too.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Mutex<VecDeque<Message>>,
}

impl MessageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message.
    pub fn push(&self, msg: Message) {
        lock(&self.messages).push_back(msg);
    }

    /// Returns the oldest message matching `predicate`, removing it unless
    /// it is sticky.
    pub fn take_matching<F>(&self, predicate: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let mut messages = lock(&self.messages);
        let index = messages.iter().position(|m| predicate(m))?;
        if messages[index].is_sticky() {
            return Some(messages[index].clone());
        }
        messages.remove(index)
    }

    /// Returns true if a message matching `predicate` is buffered.
    pub fn has_matching<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Message) -> bool,
    {
        lock(&self.messages).iter().any(|m| predicate(m))
    }

    /// Number of buffered messages, sticky ones included.
    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        lock(&self.messages).is_empty()
    }

    /// Drops everything.
    pub fn clear(&self) {
        lock(&self.messages).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use bytes::Bytes;

    fn msg(type_byte: u8, channel: u32, extra: u8) -> Message {
        let mut payload = vec![type_byte];
        payload.extend_from_slice(&channel.to_be_bytes());
        payload.push(extra);
        Message::parse(Bytes::from(payload), 0).unwrap()
    }

    #[test]
    fn test_fifo_among_matches() {
        let store = MessageStore::new();
        store.push(msg(94, 0, 1));
        store.push(msg(99, 0, 0));
        store.push(msg(94, 0, 2));

        let is_data = |m: &Message| m.is(MessageType::ChannelData);
        assert_eq!(store.take_matching(is_data).unwrap().payload()[5], 1);
        assert_eq!(store.take_matching(is_data).unwrap().payload()[5], 2);
        assert!(store.take_matching(is_data).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sticky_stays_visible() {
        let store = MessageStore::new();
        store.push(msg(96, 3, 0));
        store.push(msg(97, 3, 0));

        let is_close = |m: &Message| m.is(MessageType::ChannelClose);
        for _ in 0..3 {
            assert!(store.take_matching(is_close).is_some());
        }
        assert!(store.has_matching(|m| m.is(MessageType::ChannelEof)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_data_before_eof() {
        let store = MessageStore::new();
        store.push(msg(94, 0, 7));
        store.push(msg(96, 0, 0));

        let reads = |m: &Message| m.is(MessageType::ChannelData) || m.is_sticky();
        assert!(store.take_matching(reads).unwrap().is(MessageType::ChannelData));
        assert!(store.take_matching(reads).unwrap().is(MessageType::ChannelEof));
        assert!(store.take_matching(reads).unwrap().is(MessageType::ChannelEof));
    }

    #[test]
    fn test_clear() {
        let store = MessageStore::new();
        store.push(msg(97, 0, 0));
        store.clear();
        assert!(store.is_empty());
    }
}
