// src/message.rs
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// What happens to the connection once its outbound queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Keep,
    Close,
}

/// One queued outbound chunk. Chunks leave in FIFO order; a partially sent
/// chunk is pushed back to the front so bytes stay sequential.
#[derive(Debug)]
pub struct OutboundChunk {
    pub state: ConnectionState,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct Message {
    request_buf: Vec<u8>,
    responses: VecDeque<OutboundChunk>,
    last_active: Instant,
    order_key: u64,
    /// True once the request is fully received and its response queued;
    /// a timed-out complete message is dropped rather than answered.
    complete: bool,
}

/// Per-client message state plus the timeout index.
///
/// The index is ordered by effective activity: refreshing a connection
/// (keep-alive reuse) moves it to the tail, so a sweep walks strictly
/// oldest-first and can stop at the first fresh entry. A swept entry leaves
/// the index immediately — it is either disconnected or answered with a
/// timeout response, never swept twice.
pub struct MessageStore {
    messages: HashMap<RawFd, Message>,
    order: BTreeMap<u64, RawFd>,
    next_key: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
            order: BTreeMap::new(),
            next_key: 0,
        }
    }

    pub fn insert(&mut self, fd: RawFd, now: Instant) {
        let key = self.next_key;
        self.next_key += 1;
        self.messages.insert(
            fd,
            Message {
                request_buf: Vec::new(),
                responses: VecDeque::new(),
                last_active: now,
                order_key: key,
                complete: false,
            },
        );
        self.order.insert(key, fd);
    }

    /// Returns false when the fd was already gone; disconnect paths use this
    /// to stay idempotent.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        match self.messages.remove(&fd) {
            Some(message) => {
                self.order.remove(&message.order_key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.messages.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.messages.keys().copied().collect()
    }

    // ---- inbound buffer ----

    pub fn append_request(&mut self, fd: RawFd, bytes: &[u8]) {
        if let Some(message) = self.messages.get_mut(&fd) {
            message.request_buf.extend_from_slice(bytes);
        }
    }

    pub fn request_buf(&self, fd: RawFd) -> Option<&[u8]> {
        self.messages.get(&fd).map(|m| m.request_buf.as_slice())
    }

    /// Drop the consumed front of the inbound buffer, keeping any pipelined
    /// remainder for the next exchange.
    pub fn drain_request(&mut self, fd: RawFd, consumed: usize) {
        if let Some(message) = self.messages.get_mut(&fd) {
            let n = consumed.min(message.request_buf.len());
            message.request_buf.drain(..n);
        }
    }

    // ---- completion flag ----

    pub fn set_complete(&mut self, fd: RawFd, complete: bool) {
        if let Some(message) = self.messages.get_mut(&fd) {
            message.complete = complete;
        }
    }

    pub fn is_complete(&self, fd: RawFd) -> bool {
        self.messages.get(&fd).map(|m| m.complete).unwrap_or(false)
    }

    // ---- outbound queue ----

    pub fn push_response(&mut self, fd: RawFd, chunk: OutboundChunk) {
        if let Some(message) = self.messages.get_mut(&fd) {
            message.responses.push_back(chunk);
        }
    }

    /// Front-of-queue insert: partial-send remainders and synthesized error
    /// responses that must preempt anything still queued.
    pub fn push_front_response(&mut self, fd: RawFd, chunk: OutboundChunk) {
        if let Some(message) = self.messages.get_mut(&fd) {
            message.responses.push_front(chunk);
        }
    }

    pub fn pop_response(&mut self, fd: RawFd) -> Option<OutboundChunk> {
        self.messages.get_mut(&fd)?.responses.pop_front()
    }

    pub fn has_responses(&self, fd: RawFd) -> bool {
        self.messages
            .get(&fd)
            .map(|m| !m.responses.is_empty())
            .unwrap_or(false)
    }

    // ---- activity / timeout ----

    /// Refresh activity: new timestamp, and move the entry to the tail of
    /// the sweep order.
    pub fn touch(&mut self, fd: RawFd, now: Instant) {
        let Some(message) = self.messages.get_mut(&fd) else {
            return;
        };
        message.last_active = now;
        let old_key = message.order_key;
        let new_key = self.next_key;
        self.next_key += 1;
        message.order_key = new_key;
        self.order.remove(&old_key);
        self.order.insert(new_key, fd);
    }

    /// Collect every entry whose inactivity exceeds `timeout`, oldest first,
    /// stopping at the first entry still fresh. Collected entries are
    /// removed from the sweep order (their messages stay until the reactor
    /// disconnects or answers them).
    pub fn expired(&mut self, timeout: Duration, now: Instant) -> Vec<(RawFd, bool)> {
        let mut timed_out = Vec::new();
        for (&key, &fd) in self.order.iter() {
            let Some(message) = self.messages.get(&fd) else {
                continue;
            };
            if now.duration_since(message.last_active) < timeout {
                break;
            }
            timed_out.push((key, fd, message.complete));
        }

        timed_out
            .into_iter()
            .map(|(key, fd, complete)| {
                self.order.remove(&key);
                (fd, complete)
            })
            .collect()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(bytes: &[u8]) -> OutboundChunk {
        OutboundChunk {
            state: ConnectionState::Keep,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn response_queue_is_fifo_with_front_pushback() {
        let mut store = MessageStore::new();
        store.insert(3, Instant::now());

        store.push_response(3, chunk(b"first"));
        store.push_response(3, chunk(b"second"));

        let head = store.pop_response(3).unwrap();
        assert_eq!(head.bytes, b"first");

        // A partial send re-queues the unsent remainder at the front.
        store.push_front_response(3, chunk(b"rst"));
        assert_eq!(store.pop_response(3).unwrap().bytes, b"rst");
        assert_eq!(store.pop_response(3).unwrap().bytes, b"second");
        assert!(store.pop_response(3).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = MessageStore::new();
        store.insert(5, Instant::now());
        assert!(store.remove(5));
        assert!(!store.remove(5));
        assert!(!store.contains(5));
    }

    #[test]
    fn drain_keeps_pipelined_remainder() {
        let mut store = MessageStore::new();
        store.insert(4, Instant::now());
        store.append_request(4, b"GET / HTTP/1.1\r\n\r\nGET /next");
        store.drain_request(4, 18);
        assert_eq!(store.request_buf(4).unwrap(), b"GET /next");
    }

    #[test]
    fn sweep_stops_at_first_fresh_entry() {
        let mut store = MessageStore::new();
        let start = Instant::now();
        store.insert(1, start);
        store.insert(2, start + Duration::from_secs(10));
        store.insert(3, start + Duration::from_secs(10));

        let now = start + Duration::from_secs(5);
        let expired = store.expired(Duration::from_secs(3), now);
        assert_eq!(expired, vec![(1, false)]);

        // Swept entries leave the order index: a second sweep is empty.
        assert!(store.expired(Duration::from_secs(3), now).is_empty());
        // The message itself is still there until the reactor acts.
        assert!(store.contains(1));
    }

    #[test]
    fn touch_moves_entry_to_tail() {
        let mut store = MessageStore::new();
        let start = Instant::now();
        store.insert(1, start);
        store.insert(2, start);

        // fd 1 sees keep-alive activity; fd 2 does not.
        store.touch(1, start + Duration::from_secs(4));

        let expired = store.expired(Duration::from_secs(3), start + Duration::from_secs(5));
        assert_eq!(expired, vec![(2, false)]);
    }

    #[test]
    fn expired_reports_completion_flag() {
        let mut store = MessageStore::new();
        let start = Instant::now();
        store.insert(1, start);
        store.insert(2, start);
        store.set_complete(2, true);

        let expired = store.expired(Duration::from_secs(1), start + Duration::from_secs(2));
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&(1, false)));
        assert!(expired.contains(&(2, true)));
    }
}
