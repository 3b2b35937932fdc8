//! Incremental JSON framing over a raw byte stream.
//!
//! The MakerBot dialect puts bare JSON values on the TCP stream with no
//! length prefix, so framing relies on bracket/string balance. A frame is
//! complete when the top-level container closes. Interleaved with the JSON
//! traffic, the peer can emit opaque byte runs (camera payloads) announced
//! by a preceding JSON message; [`JsonFramer::begin_raw`] diverts the next
//! `n` bytes to a waiting consumer before JSON framing resumes.
//!
//! Because the announcing message and the binary bytes can land in the same
//! socket read, the framer supports a *hold*: the byte feeder stops at the
//! frame boundary ([`feed_frame`](JsonFramer::feed_frame) consumes nothing
//! while held) until the raw consumer has either installed its read or
//! released the stream. This is what makes the switch into raw mode atomic
//! with respect to byte feeding.

use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{oneshot, Notify};

/// Framing state. `Raw` diverts bytes to the pending raw read; `Held`
/// consumes nothing until the raw consumer decides what comes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between frames; skipping whitespace, waiting for `{` or `[`.
    Idle,
    /// Inside a JSON container, outside any string.
    InContainer,
    /// Inside a string literal.
    InString,
    /// Immediately after a backslash inside a string.
    Escape,
    /// Diverting bytes to a pending raw read.
    Raw,
    /// Stream handed to a raw consumer; no bytes are consumed.
    Held,
}

/// A pending length-delimited raw extraction.
struct RawRead {
    expected: usize,
    buf: BytesMut,
    tx: oneshot::Sender<Bytes>,
}

struct Inner {
    state: State,
    stack: Vec<u8>,
    buffer: BytesMut,
    raw: Option<RawRead>,
    /// True while a raw consumer owns the stream; raw completion parks the
    /// framer in `Held` instead of returning to `Idle`.
    window_open: bool,
}

impl Inner {
    fn reset(&mut self) {
        self.state = State::Idle;
        self.stack.clear();
        self.buffer.clear();
        self.raw = None;
        self.window_open = false;
    }

    fn emit(&mut self) -> Bytes {
        let frame = self.buffer.split().freeze();
        self.stack.clear();
        self.state = State::Idle;
        frame
    }

    /// Advance by one byte. Returns a frame when this byte completed one.
    fn transition(&mut self, b: u8) -> Option<Bytes> {
        match self.state {
            State::Idle => {
                if b == b'{' || b == b'[' {
                    self.buffer.put_u8(b);
                    self.stack.push(b);
                    self.state = State::InContainer;
                }
                // Whitespace and stray bytes between frames are dropped.
                None
            }
            State::InContainer => {
                self.buffer.put_u8(b);
                match b {
                    b'"' => {
                        self.state = State::InString;
                        None
                    }
                    b'{' | b'[' => {
                        self.stack.push(b);
                        None
                    }
                    b'}' | b']' => match self.stack.pop() {
                        Some(open) => {
                            let matched =
                                (open == b'{' && b == b'}') || (open == b'[' && b == b']');
                            // A mismatched close means the stream is
                            // unbalanced; hand the buffer up and resync.
                            if !matched || self.stack.is_empty() {
                                Some(self.emit())
                            } else {
                                None
                            }
                        }
                        None => Some(self.emit()),
                    },
                    _ => None,
                }
            }
            State::InString => {
                self.buffer.put_u8(b);
                match b {
                    b'"' => self.state = State::InContainer,
                    b'\\' => self.state = State::Escape,
                    _ => {}
                }
                None
            }
            State::Escape => {
                // Any single byte is consumed; escape validity is not
                // enforced here.
                self.buffer.put_u8(b);
                self.state = State::InString;
                None
            }
            State::Raw => {
                let raw = self.raw.as_mut().expect("raw state without pending read");
                raw.buf.put_u8(b);
                if raw.buf.len() >= raw.expected {
                    let raw = self.raw.take().unwrap();
                    // The receiver may have gone away; the bytes are
                    // consumed from the stream either way.
                    let _ = raw.tx.send(raw.buf.freeze());
                    self.stack.clear();
                    self.buffer.clear();
                    self.state = if self.window_open {
                        State::Held
                    } else {
                        State::Idle
                    };
                }
                None
            }
            State::Held => unreachable!("held framer must not be fed"),
        }
    }
}

/// Extracts whole JSON values, or declared-length raw byte blocks, from an
/// incrementally fed byte stream.
///
/// One mutex guards all transitions so that the reader task's feeding and a
/// command path's [`begin_raw`](Self::begin_raw) cannot race.
pub struct JsonFramer {
    inner: Mutex<Inner>,
    resumed: Notify,
}

impl JsonFramer {
    /// Create a framer in the idle state.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Idle,
                stack: Vec::new(),
                buffer: BytesMut::new(),
                raw: None,
                window_open: false,
            }),
            resumed: Notify::new(),
        }
    }

    /// Consume bytes from `data` up to (and including) the first completed
    /// JSON frame. Returns the frame, if any, and how many bytes were
    /// consumed.
    ///
    /// Stopping at the frame boundary lets the caller dispatch each frame
    /// before any following byte is interpreted, which is what allows a
    /// frame to hand the stream over to a raw consumer. While the framer is
    /// held, nothing is consumed (`(None, 0)`); wait on
    /// [`ready`](Self::ready) before retrying. A completed raw read while a
    /// hold is open also stops consumption.
    ///
    /// Returned frames are the on-wire byte run of one top-level JSON
    /// value, internal whitespace preserved.
    pub fn feed_frame(&self, data: &[u8]) -> (Option<Bytes>, usize) {
        let mut inner = self.inner.lock().unwrap();
        let mut consumed = 0;
        for &b in data {
            if inner.state == State::Held {
                break;
            }
            let frame = inner.transition(b);
            consumed += 1;
            if frame.is_some() {
                return (frame, consumed);
            }
        }
        (None, consumed)
    }

    /// Feed a whole chunk, collecting every frame it completed. Stops early
    /// if the framer becomes held.
    pub fn feed(&self, data: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (frame, consumed) = self.feed_frame(&data[offset..]);
            offset += consumed;
            if let Some(frame) = frame {
                frames.push(frame);
            }
            if consumed == 0 {
                break;
            }
        }
        frames
    }

    /// Divert the next `expected` bytes of the stream to the returned
    /// receiver.
    ///
    /// The mode switch happens under the framer lock, so no byte fed
    /// concurrently can slip past into JSON scanning. A zero-length read
    /// completes immediately. If a hold is open, the completed read parks
    /// the framer back in the held state for the next instruction;
    /// otherwise JSON framing resumes directly. Dropping the framer state
    /// ([`reset`](Self::reset)) before the length is satisfied drops the
    /// sender and the receiver observes a closed channel.
    pub fn begin_raw(&self, expected: usize) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        if expected == 0 {
            let _ = tx.send(Bytes::new());
            return rx;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.raw = Some(RawRead {
            expected,
            buf: BytesMut::with_capacity(expected),
            tx,
        });
        inner.state = State::Raw;
        drop(inner);

        self.resumed.notify_waiters();
        rx
    }

    /// Hand the stream to a raw consumer at the current frame boundary.
    /// [`feed_frame`](Self::feed_frame) consumes nothing until
    /// [`begin_raw`](Self::begin_raw) or [`release`](Self::release).
    pub fn hold(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.window_open = true;
        if inner.state == State::Idle {
            inner.state = State::Held;
        }
    }

    /// Close a raw consumer's hold and resume JSON framing.
    pub fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.window_open = false;
        if inner.state == State::Held {
            inner.state = State::Idle;
        }
        drop(inner);

        self.resumed.notify_waiters();
    }

    /// Wait until the framer is willing to consume bytes again.
    pub async fn ready(&self) {
        loop {
            let resumed = self.resumed.notified();
            if self.inner.lock().unwrap().state != State::Held {
                return;
            }
            resumed.await;
        }
    }

    /// Drop all framing state, including any pending raw read and hold.
    pub fn reset(&self) {
        self.inner.lock().unwrap().reset();
        self.resumed.notify_waiters();
    }
}

impl Default for JsonFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_object_frame() {
        let framer = JsonFramer::new();
        let frames = framer.feed(br#"{"id":"1","result":true}"#);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], br#"{"id":"1","result":true}"#);
    }

    #[test]
    fn test_concatenated_values_with_whitespace() {
        let framer = JsonFramer::new();
        let frames = framer.feed(b"{\"a\":1} \t\r\n [2,3]\n{\"b\":[]}");
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], br#"{"a":1}"#);
        assert_eq!(&frames[1][..], b"[2,3]");
        assert_eq!(&frames[2][..], br#"{"b":[]}"#);
    }

    #[test]
    fn test_internal_whitespace_preserved() {
        let framer = JsonFramer::new();
        let wire = b"{ \"a\" : [ 1 , 2 ] }";
        let frames = framer.feed(wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &wire[..]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let framer = JsonFramer::new();
        let wire = br#"{"nested":{"deep":[{"x":"y"}]}}"#;
        let mut frames = Vec::new();
        for &b in wire.iter() {
            frames.extend(framer.feed(&[b]));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &wire[..]);
    }

    #[test]
    fn test_feed_frame_stops_at_frame_boundary() {
        let framer = JsonFramer::new();
        let wire = b"{\"a\":1}{\"b\":2}";
        let (frame, consumed) = framer.feed_frame(wire);
        assert_eq!(&frame.unwrap()[..], br#"{"a":1}"#);
        assert_eq!(consumed, 7);

        let (frame, consumed) = framer.feed_frame(&wire[consumed..]);
        assert_eq!(&frame.unwrap()[..], br#"{"b":2}"#);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_escaped_quote_does_not_close_string() {
        let framer = JsonFramer::new();
        let wire = br#"{"msg":"say \"hi\" {now}"}"#;
        let frames = framer.feed(wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &wire[..]);
    }

    #[test]
    fn test_escaped_backslash_then_quote_closes_string() {
        // `"\\"` ends the string; the closing brace must complete the frame.
        let framer = JsonFramer::new();
        let wire = br#"{"path":"C:\\"}"#;
        let frames = framer.feed(wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &wire[..]);
    }

    #[test]
    fn test_brackets_inside_string_ignored() {
        let framer = JsonFramer::new();
        let wire = br#"{"weird":"}{]["}"#;
        let frames = framer.feed(wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &wire[..]);
    }

    #[test]
    fn test_deep_nesting_balances() {
        let framer = JsonFramer::new();
        let mut wire = Vec::new();
        for _ in 0..64 {
            wire.extend_from_slice(b"[{\"a\":");
        }
        wire.extend_from_slice(b"0");
        for _ in 0..64 {
            wire.extend_from_slice(b"}]");
        }
        let frames = framer.feed(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &wire[..]);
    }

    #[test]
    fn test_mismatched_bracket_emits_and_resets() {
        let framer = JsonFramer::new();
        let frames = framer.feed(b"{\"a\":[1}]");
        // `}` closes a `[` scope: unbalanced, emitted as-is for the upper
        // layer to reject.
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"{\"a\":[1}");

        // Framer must have resynced.
        let frames = framer.feed(br#"{"ok":true}"#);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], br#"{"ok":true}"#);
    }

    #[test]
    fn test_stray_bytes_between_frames_ignored() {
        let framer = JsonFramer::new();
        let frames = framer.feed(b"xx{\"a\":1}garbage[2]");
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], br#"{"a":1}"#);
        assert_eq!(&frames[1][..], b"[2]");
    }

    #[tokio::test]
    async fn test_raw_read_exact_bytes() {
        let framer = JsonFramer::new();
        let rx = framer.begin_raw(8);
        framer.feed(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03]);
        let data = rx.await.unwrap();
        assert_eq!(&data[..], &[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03]);
    }

    #[tokio::test]
    async fn test_raw_read_arbitrary_content_then_json_resumes() {
        let framer = JsonFramer::new();
        let rx = framer.begin_raw(4);
        // Raw block happens to contain JSON-significant bytes; they must
        // not be interpreted.
        let mut stream = Vec::new();
        stream.extend_from_slice(b"{}[]");
        stream.extend_from_slice(br#"{"next":1}"#);
        let frames = framer.feed(&stream);
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"{}[]"));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], br#"{"next":1}"#);
    }

    #[tokio::test]
    async fn test_raw_read_split_across_feeds() {
        let framer = JsonFramer::new();
        let rx = framer.begin_raw(6);
        assert!(framer.feed(b"abc").is_empty());
        assert!(framer.feed(b"def").is_empty());
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_zero_length_raw_read_completes_immediately() {
        let framer = JsonFramer::new();
        let rx = framer.begin_raw(0);
        assert_eq!(rx.await.unwrap(), Bytes::new());
        // Framer still frames JSON normally.
        let frames = framer.feed(b"[1]");
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_drops_pending_raw_read() {
        let framer = JsonFramer::new();
        let rx = framer.begin_raw(16);
        framer.feed(b"partial");
        framer.reset();
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_no_frames_while_raw_pending() {
        let framer = JsonFramer::new();
        let _rx = framer.begin_raw(32);
        // A full JSON value inside the raw window must not be emitted.
        let frames = framer.feed(br#"{"hidden":true}"#);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_held_framer_consumes_nothing() {
        let framer = JsonFramer::new();
        framer.hold();
        let (frame, consumed) = framer.feed_frame(br#"{"a":1}"#);
        assert!(frame.is_none());
        assert_eq!(consumed, 0);

        framer.release();
        let (frame, consumed) = framer.feed_frame(br#"{"a":1}"#);
        assert_eq!(&frame.unwrap()[..], br#"{"a":1}"#);
        assert_eq!(consumed, 7);
    }

    #[tokio::test]
    async fn test_held_raw_read_parks_between_reads() {
        // The camera pattern: notification, then header and payload raw
        // reads, with everything already sitting in the buffer.
        let framer = JsonFramer::new();
        framer.hold();

        let wire = b"HDRHDRHDRHDRHDR1PAYLOAD!";

        let rx = framer.begin_raw(16);
        let (frame, consumed) = framer.feed_frame(wire);
        assert!(frame.is_none());
        assert_eq!(consumed, 16);
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"HDRHDRHDRHDRHDR1"));

        // Back on hold; the payload must not leak into JSON scanning.
        let (frame, consumed) = framer.feed_frame(&wire[16..]);
        assert!(frame.is_none());
        assert_eq!(consumed, 0);

        let rx = framer.begin_raw(8);
        let (_, consumed) = framer.feed_frame(&wire[16..]);
        assert_eq!(consumed, 8);
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"PAYLOAD!"));

        framer.release();
        let (frame, consumed) = framer.feed_frame(b"[7]");
        assert_eq!(&frame.unwrap()[..], b"[7]");
        assert_eq!(consumed, 3);
    }

    #[tokio::test]
    async fn test_ready_returns_after_release() {
        let framer = std::sync::Arc::new(JsonFramer::new());
        framer.hold();

        let waiter = {
            let framer = framer.clone();
            tokio::spawn(async move { framer.ready().await })
        };
        tokio::task::yield_now().await;

        framer.release();
        waiter.await.unwrap();
    }
}
