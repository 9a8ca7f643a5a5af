//! Outbound pipeline: pending frames and round-trip flush waiters.
//!
//! Every frame gets a sequence number when queued. A flush waiter is tied
//! to the sequence of the `PING` queued for it and resolves on the matching
//! `PONG`; PONGs arrive in PING order, so waiters form a FIFO.

use crate::error::{NatsError, Result};
use crate::frame::PING_FRAME;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

pub const DEFAULT_RECONNECT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Application publish. Kept across reconnects.
    Publish,
    /// Round-trip marker. Kept across reconnects.
    Ping,
    /// SUB, UNSUB and PONG. Dropped on disconnect because subscriptions are
    /// replayed from the registry.
    Control,
}

#[derive(Debug, Clone)]
struct Frame {
    seq: u64,
    kind: FrameKind,
    bytes: Bytes,
}

#[derive(Debug)]
struct Waiter<W> {
    ping_seq: u64,
    action: W,
}

#[derive(Debug)]
pub struct OutboundBuffer<W> {
    frames: VecDeque<Frame>,
    pending_bytes: usize,
    next_seq: u64,
    /// Highest sequence handed to the transport; 0 before any write.
    written_seq: u64,
    waiters: VecDeque<Waiter<W>>,
    max_buffered_bytes: usize,
}

impl<W> Default for OutboundBuffer<W> {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BUFFER_SIZE)
    }
}

impl<W> OutboundBuffer<W> {
    #[must_use]
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            pending_bytes: 0,
            next_seq: 1,
            written_seq: 0,
            waiters: VecDeque::new(),
            max_buffered_bytes,
        }
    }

    fn push(&mut self, kind: FrameKind, bytes: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending_bytes += bytes.len();
        self.frames.push_back(Frame { seq, kind, bytes });
        seq
    }

    /// Queues a frame while connected. No size limit applies.
    pub fn enqueue(&mut self, kind: FrameKind, bytes: Bytes) -> u64 {
        self.push(kind, bytes)
    }

    /// Queues a publish while disconnected, enforcing the buffer limit.
    pub fn enqueue_buffered(&mut self, bytes: Bytes) -> Result<u64> {
        let size = self.pending_bytes + bytes.len();
        if size > self.max_buffered_bytes {
            return Err(NatsError::ReconnectBufferExceeded {
                size,
                max: self.max_buffered_bytes,
            });
        }
        Ok(self.push(FrameKind::Publish, bytes))
    }

    /// Queues a `PING` and a waiter resolved by its `PONG`.
    pub fn enqueue_ping(&mut self, action: W) -> u64 {
        let ping_seq = self.push(FrameKind::Ping, Bytes::from_static(PING_FRAME));
        self.waiters.push_back(Waiter { ping_seq, action });
        ping_seq
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.frames.is_empty()
    }

    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Takes queued frames, up to roughly `max_bytes`, as one contiguous
    /// write. At least one frame is returned when any is pending.
    pub fn take_writable(&mut self, max_bytes: usize) -> Option<BytesMut> {
        let mut out = BytesMut::new();
        while let Some(frame) = self.frames.front() {
            if !out.is_empty() && out.len() + frame.bytes.len() > max_bytes {
                break;
            }
            let Some(frame) = self.frames.pop_front() else {
                break;
            };
            self.pending_bytes -= frame.bytes.len();
            self.written_seq = frame.seq;
            out.extend_from_slice(&frame.bytes);
        }
        (!out.is_empty()).then_some(out)
    }

    /// Resolves the oldest waiter whose `PING` was written. Unsolicited
    /// PONGs return `None`.
    pub fn on_pong(&mut self) -> Option<W> {
        match self.waiters.front() {
            Some(waiter) if waiter.ping_seq <= self.written_seq => {
                self.waiters.pop_front().map(|w| w.action)
            }
            _ => None,
        }
    }

    /// Rebuilds the queue for a new server: `replay` control frames first,
    /// then a fresh `PING` for every waiter whose ping was already written,
    /// then the surviving publishes and pings in the order they were queued.
    /// Rebuilt frames get fresh sequences above every written one, so no
    /// waiter counts as sent until its new `PING` is taken again.
    pub fn rebuild_for_reconnect<I>(&mut self, replay: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        let survivors: Vec<Frame> = self
            .frames
            .drain(..)
            .filter(|f| f.kind != FrameKind::Control)
            .collect();
        self.pending_bytes = 0;

        for bytes in replay {
            self.push(FrameKind::Control, bytes);
        }

        let written = self.written_seq;
        let mut resent = Vec::new();
        for (idx, waiter) in self.waiters.iter().enumerate() {
            if waiter.ping_seq <= written {
                resent.push(idx);
            }
        }
        for idx in resent {
            let seq = self.push(FrameKind::Ping, Bytes::from_static(PING_FRAME));
            self.waiters[idx].ping_seq = seq;
        }

        for frame in survivors {
            let old = frame.seq;
            let seq = self.push(frame.kind, frame.bytes);
            if frame.kind == FrameKind::Ping {
                if let Some(waiter) = self.waiters.iter_mut().find(|w| w.ping_seq == old) {
                    waiter.ping_seq = seq;
                }
            }
        }
    }

    /// Drops all frames and returns every waiter, oldest first.
    pub fn close(&mut self) -> Vec<W> {
        self.frames.clear();
        self.pending_bytes = 0;
        self.waiters.drain(..).map(|w| w.action).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pub_frame(n: u8) -> Bytes {
        Bytes::from(format!("PUB foo 1\r\n{n}\r\n"))
    }

    #[test]
    fn test_flush_waiter_fires_only_after_ping_written() {
        let mut out: OutboundBuffer<&str> = OutboundBuffer::default();
        out.enqueue(FrameKind::Publish, pub_frame(1));
        out.enqueue_ping("flush");

        assert_eq!(out.on_pong(), None);
        let written = out.take_writable(usize::MAX).unwrap();
        assert!(written.ends_with(b"PING\r\n"));
        assert_eq!(out.on_pong(), Some("flush"));
        assert_eq!(out.on_pong(), None);
    }

    #[test]
    fn test_waiters_fire_in_fifo_order() {
        let mut out: OutboundBuffer<u32> = OutboundBuffer::default();
        out.enqueue_ping(1);
        out.enqueue_ping(2);
        out.enqueue_ping(3);
        out.take_writable(usize::MAX);
        assert_eq!(out.on_pong(), Some(1));
        assert_eq!(out.on_pong(), Some(2));
        assert_eq!(out.on_pong(), Some(3));
    }

    #[test]
    fn test_take_writable_respects_chunk_size() {
        let mut out: OutboundBuffer<()> = OutboundBuffer::default();
        for n in 0..5 {
            out.enqueue(FrameKind::Publish, pub_frame(n));
        }
        let frame_len = pub_frame(0).len();
        let chunk = out.take_writable(frame_len * 2).unwrap();
        assert_eq!(chunk.len(), frame_len * 2);
        assert_eq!(out.pending_frames(), 3);
        let oversized = out.take_writable(1).unwrap();
        assert_eq!(oversized.len(), frame_len);
    }

    #[test]
    fn test_buffer_limit_while_disconnected() {
        let mut out: OutboundBuffer<()> = OutboundBuffer::new(32);
        assert!(out.enqueue_buffered(Bytes::from(vec![b'a'; 20])).is_ok());
        let err = out.enqueue_buffered(Bytes::from(vec![b'a'; 20])).unwrap_err();
        assert_eq!(err, NatsError::ReconnectBufferExceeded { size: 40, max: 32 });
        assert_eq!(out.pending_bytes(), 20);
    }

    #[test]
    fn test_rebuild_drops_control_and_resends_written_pings() {
        let mut out: OutboundBuffer<&str> = OutboundBuffer::default();
        out.enqueue_ping("sent");
        out.take_writable(usize::MAX);

        out.enqueue(FrameKind::Control, Bytes::from_static(b"SUB foo 1\r\n"));
        out.enqueue(FrameKind::Publish, pub_frame(1));
        out.enqueue_ping("queued");

        out.rebuild_for_reconnect(vec![Bytes::from_static(b"SUB foo 1\r\nUNSUB 1 9\r\n")]);
        assert_eq!(out.on_pong(), None);

        let written = out.take_writable(usize::MAX).unwrap();
        assert_eq!(
            &written[..],
            b"SUB foo 1\r\nUNSUB 1 9\r\nPING\r\nPUB foo 1\r\n1\r\nPING\r\n"
        );
        assert_eq!(out.on_pong(), Some("sent"));
        assert_eq!(out.on_pong(), Some("queued"));
    }

    #[test]
    fn test_rebuild_with_nothing_pending() {
        let mut out: OutboundBuffer<()> = OutboundBuffer::default();
        out.enqueue(FrameKind::Publish, pub_frame(1));
        out.take_writable(usize::MAX);
        out.rebuild_for_reconnect(Vec::new());
        assert!(!out.has_pending());
        assert_eq!(out.on_pong(), None);
    }

    #[test]
    fn test_close_returns_waiters() {
        let mut out: OutboundBuffer<u8> = OutboundBuffer::default();
        out.enqueue(FrameKind::Publish, pub_frame(1));
        out.enqueue_ping(1);
        out.enqueue_ping(2);
        assert_eq!(out.close(), vec![1, 2]);
        assert!(!out.has_pending());
    }
}
