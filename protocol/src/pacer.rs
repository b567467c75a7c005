//! Frame pacer (§4.1): owns egress for one connection, restamping DATA
//! frames just before they hit the wire and capping how many leave in one
//! drain cycle so legacy clients don't get flooded past their receive
//! window.

use crate::frame::OutboundFrame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Default burst cap, matching the ~16-frame P3 client window (§4.1).
pub const DEFAULT_BURST: usize = 16;

struct QueuedFrame {
    frame: OutboundFrame,
    #[allow(dead_code)]
    label: &'static str,
}

struct PacerInner {
    priority: VecDeque<QueuedFrame>,
    normal: VecDeque<QueuedFrame>,
    tx_seq: u8,
    rx_seq: u8,
}

impl PacerInner {
    fn drain_limited(&mut self, burst: usize, sink: &mpsc::UnboundedSender<Vec<u8>>) -> DrainReport {
        let mut sent = 0usize;
        let mut dropped = 0usize;

        while sent < burst {
            let queued = match self.priority.pop_front().or_else(|| self.normal.pop_front()) {
                Some(q) => q,
                None => break,
            };

            let bytes = queued.frame.stamp(self.tx_seq, self.rx_seq);
            self.tx_seq = self.tx_seq.wrapping_add(1);

            if sink.send(bytes).is_err() {
                dropped += 1;
                continue;
            }
            sent += 1;
        }

        DrainReport {
            sent,
            dropped,
            priority_remaining: self.priority.len(),
            normal_remaining: self.normal.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DrainReport {
    pub sent: usize,
    pub dropped: usize,
    pub priority_remaining: usize,
    pub normal_remaining: usize,
}

/// Shared handle to a connection's pacer. Cloning is cheap (`Arc`); other
/// connections' tasks hold clones so broadcast/IM delivery can enqueue
/// without ever blocking on the recipient's I/O.
#[derive(Clone)]
pub struct PacerHandle {
    inner: Arc<Mutex<PacerInner>>,
    sink: mpsc::UnboundedSender<Vec<u8>>,
}

impl PacerHandle {
    /// Creates a pacer plus the receiving half that a connection's writer
    /// task should drain to the socket.
    pub fn new() -> (PacerHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sink, rx) = mpsc::unbounded_channel();
        let handle = PacerHandle {
            inner: Arc::new(Mutex::new(PacerInner {
                priority: VecDeque::new(),
                normal: VecDeque::new(),
                tx_seq: 0,
                rx_seq: 0,
            })),
            sink,
        };
        (handle, rx)
    }

    pub fn enqueue_safe(&self, frame: OutboundFrame, label: &'static str) {
        let mut inner = self.inner.lock().expect("pacer mutex poisoned");
        inner.normal.push_back(QueuedFrame { frame, label });
    }

    pub fn enqueue_priority_safe(&self, frame: OutboundFrame, label: &'static str) {
        let mut inner = self.inner.lock().expect("pacer mutex poisoned");
        inner.priority.push_back(QueuedFrame { frame, label });
    }

    pub fn drain_limited(&self, burst: usize) -> DrainReport {
        let mut inner = self.inner.lock().expect("pacer mutex poisoned");
        inner.drain_limited(burst, &self.sink)
    }

    /// Record the TX sequence seen on an inbound frame so the next stamped
    /// outbound frame echoes it back as RX.
    pub fn note_received(&self, tx: u8) {
        let mut inner = self.inner.lock().expect("pacer mutex poisoned");
        inner.rx_seq = tx;
    }

    /// Writes pre-built bytes straight to the socket, bypassing the
    /// queue/restamp path. Used for short control frames (§6), which carry
    /// no TX/RX sequence to stamp.
    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.sink.send(bytes);
    }

    pub fn enqueue_and_drain(&self, frame: OutboundFrame, label: &'static str, burst: usize) -> DrainReport {
        self.enqueue_safe(frame, label);
        self.drain_limited(burst)
    }

    pub fn enqueue_priority_and_drain(
        &self,
        frame: OutboundFrame,
        label: &'static str,
        burst: usize,
    ) -> DrainReport {
        self.enqueue_priority_safe(frame, label);
        self.drain_limited(burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_drains_before_normal() {
        let (pacer, mut rx) = PacerHandle::new();
        pacer.enqueue_safe(OutboundFrame::new(*b"AA", b"normal".to_vec()), "normal");
        pacer.enqueue_priority_safe(OutboundFrame::new(*b"CA", b"priority".to_vec()), "priority");

        let report = pacer.drain_limited(10);
        assert_eq!(report.sent, 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(&first[8..10], b"CA");
        let second = rx.try_recv().unwrap();
        assert_eq!(&second[8..10], b"AA");
    }

    #[test]
    fn burst_cap_limits_drain() {
        let (pacer, mut rx) = PacerHandle::new();
        for _ in 0..5 {
            pacer.enqueue_safe(OutboundFrame::new(*b"AA", b"x".to_vec()), "x");
        }

        let report = pacer.drain_limited(3);
        assert_eq!(report.sent, 3);
        assert_eq!(report.normal_remaining, 2);

        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 3);
    }
}
