//! Flow-control accounting for one channel.
//!
//! The server bounds its send window by `connection_buffer_size`; the client
//! owes a DCP_BUFFER_ACK for every data-bearing frame it consumes.  Frames
//! are charged at full wire size, header included.  Credit moves in two
//! steps: a received frame becomes *outstanding*, and once the listener has
//! acknowledged it the bytes become *ackable*; crossing the ack watermark
//! flushes the ackable total to the server in one buffer-ack.

use std::time::{Duration, Instant};

/// Byte accounting for one channel.  Not shared: lives on the channel task.
#[derive(Debug)]
pub struct FlowControl {
    buffer_size: u32,
    watermark: u32,
    /// Received but not yet consumed by the listener.
    outstanding: u32,
    /// Consumed but not yet acked to the server.
    ackable: u32,
    /// Running total of bytes acked over the channel lifetime.
    total_acked: u64,
    /// Set while `outstanding >= buffer_size`; cleared on any consumption.
    saturated_since: Option<Instant>,
}

impl FlowControl {
    /// `threshold` is the fraction of the buffer that triggers an ack
    /// (default 0.5 from config).
    pub fn new(buffer_size: u32, threshold: f64) -> Self {
        FlowControl {
            buffer_size,
            watermark: (f64::from(buffer_size) * threshold) as u32,
            outstanding: 0,
            ackable: 0,
            total_acked: 0,
            saturated_since: None,
        }
    }

    /// Disabled accounting (no `connection_buffer_size` negotiated).
    pub fn disabled() -> Self {
        Self::new(0, 0.0)
    }

    pub fn is_enabled(&self) -> bool {
        self.buffer_size > 0
    }

    /// Charge a received data-bearing frame.
    pub fn on_frame(&mut self, wire_len: u32) {
        if !self.is_enabled() {
            return;
        }
        self.outstanding = self.outstanding.saturating_add(wire_len);
        if self.outstanding >= self.buffer_size && self.saturated_since.is_none() {
            self.saturated_since = Some(Instant::now());
        }
    }

    /// Record listener consumption.  Returns the byte value to send in a
    /// DCP_BUFFER_ACK when the watermark was crossed.
    pub fn on_consumed(&mut self, wire_len: u32) -> Option<u32> {
        if !self.is_enabled() {
            return None;
        }
        self.outstanding = self.outstanding.saturating_sub(wire_len);
        if self.outstanding < self.buffer_size {
            self.saturated_since = None;
        }
        self.ackable = self.ackable.saturating_add(wire_len);
        if self.ackable >= self.watermark {
            let ack = self.ackable;
            self.ackable = 0;
            self.total_acked += u64::from(ack);
            return Some(ack);
        }
        None
    }

    /// True when the buffer has been full with no consumption for longer
    /// than `stall_timeout`.  Reported as a failure, never retried.
    pub fn is_stalled(&self, stall_timeout: Duration) -> bool {
        self.saturated_since
            .is_some_and(|since| since.elapsed() > stall_timeout)
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn total_acked(&self) -> u64 {
        self.total_acked
    }
}
