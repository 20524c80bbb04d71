//! Sliding-window delay/loss statistics (spec §4.5).
//!
//! These are inherent methods on [`crate::target::Target`] rather than a
//! separate struct: the rolling buffers are intrinsic target state, and
//! keeping the update logic next to the data it mutates keeps the
//! invariants (`delay_sum == Σ delay_buf`, `recently_lost` bounds) local
//! and easy to test in isolation, the way `transport::Destination`'s
//! `send`/`recv` methods do in the teacher.

use crate::target::Target;

impl Target {
    /// Allocates the sequence number for the next outgoing probe, folds
    /// it into the loss-window bookkeeping, and records it as `last_sent`
    /// (spec §3/§4.5). Returns the sequence to encode on the wire.
    pub fn prepare_send(&mut self) -> u32 {
        let seq = self.next_seq;
        self.on_send(seq);
        self.last_sent = seq;
        self.next_seq = seq + 1;
        seq
    }

    /// Updates loss-window bookkeeping for a newly sent sequence number
    /// `seq` (spec §4.5 "On each send").
    pub fn on_send(&mut self, seq: u32) {
        let w = self.loss_window_len() as u32;
        let i = (seq % w) as usize;

        if seq > w && self.loss_window[i] == 0 {
            self.recently_lost -= 1;
        }
        self.loss_window[i] = 0;

        let grace = self.config.avg_loss_delay_samples as u32;
        if seq > grace {
            let i1 = ((seq - grace) % w) as usize;
            if self.loss_window[i1] == 0 {
                self.recently_lost += 1;
            }
        }

        if self.recently_lost < 0 {
            self.recently_lost = 0;
        }
        self.upsent += 1;
    }

    /// Records a reply for sequence `seq` with measured `delay_ms` (spec
    /// §4.5 "On each reply"). `delay_ms` has already had scheduler drift
    /// subtracted by the caller. Returns the slot's previous value, which
    /// the DELAY alarm's clear path needs (spec §4.6) but which is
    /// otherwise discarded once overwritten.
    pub fn on_reply(&mut self, seq: u32, delay_ms: f64) -> f64 {
        let slot = (self.received as usize) % self.delay_buf.len();
        let old = self.delay_buf[slot];
        self.delay_buf[slot] = delay_ms;
        self.delay_sum += delay_ms - old;
        if self.delay_sum < 0.0 {
            self.delay_sum = 0.0;
        }
        self.received += 1;

        let w = self.loss_window_len() as u32;
        self.loss_window[(seq % w) as usize] = 1;
        old
    }

    /// `AVG_DELAY`: known iff at least one reply has been received.
    pub fn avg_delay(&self) -> Option<f64> {
        if self.received == 0 {
            return None;
        }
        let n = (self.received as usize).min(self.delay_buf.len()) as f64;
        Some(self.delay_sum / n)
    }

    /// `AVG_LOSS`: known only once the loss window has had a chance to
    /// fill (`last_sent > avg_loss_delay_samples + avg_loss_samples`).
    pub fn avg_loss(&self) -> Option<f64> {
        let threshold = (self.config.avg_loss_delay_samples + self.config.avg_loss_samples) as u32;
        if self.last_sent <= threshold {
            return None;
        }
        let samples = self.config.avg_loss_samples.max(1) as f64;
        Some(100.0 * (self.recently_lost as f64) / samples)
    }

    /// Replaces the most recent delay slot directly, used on a DELAY
    /// alarm clear (spec §4.6: "delay_sum is reset to the just-measured
    /// delay − old_slot ... so the average tracks the new regime").
    pub fn reset_delay_sum_to_last_measurement(&mut self, delay_ms: f64, old_slot: f64) {
        self.delay_sum = (delay_ms - old_slot).max(0.0);
    }
}
