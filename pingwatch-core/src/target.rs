//! The monitored-host data model: identity, rolling statistics buffers,
//! and active alarm bindings (spec §3).
//!
//! The original links targets, alarm configs, and active alarms with
//! intrusive pointer lists; per spec §9's design note, this is modeled
//! here as ordered `Vec`s with explicit identity keys instead, which is
//! what makes the registry's reconcile pass (see `registry.rs`) tractable
//! in safe Rust.

use crate::clock::Instant;
use crate::config::{share_alarms, AlarmConfigRef, TargetConfigRef};
use crate::socket::IcmpSocket;
use crate::wire::TargetHandle;
use std::net::IpAddr;

/// Identifies a target: `(name, source_ip)`, equal iff both components
/// are equal (spec §3).
pub type TargetKey = (String, String);

pub fn target_key(name: &str, srcip: &str) -> TargetKey {
    (name.to_string(), srcip.to_string())
}

/// One alarm currently in the fired state for a target.
#[derive(Debug, Clone)]
pub struct ActiveAlarm {
    pub alarm: AlarmConfigRef,
    pub next_repeat: Instant,
    pub num_repeats: u32,
}

/// A monitored host: destination/source addresses, its socket, counters,
/// rolling statistics buffers, and active alarms.
pub struct Target {
    pub key: TargetKey,
    pub config: TargetConfigRef,
    pub handle: TargetHandle,
    pub addr: IpAddr,
    pub src_addr: IpAddr,
    pub socket: Option<IcmpSocket>,

    pub last_sent: u32,
    pub received: u32,
    pub last_received_seq: u32,
    pub last_received_time: Instant,
    pub recently_lost: i64,
    pub upsent: u32,

    /// `delay_buf[received mod avg_delay_samples]`, milliseconds.
    pub delay_buf: Vec<f64>,
    /// Invariant: equals `delay_buf.iter().sum()`, clamped to `>= 0`.
    pub delay_sum: f64,
    /// `loss_window[seq mod W]`; `0` = outstanding/lost, `1` = received.
    pub loss_window: Vec<u8>,

    /// Individually reference-counted handles onto `config.alarms`, one per
    /// configured alarm. Kept separate from `config` itself (rather than
    /// borrowed from it) so the registry's reconcile pass can re-point each
    /// one at the freshly loaded alarm config without needing every active
    /// alarm and delayed notification that references the old object
    /// (via `Rc::ptr_eq`) to be rewritten by hand (spec §4.4).
    pub alarm_refs: Vec<AlarmConfigRef>,

    pub active_alarms: Vec<ActiveAlarm>,
    pub next_probe: Instant,

    /// The sequence number the *next* probe will use. Distinct from
    /// `last_sent` (which, per spec §3, holds the zero-based sequence of
    /// the *last* packet actually sent, and is what the status line's
    /// `last_sent+1` column reports) — this counter just keeps the
    /// sequencing monotonic across sends, including across a DOWN clear
    /// (which resets `upsent`/`received` but not the sequence space).
    next_seq: u32,
}

impl Target {
    pub fn new(
        key: TargetKey,
        config: TargetConfigRef,
        handle: TargetHandle,
        addr: IpAddr,
        src_addr: IpAddr,
        socket: Option<IcmpSocket>,
    ) -> Self {
        let delay_len = config.avg_delay_samples.max(1);
        let window_len = config.loss_window_len().max(1);
        let alarm_refs = share_alarms(config.alarms.clone());
        Target {
            key,
            config,
            handle,
            addr,
            src_addr,
            socket,
            last_sent: 0,
            received: 0,
            last_received_seq: 0,
            last_received_time: Instant::unset(),
            recently_lost: 0,
            upsent: 0,
            delay_buf: vec![0.0; delay_len],
            delay_sum: 0.0,
            loss_window: vec![0; window_len],
            alarm_refs,
            active_alarms: Vec::new(),
            next_probe: Instant::unset(),
            next_seq: 0,
        }
    }

    /// Re-points `alarm_refs` (and any active alarm / delayed notification
    /// already bound to an old alarm object) at the newly loaded config's
    /// alarms, matched by `(name, type)`. Alarms absent from the new
    /// config are dropped from `alarm_refs`; their `active_alarms` entries
    /// are left for the caller to transition with polarity `-1` before
    /// calling this (spec §4.4).
    pub fn repoint_alarms(&mut self, new_config: TargetConfigRef) {
        let new_refs = share_alarms(new_config.alarms.clone());
        for aal in &mut self.active_alarms {
            if let Some(new_ref) = new_refs
                .iter()
                .find(|r| r.name == aal.alarm.name && r.kind.same_type(&aal.alarm.kind))
            {
                aal.alarm = new_ref.clone();
            }
        }
        self.alarm_refs = new_refs;
        self.config = new_config;
    }

    pub fn loss_window_len(&self) -> usize {
        self.loss_window.len()
    }

    pub fn is_alarm_active(&self, alarm: &AlarmConfigRef) -> bool {
        self.active_alarms
            .iter()
            .any(|aal| std::rc::Rc::ptr_eq(&aal.alarm, alarm))
    }

    pub fn active_alarm_names(&self) -> Vec<&str> {
        self.active_alarms
            .iter()
            .map(|aal| aal.alarm.name.as_str())
            .collect()
    }

    /// Resizes `delay_buf` in place for a config reload (spec §4.4): a
    /// grown buffer zero-fills its new tail; a shrunk buffer subtracts
    /// the truncated slots from `delay_sum` before dropping them. Each
    /// buffer resizes independently of `loss_window` (spec §9's
    /// correction of the original's overlapping-realloc bug).
    pub fn resize_delay_buf(&mut self, new_len: usize) {
        let new_len = new_len.max(1);
        if new_len < self.delay_buf.len() {
            for v in &self.delay_buf[new_len..] {
                self.delay_sum -= v;
            }
            if self.delay_sum < 0.0 {
                self.delay_sum = 0.0;
            }
        }
        self.delay_buf.resize(new_len, 0.0);
    }

    /// Resizes `loss_window` in place for a config reload: grown tail is
    /// zero-filled (outstanding), shrunk tail is simply truncated.
    pub fn resize_loss_window(&mut self, new_len: usize) {
        let new_len = new_len.max(1);
        self.loss_window.resize(new_len, 0);
    }

    /// Snapshot of the fields a notification needs, taken at the moment a
    /// transition occurs (spec §6's report line / macro fields).
    pub fn notification_context(&self, now: Instant) -> crate::notify::NotificationContext {
        crate::notify::NotificationContext {
            target_name: self.config.name.clone(),
            target_description: self.config.description.clone(),
            last_sent: self.last_sent,
            received: self.received,
            last_received_secs: if self.last_received_time.is_set() {
                Some(now.saturating_since(self.last_received_time).as_secs() as i64)
            } else {
                None
            },
            avg_delay_ms: self.avg_delay(),
            avg_loss_pct: self.avg_loss(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlarmKind, TargetConfig};
    use std::rc::Rc;

    fn cfg(avg_delay_samples: usize, avg_loss_delay_samples: usize, avg_loss_samples: usize) -> TargetConfigRef {
        Rc::new(TargetConfig {
            name: "t".into(),
            srcip: "".into(),
            description: "".into(),
            interval_ms: 1000,
            avg_delay_samples,
            avg_loss_delay_samples,
            avg_loss_samples,
            force_down: false,
            alarms: vec![],
        })
    }

    fn target() -> Target {
        Target::new(
            target_key("1.2.3.4", ""),
            cfg(3, 2, 4),
            1,
            "1.2.3.4".parse().unwrap(),
            "0.0.0.0".parse().unwrap(),
            None,
        )
    }

    #[test]
    fn new_target_has_zeroed_buffers() {
        let t = target();
        assert_eq!(t.delay_buf.len(), 3);
        assert_eq!(t.loss_window.len(), 6);
        assert_eq!(t.delay_sum, 0.0);
    }

    #[test]
    fn shrinking_delay_buf_subtracts_truncated_tail() {
        let mut t = target();
        t.delay_buf = vec![10.0, 20.0, 30.0];
        t.delay_sum = 60.0;
        t.resize_delay_buf(2);
        assert_eq!(t.delay_buf, vec![10.0, 20.0]);
        assert_eq!(t.delay_sum, 30.0);
    }

    #[test]
    fn growing_delay_buf_zero_fills_tail() {
        let mut t = target();
        t.delay_buf = vec![10.0, 20.0, 30.0];
        t.delay_sum = 60.0;
        t.resize_delay_buf(5);
        assert_eq!(t.delay_buf, vec![10.0, 20.0, 30.0, 0.0, 0.0]);
        assert_eq!(t.delay_sum, 60.0);
    }

    #[test]
    fn is_alarm_active_is_identity_based() {
        let mut t = target();
        let a = Rc::new(crate::config::AlarmConfig {
            name: "down".into(),
            kind: AlarmKind::Down { val_ms: 5000 },
            combine_interval_ms: 0,
            repeat_interval_ms: 0,
            repeat_max: 0,
            pipe_on: None,
            pipe_off: None,
            command_on: None,
            command_off: None,
            mailsubject: None,
            mailfrom: None,
        });
        let other = Rc::new((*a).clone());
        assert!(!t.is_alarm_active(&a));
        t.active_alarms.push(ActiveAlarm {
            alarm: a.clone(),
            next_repeat: Instant::unset(),
            num_repeats: 0,
        });
        assert!(t.is_alarm_active(&a));
        assert!(!t.is_alarm_active(&other));
    }
}
