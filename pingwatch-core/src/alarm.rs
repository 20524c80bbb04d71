//! Per-(target, alarm) state machine: fire/clear transitions with
//! hysteresis (spec §4.6).
//!
//! Grounded the same way `stats.rs` is: the transition logic is a set of
//! free functions operating on `Target`, called by the scheduler after a
//! reply is processed or on every tick (for DOWN). They return the
//! transitions that occurred; the caller (the engine) is responsible for
//! handing those to the notification queue — this module never dispatches
//! anything itself, matching the clean separation `zzping-lib`'s framedata
//! encoder keeps from its I/O callers.

use crate::clock::Instant;
use crate::config::{AlarmConfigRef, AlarmKind};
use crate::target::{ActiveAlarm, Target};

/// Direction of an alarm transition (spec §3/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// `+1`: alarm just became active.
    Fire,
    /// `0`: alarm just cleared on its own condition.
    Clear,
    /// `-1`: alarm was torn down because its target left the config on
    /// reload. Never subject to combine-delay or `force_down`.
    Canceled,
}

impl Polarity {
    pub fn as_i8(self) -> i8 {
        match self {
            Polarity::Fire => 1,
            Polarity::Clear => 0,
            Polarity::Canceled => -1,
        }
    }
}

/// One fire/clear/cancel event for a single `(target, alarm)` pair.
#[derive(Debug, Clone)]
pub struct Transition {
    pub alarm: AlarmConfigRef,
    pub polarity: Polarity,
}

/// Evaluates DOWN firing for `target` (spec §4.6, checked "on every
/// scheduler tick"). `since` is `last_received_time`, or `started` if no
/// reply has ever arrived. `drift_ms` is the scheduler drift to subtract
/// before comparing against the threshold.
pub fn check_down_fire(target: &mut Target, now: Instant, started: Instant, drift_ms: f64) -> Option<Transition> {
    let down = find_down_alarm(target)?;
    if target.is_alarm_active(&down) {
        return None;
    }
    let since = if target.last_received_time.is_set() {
        target.last_received_time
    } else {
        started
    };
    let elapsed_ms = now.saturating_since(since).as_secs_f64() * 1000.0 - drift_ms;
    let AlarmKind::Down { val_ms } = down.kind else {
        return None;
    };
    if elapsed_ms > val_ms as f64 {
        target.active_alarms.push(ActiveAlarm {
            alarm: down.clone(),
            next_repeat: repeat_deadline(&down, now),
            num_repeats: 0,
        });
        Some(Transition {
            alarm: down,
            polarity: Polarity::Fire,
        })
    } else {
        None
    }
}

/// Evaluates all alarms that can transition on a reply: DOWN clears
/// unconditionally (any successful reply), LOSS/DELAY fire or clear
/// against their hysteresis thresholds (spec §4.6).
///
/// `just_measured` is `(delay_ms, slot_before_overwrite)` for the reply
/// that was just folded into the statistics by
/// [`crate::target::Target::on_reply`] — needed only for a DELAY clear's
/// `delay_sum` reset, and otherwise unused.
pub fn check_reply_transitions(
    target: &mut Target,
    now: Instant,
    just_measured: (f64, f64),
) -> Vec<Transition> {
    let mut out = Vec::new();

    if let Some(down) = find_down_alarm(target) {
        if target.is_alarm_active(&down) {
            out.push(clear_down(target, &down));
        }
    }

    let avg_loss = target.avg_loss();
    let avg_delay = target.avg_delay();

    for alarm in target.alarm_refs.clone() {
        match alarm.kind {
            AlarmKind::Loss { high, low } => {
                if let Some(t) =
                    evaluate_hysteresis(target, &alarm, avg_loss, high, low, just_measured, now)
                {
                    out.push(t);
                }
            }
            AlarmKind::Delay { high, low } => {
                if let Some(t) =
                    evaluate_hysteresis(target, &alarm, avg_delay, high, low, just_measured, now)
                {
                    out.push(t);
                }
            }
            AlarmKind::Down { .. } => {}
        }
    }
    out
}

/// Tears down every active alarm on `target` with polarity `Canceled`,
/// for the registry's reconcile path when a target leaves the config
/// (spec §4.4/§4.6). Does not touch statistics; the target itself is
/// being discarded by the caller right after.
pub fn cancel_all(target: &Target) -> Vec<Transition> {
    target
        .active_alarms
        .iter()
        .map(|aal| Transition {
            alarm: aal.alarm.clone(),
            polarity: Polarity::Canceled,
        })
        .collect()
}

fn find_down_alarm(target: &Target) -> Option<AlarmConfigRef> {
    target
        .alarm_refs
        .iter()
        .find(|a| matches!(a.kind, AlarmKind::Down { .. }))
        .cloned()
}

/// DOWN's special clear-path reset (spec §4.6): a just-revived target
/// should not instantly trip LOSS, so its loss bookkeeping is zeroed
/// along with the usual counters.
fn clear_down(target: &mut Target, down: &AlarmConfigRef) -> Transition {
    target.active_alarms.retain(|aal| !std::rc::Rc::ptr_eq(&aal.alarm, down));
    target.received = 1;
    target.recently_lost = 0;
    target.upsent = 0;
    Transition {
        alarm: down.clone(),
        polarity: Polarity::Clear,
    }
}

#[allow(clippy::too_many_arguments)]
fn evaluate_hysteresis(
    target: &mut Target,
    alarm: &AlarmConfigRef,
    value: Option<f64>,
    high: f64,
    low: f64,
    just_measured: (f64, f64),
    now: Instant,
) -> Option<Transition> {
    let active = target.is_alarm_active(alarm);
    let value = value?;

    if !active && value > high {
        target.active_alarms.push(ActiveAlarm {
            alarm: alarm.clone(),
            next_repeat: repeat_deadline(alarm, now),
            num_repeats: 0,
        });
        return Some(Transition {
            alarm: alarm.clone(),
            polarity: Polarity::Fire,
        });
    }

    if active && value < low {
        target.active_alarms.retain(|aal| !std::rc::Rc::ptr_eq(&aal.alarm, alarm));
        if matches!(alarm.kind, AlarmKind::Delay { .. }) {
            let (delay_ms, old_slot) = just_measured;
            target.reset_delay_sum_to_last_measurement(delay_ms, old_slot);
        }
        return Some(Transition {
            alarm: alarm.clone(),
            polarity: Polarity::Clear,
        });
    }

    None
}

fn repeat_deadline(alarm: &AlarmConfigRef, now: Instant) -> Instant {
    if alarm.repeat_interval_ms == 0 {
        Instant::unset()
    } else {
        now.plus(std::time::Duration::from_millis(alarm.repeat_interval_ms))
    }
}

/// Called by the scheduler for each active alarm whose `next_repeat` is
/// due; advances the deadline and returns a `+1` repeat, or `None` once
/// `repeat_max` has been reached (spec §4.7).
pub fn due_repeat(target: &mut Target, now: Instant) -> Vec<Transition> {
    let mut out = Vec::new();
    for aal in &mut target.active_alarms {
        if aal.alarm.repeat_interval_ms == 0 || !aal.next_repeat.is_due(now) {
            continue;
        }
        if aal.alarm.repeat_max != 0 && aal.num_repeats >= aal.alarm.repeat_max {
            aal.next_repeat = Instant::unset();
            continue;
        }
        aal.num_repeats += 1;
        aal.next_repeat = now.plus(std::time::Duration::from_millis(aal.alarm.repeat_interval_ms));
        out.push(Transition {
            alarm: aal.alarm.clone(),
            polarity: Polarity::Fire,
        });
    }
    out
}
