//! Combine/debounce queue and macro substitution for alarm notifications
//! (spec §4.7, §6).
//!
//! A transition snapshot (the target's current counters and description)
//! is captured at the moment the alarm state machine produces it, so the
//! queue and the dispatcher never need to reach back into a `Target` that
//! may since have been torn down by a reconcile.

use crate::alarm::{Polarity, Transition};
use crate::clock::Instant;
use crate::config::AlarmConfigRef;
use crate::target::TargetKey;
use std::collections::VecDeque;
use std::io::Write;
use std::process::{Command, Stdio};

/// Snapshot of the fields a report line or macro substitution needs,
/// taken at transition time.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub target_name: String,
    pub target_description: String,
    pub last_sent: u32,
    pub received: u32,
    pub last_received_secs: Option<i64>,
    pub avg_delay_ms: Option<f64>,
    pub avg_loss_pct: Option<f64>,
}

/// One queued or immediately-dispatched notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub target_key: TargetKey,
    pub alarm: AlarmConfigRef,
    pub polarity: Polarity,
    pub enqueue_time: Instant,
    pub ctx: NotificationContext,
}

impl Notification {
    pub fn new(
        target_key: TargetKey,
        ctx: NotificationContext,
        transition: Transition,
        now: Instant,
    ) -> Self {
        Notification {
            target_key,
            alarm: transition.alarm,
            polarity: transition.polarity,
            enqueue_time: now,
            ctx,
        }
    }

    fn dedupe_key(&self) -> (&str, *const (), i8) {
        (
            self.target_key.0.as_str(),
            &*self.alarm as *const _ as *const (),
            self.polarity.as_i8(),
        )
    }
}

/// FIFO combine-delay queue. `Canceled` (reload) transitions and alarms
/// with `combine_interval_ms == 0` never enter the queue — the caller
/// dispatches them immediately (spec §4.6/§4.7).
#[derive(Debug, Default)]
pub struct NotificationQueue {
    queue: VecDeque<Notification>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        NotificationQueue {
            queue: VecDeque::new(),
        }
    }

    /// Submits a transition. Returns `Some(notification)` if it should be
    /// dispatched immediately; otherwise it was enqueued (or silently
    /// deduplicated against an already-queued entry for the same
    /// `(target, alarm, polarity)`) and `None` is returned.
    pub fn submit(&mut self, n: Notification) -> Option<Notification> {
        if n.polarity == Polarity::Canceled || n.alarm.combine_interval_ms == 0 {
            return Some(n);
        }
        if self.queue.iter().any(|q| q.dedupe_key() == n.dedupe_key()) {
            return None;
        }
        self.queue.push_back(n);
        None
    }

    /// The deadline at which the head of the queue becomes dispatchable,
    /// `Instant::unset()` if the queue is empty.
    pub fn next_deadline(&self) -> Instant {
        match self.queue.front() {
            Some(head) => head
                .enqueue_time
                .plus(std::time::Duration::from_millis(head.alarm.combine_interval_ms)),
            None => Instant::unset(),
        }
    }

    /// Pops and returns the head if it is due, at most once per call (spec
    /// §4.8 step 7: "at most once per main-loop tick").
    pub fn pop_due(&mut self, now: Instant) -> Option<Notification> {
        if self.next_deadline().is_due(now) {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Drops every queued notification for `key` (spec §4.4: reload
    /// removal drops pending delayed notifications for the removed
    /// target).
    pub fn drop_for_target(&mut self, key: &TargetKey) {
        self.queue.retain(|n| &n.target_key != key);
    }

    /// Re-points queued notifications bound to `old` onto `new` (spec
    /// §4.4: "delayed notifications are similarly re-pointed").
    pub fn repoint(&mut self, old: &AlarmConfigRef, new: &AlarmConfigRef) {
        for n in &mut self.queue {
            if std::rc::Rc::ptr_eq(&n.alarm, old) {
                n.alarm = new.clone();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains every queued notification in FIFO order, for synchronous
    /// shutdown (spec §4.8 step 10).
    pub fn drain(&mut self) -> Vec<Notification> {
        self.queue.drain(..).collect()
    }
}

/// `%r` reason text (spec §6).
fn reason_text(polarity: Polarity) -> &'static str {
    match polarity {
        Polarity::Fire => "ALARM",
        Polarity::Clear => "alarm canceled",
        Polarity::Canceled => "alarm canceled (config reload)",
    }
}

fn fmt_loss(pct: Option<f64>) -> String {
    match pct {
        Some(p) => format!("{:.1}%", p),
        None => "n/a".to_string(),
    }
}

fn fmt_delay(ms: Option<f64>) -> String {
    match ms {
        Some(d) => format!("{:.3}ms", d),
        None => "n/a".to_string(),
    }
}

/// Expands `%X` tokens in `template` against a notification (spec §6).
/// Per spec.md §9's documented ambiguity resolution: a template with no
/// `%` tokens is returned unchanged; only an empty (or absent) template
/// yields the empty string.
pub fn subst_macros(
    template: Option<&str>,
    notification: &Notification,
    timestamp_format: &str,
    now_local: &chrono::DateTime<chrono::Local>,
) -> String {
    let template = match template {
        Some(t) if !t.is_empty() => t,
        _ => return String::new(),
    };
    if !template.contains('%') {
        return template.to_string();
    }

    let ctx = &notification.ctx;
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push_str(&ctx.target_name),
            Some('T') => out.push_str(&ctx.target_description),
            Some('a') => out.push_str(&notification.alarm.name),
            Some('A') => out.push_str(notification.alarm.kind.macro_name()),
            Some('r') => out.push_str(reason_text(notification.polarity)),
            Some('p') => out.push_str(&ctx.last_sent.to_string()),
            Some('P') => out.push_str(&ctx.received.to_string()),
            Some('l') => out.push_str(&fmt_loss(ctx.avg_loss_pct)),
            Some('d') => out.push_str(&fmt_delay(ctx.avg_delay_ms)),
            Some('s') => out.push_str(&now_local.format(timestamp_format).to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// The `|`-delimited report line piped to `pipe_on`/`pipe_off` (spec §6).
/// `last_sent+1` and `received` are always present; `avg_delay`/`avg_loss`
/// are omitted entirely (not even an empty field) when unknown.
pub fn report_line(ctx: &NotificationContext) -> String {
    let mut fields = vec![
        ctx.target_name.clone(),
        ctx.target_description.clone(),
        (ctx.last_sent + 1).to_string(),
        ctx.received.to_string(),
        ctx.last_received_secs.map(|s| s.to_string()).unwrap_or_default(),
    ];
    if let Some(delay) = ctx.avg_delay_ms {
        fields.push(format!("{:.3}", delay));
    }
    if let Some(loss) = ctx.avg_loss_pct {
        fields.push(format!("{:.1}", loss));
    }
    fields.join(" | ")
}

/// Runs `pipe_on`/`pipe_off` and/or `command_on`/`command_off` for a
/// dispatched notification. Exit status and spawn failures are logged and
/// never retried (spec §4.7, §7).
pub fn dispatch(
    notification: &Notification,
    timestamp_format: &str,
    now_local: &chrono::DateTime<chrono::Local>,
) {
    let alarm = &notification.alarm;
    let (pipe, command) = match notification.polarity {
        Polarity::Fire => (&alarm.pipe_on, &alarm.command_on),
        Polarity::Clear | Polarity::Canceled => (&alarm.pipe_off, &alarm.command_off),
    };

    if let Some(pipe_cmd) = pipe {
        let expanded = subst_macros(Some(pipe_cmd), notification, timestamp_format, now_local);
        run_pipe(&expanded, &report_line(&notification.ctx));
    }
    if let Some(command_cmd) = command {
        let expanded = subst_macros(Some(command_cmd), notification, timestamp_format, now_local);
        run_command(&expanded);
    }
}

fn run_pipe(shell_command: &str, report_line: &str) {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(shell_command)
        .stdin(Stdio::piped())
        .spawn();
    match child {
        Ok(mut child) => {
            if let Some(stdin) = child.stdin.as_mut() {
                if let Err(e) = writeln!(stdin, "{}", report_line) {
                    log::warn!("failed writing to pipe_on/off command {:?}: {}", shell_command, e);
                }
            }
            match child.wait() {
                Ok(status) if !status.success() => {
                    log::warn!("pipe command {:?} exited with {}", shell_command, status);
                }
                Err(e) => log::warn!("failed waiting on pipe command {:?}: {}", shell_command, e),
                _ => {}
            }
        }
        Err(e) => log::warn!("failed to spawn pipe command {:?}: {}", shell_command, e),
    }
}

fn run_command(shell_command: &str) {
    match Command::new("/bin/sh").arg("-c").arg(shell_command).status() {
        Ok(status) if !status.success() => {
            log::warn!("command {:?} exited with {}", shell_command, status);
        }
        Err(e) => log::warn!("failed to spawn command {:?}: {}", shell_command, e),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlarmConfig, AlarmKind};
    use crate::target::target_key;
    use std::rc::Rc;
    use std::time::Duration;

    fn alarm(combine_ms: u64) -> AlarmConfigRef {
        Rc::new(AlarmConfig {
            name: "loss".into(),
            kind: AlarmKind::Loss { high: 60.0, low: 40.0 },
            combine_interval_ms: combine_ms,
            repeat_interval_ms: 0,
            repeat_max: 0,
            pipe_on: None,
            pipe_off: None,
            command_on: Some("true".into()),
            command_off: None,
            mailsubject: None,
            mailfrom: None,
        })
    }

    fn ctx() -> NotificationContext {
        NotificationContext {
            target_name: "1.2.3.4".into(),
            target_description: "core router".into(),
            last_sent: 9,
            received: 6,
            last_received_secs: Some(3),
            avg_delay_ms: Some(12.5),
            avg_loss_pct: Some(75.0),
        }
    }

    fn notification(alarm: AlarmConfigRef, polarity: Polarity, now: Instant) -> Notification {
        Notification {
            target_key: target_key("1.2.3.4", ""),
            alarm,
            polarity,
            enqueue_time: now,
            ctx: ctx(),
        }
    }

    /// Scenario 4 from spec §8: combine debounce.
    #[test]
    fn duplicate_fire_within_combine_window_is_deduplicated() {
        let clock = crate::clock::Clock::new();
        let a = alarm(2000);
        let mut q = NotificationQueue::new();
        let t0 = clock.at(Duration::from_millis(0));
        let t1 = clock.at(Duration::from_millis(500));

        assert!(q.submit(notification(a.clone(), Polarity::Fire, t0)).is_none());
        assert!(q.submit(notification(a.clone(), Polarity::Fire, t1)).is_none());
        assert_eq!(q.queue.len(), 1);

        let before = clock.at(Duration::from_millis(1999));
        let after = clock.at(Duration::from_millis(2001));
        assert!(q.pop_due(before).is_none());
        assert!(q.pop_due(after).is_some());
    }

    #[test]
    fn zero_combine_interval_dispatches_immediately() {
        let clock = crate::clock::Clock::new();
        let a = alarm(0);
        let mut q = NotificationQueue::new();
        let now = clock.at(Duration::from_millis(0));
        assert!(q.submit(notification(a, Polarity::Fire, now)).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn canceled_bypasses_combine_delay() {
        let clock = crate::clock::Clock::new();
        let a = alarm(5000);
        let mut q = NotificationQueue::new();
        let now = clock.at(Duration::from_millis(0));
        assert!(q.submit(notification(a, Polarity::Canceled, now)).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn drop_for_target_removes_matching_entries() {
        let clock = crate::clock::Clock::new();
        let a = alarm(2000);
        let mut q = NotificationQueue::new();
        let now = clock.at(Duration::from_millis(0));
        q.submit(notification(a, Polarity::Fire, now));
        assert_eq!(q.queue.len(), 1);
        q.drop_for_target(&target_key("1.2.3.4", ""));
        assert!(q.is_empty());
    }

    #[test]
    fn subst_macros_returns_input_unchanged_without_percent_tokens() {
        let clock = crate::clock::Clock::new();
        let now = clock.at(Duration::from_millis(0));
        let n = notification(alarm(0), Polarity::Fire, now);
        let local = chrono::Local::now();
        assert_eq!(subst_macros(Some("plain text"), &n, "%s", &local), "plain text");
    }

    #[test]
    fn subst_macros_empty_or_absent_input_is_empty() {
        let clock = crate::clock::Clock::new();
        let now = clock.at(Duration::from_millis(0));
        let n = notification(alarm(0), Polarity::Fire, now);
        let local = chrono::Local::now();
        assert_eq!(subst_macros(Some(""), &n, "%s", &local), "");
        assert_eq!(subst_macros(None, &n, "%s", &local), "");
    }

    #[test]
    fn subst_macros_expands_known_tokens() {
        let clock = crate::clock::Clock::new();
        let now = clock.at(Duration::from_millis(0));
        let n = notification(alarm(0), Polarity::Fire, now);
        let local = chrono::Local::now();
        let out = subst_macros(Some("%t %A %r %l %d"), &n, "%s", &local);
        assert_eq!(out, "1.2.3.4 loss ALARM 75.0% 12.500ms");
    }

    #[test]
    fn report_line_omits_unknown_trailing_fields() {
        let mut c = ctx();
        c.avg_delay_ms = None;
        c.avg_loss_pct = None;
        let line = report_line(&c);
        assert_eq!(line, "1.2.3.4 | core router | 10 | 6 | 3");
    }
}
