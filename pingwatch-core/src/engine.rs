//! Scheduler / main loop (spec §4.8): the single cooperative event loop
//! that ties every other component together.
//!
//! `Engine` owns the registry, the notification queue, and the process-wide
//! scheduling state (status/time-series deadlines). It has no idea a
//! signal exists — the entrypoint (`pingwatch-daemon`) polls its own
//! signal flags between calls to [`Engine::tick`] and calls [`Engine::reload`]
//! / [`Engine::request_status_dump`] / [`Engine::drain_on_shutdown`]
//! in response, per the design note in spec §9 ("encapsulate
//! process-wide singletons behind an `Engine` value ... with signal
//! handlers writing into atomic flags read by that engine").

use crate::alarm::{self, Polarity, Transition};
use crate::clock::{duration_from_epoch_parts, earlier, Clock, Instant};
use crate::config::Config;
use crate::error::ConfigError;
use crate::notify::{self, Notification, NotificationQueue};
use crate::registry::Registry;
use crate::socket::{Family, IcmpSocket};
use crate::status;
use crate::target::{Target, TargetKey};
use crate::timeseries::TimeSeriesSink;
use crate::wire::{self, TracePayload, ICMP_HEADER_LEN, TRACE_PAYLOAD_LEN};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

/// Largest timeout `nix::poll::PollTimeout` can carry in one call
/// (`u16` milliseconds, ~65s). When the next real deadline is further out
/// than this, the loop simply wakes up early and recomputes — this is not
/// spin-waiting, just a coarser-than-ideal nap, and spec §4.8 only
/// requires that `poll` block rather than busy-loop.
const MAX_POLL_MS: u64 = 65_000;
const RECV_BUF_LEN: usize = 512;

pub struct Engine {
    clock: Clock,
    config: Config,
    ident: u16,
    registry: Registry,
    queue: NotificationQueue,
    started: Instant,
    last_drift: Duration,
    status_next: Instant,
    force_status: bool,
    timeseries_next: Instant,
    timeseries_sink: Option<Box<dyn TimeSeriesSink>>,
}

impl Engine {
    /// Builds an engine from an initial configuration. `ident` is the
    /// 16-bit process identity written into every echo request's
    /// identifier field (spec §4.2/§6), typically derived from the PID.
    ///
    /// Fails with [`ConfigError::NoTargets`] if reconciling against an
    /// empty registry yields no usable targets (spec §4.4: "If the
    /// reconcile yields an empty registry at startup, the process exits
    /// with status 1" — the daemon maps this error to that exit code).
    pub fn new(
        config: Config,
        ident: u16,
        timeseries_sink: Option<Box<dyn TimeSeriesSink>>,
    ) -> Result<Self, ConfigError> {
        let clock = Clock::new();
        let now = clock.now();
        let mut registry = Registry::new();
        let mut queue = NotificationQueue::new();
        let canceled = registry.reconcile(&config, &mut queue, now);
        debug_assert!(canceled.is_empty(), "startup reconcile should never cancel anything");

        if registry.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        for target in registry.targets_mut() {
            if !target.next_probe.is_set() {
                target.next_probe = now;
            }
        }

        let status_next = deadline_for(now, config.status_interval_ms);
        let timeseries_next = deadline_for(now, config.timeseries_interval_ms);

        Ok(Engine {
            clock,
            config,
            ident,
            registry,
            queue,
            started: now,
            last_drift: Duration::ZERO,
            status_next,
            force_status: false,
            timeseries_next,
            timeseries_sink,
        })
    }

    pub fn target_count(&self) -> usize {
        self.registry.targets().len()
    }

    /// Reconciles against a freshly loaded configuration (spec §4.4),
    /// called by the entrypoint when it observes `SIGHUP`. Dispatches the
    /// `Canceled` notifications for any removed targets immediately
    /// (spec §4.6: polarity `-1` bypasses the combine queue entirely).
    pub fn reload(&mut self, new_config: Config) {
        let now = self.clock.now();
        let canceled = self.registry.reconcile(&new_config, &mut self.queue, now);
        for n in &canceled {
            self.dispatch(n);
        }
        for target in self.registry.targets_mut() {
            if !target.next_probe.is_set() {
                target.next_probe = now;
            }
        }
        self.status_next = deadline_for(now, new_config.status_interval_ms);
        self.timeseries_next = deadline_for(now, new_config.timeseries_interval_ms);
        log::info!(
            "configuration reloaded: {} targets, {} alarm(s) canceled by the reload",
            self.registry.targets().len(),
            canceled.len(),
        );
        self.config = new_config;
    }

    /// Requests an out-of-band status dump on the next tick, for `SIGUSR1`.
    pub fn request_status_dump(&mut self) {
        self.force_status = true;
    }

    /// Drains the notification queue synchronously (spec §4.8 step 10,
    /// run once after the entrypoint observes `SIGTERM`/`SIGINT`).
    pub fn drain_on_shutdown(&mut self) {
        let pending = self.queue.drain();
        for n in &pending {
            self.dispatch(n);
        }
    }

    fn dispatch(&self, n: &Notification) {
        let local = chrono::Local::now();
        notify::dispatch(n, &self.config.timestamp_format, &local);
    }

    /// Submits a transition to the combine queue, unless `force_down`
    /// suppresses it first. Per spec §4.6, `force_down` only gates
    /// `Fire`/`Clear` emission — a `Canceled` (reload) transition is
    /// "never subject to combine-delay or force_down suppression".
    fn emit(&mut self, target_key: TargetKey, ctx: crate::notify::NotificationContext, t: Transition, now: Instant, force_down: bool) {
        if force_down && t.polarity != Polarity::Canceled {
            return;
        }
        let n = Notification::new(target_key, ctx, t, now);
        if let Some(n) = self.queue.submit(n) {
            self.dispatch(&n);
        }
    }

    /// Runs one iteration of the main loop (spec §4.8 steps 1-2, 4-9).
    /// Step 3 (draining `SIGHUP`) and the terminal check (step 10) are the
    /// entrypoint's responsibility, since this crate has no signal
    /// awareness; the entrypoint calls [`Engine::reload`] itself before or
    /// after a `tick`, and stops calling `tick` once it has observed a
    /// termination signal.
    pub fn tick(&mut self) -> std::io::Result<()> {
        let t_pre = self.clock.now();
        let drift_ms = self.last_drift.as_secs_f64() * 1000.0;

        // Step 2: DOWN firing + probe scheduling, per target.
        let started = self.started;
        let ident = self.ident;
        let mut fired = Vec::new();
        for target in self.registry.targets_mut() {
            if let Some(t) = alarm::check_down_fire(target, t_pre, started, drift_ms) {
                fired.push((target.key.clone(), target.notification_context(t_pre), t, target.config.force_down));
            }
            if target.socket.is_some() && target.next_probe.is_due(t_pre) {
                send_probe(target, &self.clock, t_pre, ident);
                let interval = Duration::from_millis(target.config.interval_ms.max(1));
                target.next_probe = target.next_probe.plus(interval);
            }
        }
        for (key, ctx, t, force_down) in fired {
            self.emit(key, ctx, t, t_pre, force_down);
        }

        // Step 4: due alarm repeats, which bypass the combine queue.
        let mut repeats = Vec::new();
        for target in self.registry.targets_mut() {
            for t in alarm::due_repeat(target, t_pre) {
                repeats.push(Notification::new(target.key.clone(), target.notification_context(t_pre), t, t_pre));
            }
        }
        for n in &repeats {
            self.dispatch(n);
        }

        // Step 5: status flush.
        if self.force_status || self.status_next.is_due(t_pre) {
            if let Some(path) = self.config.status_file.clone() {
                if let Err(e) = status::write_status_file(&path, self.registry.targets(), t_pre) {
                    log::warn!("failed to write status file {:?}: {}", path, e);
                }
            }
            self.force_status = false;
            if self.config.status_interval_ms > 0 {
                self.status_next = t_pre.plus(Duration::from_millis(self.config.status_interval_ms));
            }
        }

        // Step 6: time-series flush.
        if self.timeseries_next.is_due(t_pre) {
            if let Some(sink) = self.timeseries_sink.as_mut() {
                if let Err(e) = sink.flush(chrono::Utc::now(), self.registry.targets()) {
                    log::warn!("time-series flush failed: {}", e);
                }
            }
            if self.config.timeseries_interval_ms > 0 {
                self.timeseries_next = t_pre.plus(Duration::from_millis(self.config.timeseries_interval_ms));
            }
        }

        // Step 7: at most one delayed notification per tick.
        if let Some(n) = self.queue.pop_due(t_pre) {
            self.dispatch(&n);
        }

        // Step 8: compute the next wakeup across every future deadline.
        let mut next_wakeup = earlier(self.status_next, self.timeseries_next);
        next_wakeup = earlier(next_wakeup, self.queue.next_deadline());
        for target in self.registry.targets() {
            next_wakeup = earlier(next_wakeup, target.next_probe);
            for aal in &target.active_alarms {
                next_wakeup = earlier(next_wakeup, aal.next_repeat);
            }
        }

        let t_post = self.clock.now();
        self.last_drift = t_post.saturating_since(t_pre);
        let wait = if next_wakeup.is_set() {
            next_wakeup.remaining(t_post)
        } else {
            Duration::from_millis(MAX_POLL_MS)
        };

        // Step 9: poll and drain replies.
        self.poll_and_receive(wait)
    }

    fn poll_and_receive(&mut self, wait: Duration) -> std::io::Result<()> {
        let indices: Vec<usize> = self
            .registry
            .targets()
            .iter()
            .enumerate()
            .filter(|(_, t)| t.socket.is_some())
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            std::thread::sleep(wait.min(Duration::from_millis(MAX_POLL_MS)));
            return Ok(());
        }

        let fds: Vec<BorrowedFd> = indices
            .iter()
            .map(|&i| {
                let raw = self.registry.targets()[i].socket.as_ref().unwrap().as_raw_fd();
                unsafe { BorrowedFd::borrow_raw(raw) }
            })
            .collect();
        let mut poll_fds: Vec<PollFd> = fds.iter().map(|fd| PollFd::new(*fd, PollFlags::POLLIN)).collect();

        let timeout_ms = wait.as_millis().min(MAX_POLL_MS as u128) as u16;
        let timeout = PollTimeout::from(timeout_ms);

        match poll(&mut poll_fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
        }

        let t_recv = self.clock.now();
        let drift_ms = self.last_drift.as_secs_f64() * 1000.0;
        for (pfd, &idx) in poll_fds.iter().zip(indices.iter()) {
            let readable = pfd
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false);
            if !readable {
                continue;
            }
            self.drain_socket(idx, t_recv, drift_ms);
        }
        Ok(())
    }

    /// Loops on one target's socket until `EAGAIN`, an error, or a
    /// genuine reply is demultiplexed and applied (spec §4.8 step 9; the
    /// "goto-based retry" design note in spec §9).
    fn drain_socket(&mut self, idx: usize, now: Instant, drift_ms: f64) {
        let socket = match self.registry.targets_mut()[idx].socket.take() {
            Some(s) => s,
            None => return,
        };
        let family = socket.family();
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            match socket.try_recv(&mut buf) {
                Ok(Some((n, _src))) => {
                    self.handle_reply(family, &buf[..n], now, drift_ms);
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("recv error: {}", e);
                    break;
                }
            }
        }
        self.registry.targets_mut()[idx].socket = Some(socket);
    }

    fn handle_reply(&mut self, family: Family, buf: &[u8], now: Instant, drift_ms: f64) {
        let decoded = match family {
            Family::V4 => wire::decode_v4(buf, self.ident),
            Family::V6 => wire::decode_v6(buf, self.ident),
        };
        let (wire_seq, payload) = match decoded {
            Ok(v) => v,
            Err(e) => {
                log::debug!("dropping malformed/alien reply: {}", e);
                return;
            }
        };
        if !wire::wire_seq_matches(wire_seq, payload.seq) {
            log::debug!("dropping reply with wraparound-aliased sequence {}", wire_seq);
            return;
        }

        let sent = duration_from_epoch_parts(payload.timestamp_secs, payload.timestamp_micros);
        let elapsed = self.clock.since_epoch(now);
        let delay_ms = (elapsed.as_secs_f64() - sent.as_secs_f64()) * 1000.0 - drift_ms;

        let target = match self.registry.find_by_handle_mut(payload.target_handle) {
            Some(t) => t,
            None => {
                log::debug!("reply for unknown/stale target handle {}", payload.target_handle);
                return;
            }
        };
        let old_slot = target.on_reply(payload.seq, delay_ms);
        target.last_received_seq = payload.seq;
        target.last_received_time = now;
        let force_down = target.config.force_down;
        let key = target.key.clone();
        let transitions = alarm::check_reply_transitions(target, now, (delay_ms, old_slot));
        for t in transitions {
            let ctx = self.registry.find_by_handle_mut(payload.target_handle).unwrap().notification_context(now);
            self.emit(key.clone(), ctx, t, now, force_down);
        }
    }
}

fn deadline_for(now: Instant, interval_ms: u64) -> Instant {
    if interval_ms == 0 {
        Instant::unset()
    } else {
        now.plus(Duration::from_millis(interval_ms))
    }
}

fn send_probe(target: &mut Target, clock: &Clock, now: Instant, ident: u16) {
    let socket = match target.socket.as_ref() {
        Some(s) => s,
        None => return,
    };
    let seq = target.prepare_send();
    let (secs, micros) = clock.to_epoch_parts(now);
    let payload = TracePayload {
        timestamp_secs: secs,
        timestamp_micros: micros,
        target_handle: target.handle,
        seq,
    };
    let wire_seq = (seq % 65536) as u16;
    let mut buf = [0u8; ICMP_HEADER_LEN + TRACE_PAYLOAD_LEN];
    let encoded = match Family::of(target.addr) {
        Family::V4 => wire::encode_v4(&mut buf, ident, wire_seq, payload),
        Family::V6 => wire::encode_v6(&mut buf, ident, wire_seq, payload),
    };
    let n = match encoded {
        Ok(n) => n,
        Err(e) => {
            log::warn!("target {:?}: failed to encode probe: {}", target.config.name, e);
            return;
        }
    };
    match socket.send_to(&buf[..n], target.addr) {
        Ok(_) => {}
        Err(e) if IcmpSocket::is_fatal_send_error(&e) => {
            log::warn!(
                "target {:?}: socket send failed fatally ({}), rebuilding",
                target.config.name,
                e
            );
            match IcmpSocket::new(target.src_addr) {
                Ok(s) => target.socket = Some(s),
                Err(e) => {
                    log::warn!("target {:?}: socket rebuild failed: {}", target.config.name, e);
                    target.socket = None;
                }
            }
        }
        Err(e) => {
            log::debug!("target {:?}: send error: {}", target.config.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;

    fn empty_config() -> Config {
        Config {
            timestamp_format: "%b %d %H:%M:%S".into(),
            pid_file: "/tmp/pingwatch-test.pid".into(),
            status_file: None,
            status_interval_ms: 0,
            timeseries_file: None,
            timeseries_interval_ms: 0,
            targets: vec![],
        }
    }

    #[test]
    fn new_engine_rejects_empty_target_set() {
        let err = Engine::new(empty_config(), 1234, None).unwrap_err();
        assert!(matches!(err, ConfigError::NoTargets));
    }

    // Raw ICMP sockets need CAP_NET_RAW; `Registry::build_target` degrades a
    // failed socket creation to a polling-disabled target rather than an
    // error (see registry.rs), so this assertion holds whether or not the
    // test process actually has that capability.
    #[test]
    fn new_engine_accepts_numeric_target() {
        let mut cfg = empty_config();
        cfg.targets.push(TargetConfig {
            name: "127.0.0.1".into(),
            srcip: "".into(),
            description: "loopback".into(),
            interval_ms: 1000,
            avg_delay_samples: 20,
            avg_loss_delay_samples: 5,
            avg_loss_samples: 50,
            force_down: false,
            alarms: vec![],
        });
        let engine = Engine::new(cfg, 1234, None).expect("loopback target should resolve");
        assert_eq!(engine.target_count(), 1);
    }
}
