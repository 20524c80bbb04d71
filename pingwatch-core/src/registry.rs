//! Holds the live set of targets and reconciles it against a freshly
//! loaded configuration (spec §4.4).
//!
//! Targets are kept in an ordered `Vec` rather than the original's
//! intrusive linked list (spec §9), with a side index for key lookups —
//! the same "ordered sequence + identity key" shape `zzping-daemon`'s
//! config holds its target list in, just generalized to support removal.

use crate::alarm::{cancel_all, Polarity};
use crate::clock::Instant;
use crate::config::{Config, TargetConfig, TargetConfigRef};
use crate::notify::{Notification, NotificationQueue};
use crate::socket::{parse_numeric_address, Family, IcmpSocket};
use crate::target::{target_key, Target, TargetKey};
use crate::wire::TargetHandle;
use std::collections::HashMap;
use std::rc::Rc;

pub struct Registry {
    targets: Vec<Target>,
    index: HashMap<TargetKey, usize>,
    next_handle: TargetHandle,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            targets: Vec::new(),
            index: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn targets_mut(&mut self) -> &mut [Target] {
        &mut self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get_mut(&mut self, key: &TargetKey) -> Option<&mut Target> {
        self.index.get(key).map(|&i| &mut self.targets[i])
    }

    pub fn find_by_handle_mut(&mut self, handle: TargetHandle) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.handle == handle)
    }

    /// Reconciles the registry against `new_config` (spec §4.4). Returns
    /// the immediate-dispatch notifications for targets removed by this
    /// reload (polarity `Canceled`, one per previously active alarm).
    /// Notifications for survivors whose bound alarm objects moved are
    /// re-pointed in place inside `queue`.
    pub fn reconcile(&mut self, new_config: &Config, queue: &mut NotificationQueue, now: Instant) -> Vec<Notification> {
        let mut new_by_key: HashMap<TargetKey, &TargetConfig> = HashMap::new();
        for tc in &new_config.targets {
            new_by_key.insert(target_key(&tc.name, &tc.srcip), tc);
        }

        let mut cancel_notifications = Vec::new();
        let mut kept = Vec::new();
        for mut target in self.targets.drain(..) {
            match new_by_key.remove(&target.key) {
                Some(tc) => {
                    let old_refs = target.alarm_refs.clone();
                    let new_config_ref: TargetConfigRef = Rc::new(tc.clone());
                    target.repoint_alarms(new_config_ref.clone());
                    for old in &old_refs {
                        if let Some(new) = target
                            .alarm_refs
                            .iter()
                            .find(|r| r.name == old.name && r.kind.same_type(&old.kind))
                        {
                            queue.repoint(old, new);
                        }
                    }
                    target.resize_delay_buf(new_config_ref.avg_delay_samples);
                    target.resize_loss_window(new_config_ref.loss_window_len());
                    kept.push(target);
                }
                None => {
                    for t in cancel_all(&target) {
                        cancel_notifications.push(Notification::new(
                            target.key.clone(),
                            target.notification_context(now),
                            t,
                            now,
                        ));
                    }
                    queue.drop_for_target(&target.key);
                }
            }
        }

        for tc in &new_config.targets {
            let key = target_key(&tc.name, &tc.srcip);
            if !new_by_key.contains_key(&key) {
                // was matched to a kept target above
                continue;
            }
            new_by_key.remove(&key);
            if let Some(target) = self.build_target(tc) {
                kept.push(target);
            }
        }

        self.targets = kept;
        self.rebuild_index();
        for n in &cancel_notifications {
            debug_assert_eq!(n.polarity, Polarity::Canceled);
        }
        cancel_notifications
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, t) in self.targets.iter().enumerate() {
            self.index.insert(t.key.clone(), i);
        }
    }

    fn build_target(&mut self, tc: &TargetConfig) -> Option<Target> {
        let addr = match parse_numeric_address(&tc.name) {
            Some(a) => a,
            None => {
                log::warn!("target {:?}: not a numeric address, skipping", tc.name);
                return None;
            }
        };
        let src = if tc.srcip.is_empty() {
            match Family::of(addr) {
                Family::V4 => "0.0.0.0".parse().unwrap(),
                Family::V6 => "::".parse().unwrap(),
            }
        } else {
            match parse_numeric_address(&tc.srcip) {
                Some(s) => s,
                None => {
                    log::warn!("target {:?}: srcip {:?} is not numeric, skipping", tc.name, tc.srcip);
                    return None;
                }
            }
        };

        let socket = match IcmpSocket::new(src) {
            Ok(s) => Some(s),
            Err(e) => {
                log::warn!("target {:?}: socket creation failed, polling disabled: {}", tc.name, e);
                None
            }
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        let key = target_key(&tc.name, &tc.srcip);
        Some(Target::new(key, Rc::new(tc.clone()), handle, addr, src, socket))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::AlarmConfig;
    use crate::config::AlarmKind;

    fn target_config(name: &str, loss_alarm_name: &str) -> TargetConfig {
        TargetConfig {
            name: name.into(),
            srcip: "".into(),
            description: "desc".into(),
            interval_ms: 1000,
            avg_delay_samples: 20,
            avg_loss_delay_samples: 5,
            avg_loss_samples: 50,
            force_down: false,
            alarms: vec![AlarmConfig {
                name: loss_alarm_name.into(),
                kind: AlarmKind::Loss { high: 60.0, low: 40.0 },
                combine_interval_ms: 0,
                repeat_interval_ms: 0,
                repeat_max: 0,
                pipe_on: None,
                pipe_off: None,
                command_on: None,
                command_off: None,
                mailsubject: None,
                mailfrom: None,
            }],
        }
    }

    /// Scenario 5 from spec §8: reload preserves state for an unchanged
    /// target and re-points its active alarm to the new config object.
    #[test]
    fn reload_preserves_state_for_unchanged_target() {
        let clock = Clock::new();
        let now = clock.at(std::time::Duration::from_secs(0));
        let mut reg = Registry::new();
        let mut queue = NotificationQueue::new();

        let cfg = Config {
            timestamp_format: "%b %d %H:%M:%S".into(),
            pid_file: "/tmp/x.pid".into(),
            status_file: None,
            status_interval_ms: 0,
            timeseries_file: None,
            timeseries_interval_ms: 0,
            targets: vec![target_config("1.2.3.4", "loss")],
        };
        reg.reconcile(&cfg, &mut queue, now);
        assert_eq!(reg.targets().len(), 1);

        {
            let t = reg.get_mut(&target_key("1.2.3.4", "")).unwrap();
            t.received = 100;
            let old_alarm = t.alarm_refs[0].clone();
            t.active_alarms.push(crate::target::ActiveAlarm {
                alarm: old_alarm,
                next_repeat: Instant::unset(),
                num_repeats: 0,
            });
        }

        let cfg2 = Config {
            targets: vec![target_config("1.2.3.4", "loss")],
            ..cfg
        };
        let canceled = reg.reconcile(&cfg2, &mut queue, now);
        assert!(canceled.is_empty());

        let t = reg.get_mut(&target_key("1.2.3.4", "")).unwrap();
        assert_eq!(t.received, 100);
        assert_eq!(t.active_alarm_names(), vec!["loss"]);
        assert!(t.is_alarm_active(&t.alarm_refs[0].clone()));
    }

    /// Scenario 6 from spec §8: reload removes a target, emitting exactly
    /// one `Canceled` notification per previously active alarm and
    /// dropping its queued notifications.
    #[test]
    fn reload_removes_target_and_cancels_its_alarms() {
        let clock = Clock::new();
        let now = clock.at(std::time::Duration::from_secs(0));
        let mut reg = Registry::new();
        let mut queue = NotificationQueue::new();

        let cfg = Config {
            timestamp_format: "%b %d %H:%M:%S".into(),
            pid_file: "/tmp/x.pid".into(),
            status_file: None,
            status_interval_ms: 0,
            timeseries_file: None,
            timeseries_interval_ms: 0,
            targets: vec![target_config("1.2.3.4", "loss")],
        };
        reg.reconcile(&cfg, &mut queue, now);
        {
            let t = reg.get_mut(&target_key("1.2.3.4", "")).unwrap();
            let alarm = t.alarm_refs[0].clone();
            t.active_alarms.push(crate::target::ActiveAlarm {
                alarm,
                next_repeat: Instant::unset(),
                num_repeats: 0,
            });
        }

        let empty_cfg = Config {
            targets: vec![],
            ..cfg
        };
        let canceled = reg.reconcile(&empty_cfg, &mut queue, now);
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].polarity, Polarity::Canceled);
        assert!(reg.is_empty());
    }

    #[test]
    fn non_numeric_target_name_is_skipped() {
        let clock = Clock::new();
        let now = clock.at(std::time::Duration::from_secs(0));
        let mut reg = Registry::new();
        let mut queue = NotificationQueue::new();
        let cfg = Config {
            timestamp_format: "%b %d %H:%M:%S".into(),
            pid_file: "/tmp/x.pid".into(),
            status_file: None,
            status_interval_ms: 0,
            timeseries_file: None,
            timeseries_interval_ms: 0,
            targets: vec![target_config("not-an-ip.example", "loss")],
        };
        reg.reconcile(&cfg, &mut queue, now);
        assert!(reg.is_empty());
    }
}
