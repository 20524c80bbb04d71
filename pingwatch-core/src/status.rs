//! Status file writer (spec §4.9): one `|`-delimited line per target.

use crate::clock::Instant;
use crate::target::Target;
use std::fs;
use std::io::Write;

fn fmt_optional<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "n/a".to_string())
}

fn status_tag(target: &Target) -> String {
    if target.config.force_down {
        return "force_down".to_string();
    }
    let names = target.active_alarm_names();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(",")
    }
}

/// One status-file line for `target` (spec §4.9's column order).
pub fn format_line(target: &Target, now: Instant) -> String {
    let last_received_secs = if target.last_received_time.is_set() {
        Some(now.saturating_since(target.last_received_time).as_secs())
    } else {
        None
    };
    format!(
        "{} | {} | {} | {} | {} | {} | {:.3} | {} | {}",
        target.config.name,
        target.config.srcip,
        target.config.description,
        target.last_sent + 1,
        target.received,
        fmt_optional(last_received_secs),
        target.avg_delay().unwrap_or(0.0),
        target
            .avg_loss()
            .map(|p| format!("{:.1}", p))
            .unwrap_or_else(|| "n/a".to_string()),
        status_tag(target),
    )
}

/// Rewrites `path` with one line per target (spec §4.9: "truncate-and-write
/// is acceptable; readers are advisory").
pub fn write_status_file(path: &str, targets: &[Target], now: Instant) -> std::io::Result<()> {
    let mut out = String::new();
    for target in targets {
        out.push_str(&format_line(target, now));
        out.push('\n');
    }
    let mut file = fs::File::create(path)?;
    file.write_all(out.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::TargetConfig;
    use crate::target::target_key;
    use std::rc::Rc;

    fn target() -> Target {
        let cfg = Rc::new(TargetConfig {
            name: "192.0.2.1".into(),
            srcip: "".into(),
            description: "core".into(),
            interval_ms: 1000,
            avg_delay_samples: 20,
            avg_loss_delay_samples: 5,
            avg_loss_samples: 50,
            force_down: false,
            alarms: vec![],
        });
        Target::new(
            target_key("192.0.2.1", ""),
            cfg,
            1,
            "192.0.2.1".parse().unwrap(),
            "0.0.0.0".parse().unwrap(),
            None,
        )
    }

    #[test]
    fn unknown_fields_render_as_n_a() {
        let t = target();
        let clock = Clock::new();
        let now = clock.at(std::time::Duration::from_secs(0));
        let line = format_line(&t, now);
        assert!(line.contains("n/a"));
        assert!(line.ends_with("none"));
    }

    #[test]
    fn force_down_overrides_alarm_tag() {
        let mut t = target();
        t.config = Rc::new(TargetConfig {
            force_down: true,
            ..(*t.config).clone()
        });
        let clock = Clock::new();
        let now = clock.at(std::time::Duration::from_secs(0));
        assert!(format_line(&t, now).ends_with("force_down"));
    }

    #[test]
    fn write_status_file_creates_readable_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let t = target();
        let clock = Clock::new();
        let now = clock.at(std::time::Duration::from_secs(0));
        write_status_file(&path, std::slice::from_ref(&t), now).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
