//! `-g <dir>` / `-l <location>` CLI contract (spec §6, SPEC_FULL §4.12):
//! out of scope as a real RRD/graphing toolchain, but the flag pair is
//! honored rather than silently ignored — it writes a small shell script
//! into `<dir>` that echoes the configured HTTP location and the
//! currently configured target list.

use anyhow::{Context, Result};
use pingwatch_core::Config;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

pub fn generate(dir: &Path, location: &str, config: &Config) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
    let script_path = dir.join("pingwatch.cgi");
    let mut f = fs::File::create(&script_path).with_context(|| format!("creating {:?}", script_path))?;

    writeln!(f, "#!/bin/sh")?;
    writeln!(f, "# generated by pingwatch-daemon -g, location={}", location)?;
    writeln!(f, "echo \"Content-Type: text/plain\"")?;
    writeln!(f)?;
    writeln!(f, "echo \"location: {}\"", location)?;
    for target in &config.targets {
        writeln!(f, "echo \"target: {} ({})\"", target.name, target.description)?;
    }
    f.flush()?;

    let mut perms = fs::metadata(&script_path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pingwatch_core::config::TargetConfig;

    fn config_with_one_target() -> Config {
        Config {
            timestamp_format: "%b %d %H:%M:%S".into(),
            pid_file: "/tmp/pingwatch-cgi-test.pid".into(),
            status_file: None,
            status_interval_ms: 0,
            timeseries_file: None,
            timeseries_interval_ms: 0,
            targets: vec![TargetConfig {
                name: "127.0.0.1".into(),
                srcip: "".into(),
                description: "loopback".into(),
                interval_ms: 1000,
                avg_delay_samples: 20,
                avg_loss_delay_samples: 5,
                avg_loss_samples: 50,
                force_down: false,
                alarms: vec![],
            }],
        }
    }

    #[test]
    fn generate_writes_executable_script_naming_location_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_one_target();
        generate(dir.path(), "/pingwatch", &config).unwrap();

        let script_path = dir.path().join("pingwatch.cgi");
        let contents = fs::read_to_string(&script_path).unwrap();
        assert!(contents.contains("location: /pingwatch"));
        assert!(contents.contains("127.0.0.1"));
        assert!(contents.contains("loopback"));

        let mode = fs::metadata(&script_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
