//! Signal flags (spec §5/§6): translates the handful of signals the
//! monitor reacts to into a plain observation struct the main loop polls
//! once per iteration, instead of hand-written `libc::signal` handlers.
//!
//! `signal-hook`'s `iterator::Signals` already does the async-signal-safe
//! part (the handler itself only writes a byte into a self-pipe); calling
//! `.pending()` here just drains whatever arrived since the last poll, as
//! spec §5 requires ("Handlers set volatile flags ... re-armed explicitly
//! after the main loop services them" — `signal-hook` re-arms on every
//! `pending()` call).

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;

pub struct SignalFlags {
    signals: Signals,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Observed {
    pub reload: bool,
    pub status: bool,
    /// `Some(signum)` once a `SIGTERM`/`SIGINT` has been observed, so the
    /// entrypoint can log which one caused the shutdown (spec §5:
    /// "`interrupted_by` ... records the signal number for exit logging").
    pub shutdown: Option<i32>,
}

impl SignalFlags {
    pub fn new() -> std::io::Result<Self> {
        let signals = Signals::new([SIGHUP, SIGUSR1, SIGTERM, SIGINT, SIGPIPE])?;
        Ok(SignalFlags { signals })
    }

    /// Drains every signal delivered since the last call, non-blockingly.
    pub fn poll(&mut self) -> Observed {
        let mut observed = Observed::default();
        for signum in self.signals.pending() {
            match signum {
                SIGHUP => observed.reload = true,
                SIGUSR1 => observed.status = true,
                SIGTERM | SIGINT => observed.shutdown = Some(signum),
                SIGPIPE => {
                    // Ignored: a dead pipe_on/pipe_off child must not kill
                    // the monitor (spec §6).
                }
                _ => {}
            }
        }
        observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_defaults_to_no_signals_seen() {
        let observed = Observed::default();
        assert!(!observed.reload);
        assert!(!observed.status);
        assert_eq!(observed.shutdown, None);
    }
}
