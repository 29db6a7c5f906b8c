use std::path::PathBuf;

use tracing::{debug, info, instrument};

use crate::xorg::dpms::{DpmsInvoker, DpmsOutcome};
use crate::xorg::procfs;

/// Result of one attempt to drive the display controller directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectAttempt {
    /// Mastership was held; the power level was written (individual outputs
    /// may still have refused, which is acceptable).
    Applied,
    /// Another process owns the device. Expected whenever a display server
    /// is running; triggers the session fallback.
    Unavailable,
}

/// The direct hardware path, seam for the orchestrator.
pub trait DirectPower {
    fn try_set_power(&mut self, on: bool) -> DirectAttempt;
}

/// How a power transition was ultimately delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerOutcome {
    /// Written straight to the display controller.
    Direct,
    /// Accepted by the display server owning this session.
    Session { display: String },
    /// No path accepted the change; deliberately silent.
    Unhandled,
}

/// Session-side fallback: locate running display servers, recover their
/// credentials and ask them to change power state. Candidates are resolved
/// fresh on every call; the set of servers changes between lid events.
pub struct SessionFallback {
    proc_root: PathBuf,
    invoker: DpmsInvoker,
}

impl SessionFallback {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            invoker: DpmsInvoker::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_invoker(proc_root: impl Into<PathBuf>, invoker: DpmsInvoker) -> Self {
        Self {
            proc_root: proc_root.into(),
            invoker,
        }
    }

    /// Try each candidate in enumeration order; the first success is final.
    /// A rejected attempt earns exactly one retry with credentials recovered
    /// from the environment scan, whatever that retry's outcome.
    fn set_power(&self, on: bool) -> PowerOutcome {
        for pid in procfs::display_server_pids(&self.proc_root) {
            let invocation = procfs::server_invocation(&self.proc_root, pid);
            let Some(display_name) = invocation.display else {
                debug!(pid, "candidate has no display token; skipping");
                continue;
            };
            let attempt = self
                .invoker
                .invoke(&display_name, invocation.authority.as_deref(), on);
            match attempt.outcome {
                DpmsOutcome::Applied => {
                    info!(pid, display = %display_name, "session accepted DPMS change");
                    return PowerOutcome::Session {
                        display: display_name,
                    };
                }
                DpmsOutcome::Rejected => {
                    debug!(
                        pid,
                        display = %display_name,
                        diagnostic = %attempt.diagnostic,
                        "session refused the connection; rescanning for credentials"
                    );
                    let Some(authority) =
                        procfs::find_session_authority(&self.proc_root, &display_name)
                    else {
                        continue;
                    };
                    let retry = self.invoker.invoke(&display_name, Some(&authority), on);
                    if retry.outcome == DpmsOutcome::Applied {
                        info!(pid, display = %display_name, "session accepted DPMS change after credential rescan");
                        return PowerOutcome::Session {
                            display: display_name,
                        };
                    }
                    // one retry per candidate, whatever came of it
                }
                DpmsOutcome::Failed => {
                    debug!(
                        pid,
                        display = %display_name,
                        diagnostic = %attempt.diagnostic,
                        "session DPMS attempt failed"
                    );
                }
            }
        }
        PowerOutcome::Unhandled
    }
}

/// Composes the direct hardware path with the session fallback. Owns all the
/// state either path needs; nothing lives in globals.
pub struct PowerEngine<D> {
    direct: D,
    fallback: SessionFallback,
}

impl<D: DirectPower> PowerEngine<D> {
    pub fn new(direct: D, fallback: SessionFallback) -> Self {
        Self { direct, fallback }
    }

    /// Apply the desired power state through whichever path is available.
    /// Never fails: every obstacle short of the fatal startup conditions is
    /// absorbed into "try the next option".
    #[instrument(skip(self))]
    pub fn set_power(&mut self, on: bool) -> PowerOutcome {
        match self.direct.try_set_power(on) {
            DirectAttempt::Applied => {
                info!("display controller applied power change directly");
                PowerOutcome::Direct
            }
            DirectAttempt::Unavailable => {
                debug!("display controller owned elsewhere; trying session fallback");
                self.fallback.set_power(on)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xorg::dpms::{HelperOutput, HelperRequest, REJECTION_SIGNATURE};
    use anyhow::Result;
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct FakeDirect {
        attempt: DirectAttempt,
        calls: usize,
    }

    impl FakeDirect {
        fn applied() -> Self {
            Self {
                attempt: DirectAttempt::Applied,
                calls: 0,
            }
        }

        fn unavailable() -> Self {
            Self {
                attempt: DirectAttempt::Unavailable,
                calls: 0,
            }
        }
    }

    impl DirectPower for FakeDirect {
        fn try_set_power(&mut self, _on: bool) -> DirectAttempt {
            self.calls += 1;
            self.attempt
        }
    }

    type Calls = Arc<Mutex<Vec<HelperRequest>>>;

    fn recording_invoker(
        script: impl Fn(&HelperRequest) -> Result<HelperOutput> + Send + Sync + 'static,
    ) -> (DpmsInvoker, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&calls);
        let invoker = DpmsInvoker::with_runner(Arc::new(move |request: &HelperRequest| {
            recorded.lock().unwrap().push(request.clone());
            script(request)
        }));
        (invoker, calls)
    }

    fn accepted() -> Result<HelperOutput> {
        Ok(HelperOutput {
            success: true,
            stderr: String::new(),
        })
    }

    fn rejected() -> Result<HelperOutput> {
        Ok(HelperOutput {
            success: false,
            stderr: format!("{REJECTION_SIGNATURE}\n"),
        })
    }

    fn refused() -> Result<HelperOutput> {
        Ok(HelperOutput {
            success: false,
            stderr: "cannot open display\n".to_string(),
        })
    }

    fn fake_proc() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    fn add_server(root: &Path, pid: u32, cmdline: &[&str]) {
        let dir = root.join(pid.to_string());
        fs::create_dir(&dir).unwrap();
        symlink("/usr/bin/Xorg", dir.join("exe")).unwrap();
        let mut joined = cmdline.join("\0").into_bytes();
        joined.push(0);
        fs::write(dir.join("cmdline"), joined).unwrap();
    }

    fn add_client(root: &Path, pid: u32, environ: &[&str]) {
        let dir = root.join(pid.to_string());
        fs::create_dir(&dir).unwrap();
        symlink("/usr/bin/bash", dir.join("exe")).unwrap();
        fs::write(dir.join("cmdline"), b"bash\0").unwrap();
        let mut joined = environ.join("\0").into_bytes();
        joined.push(0);
        fs::write(dir.join("environ"), joined).unwrap();
    }

    #[test]
    fn direct_success_never_consults_the_fallback() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", ":0"]);
        let (invoker, calls) = recording_invoker(|_| accepted());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::applied(), fallback);

        assert_eq!(engine.set_power(false), PowerOutcome::Direct);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(engine.direct.calls, 1);
    }

    #[test]
    fn no_candidates_is_a_silent_no_op() {
        let proc = fake_proc();
        let (invoker, calls) = recording_invoker(|_| accepted());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        assert_eq!(engine.set_power(true), PowerOutcome::Unhandled);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn first_accepted_candidate_ends_the_search() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", ":0", "-auth", "/run/x0"]);
        let (invoker, calls) = recording_invoker(|_| accepted());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        let outcome = engine.set_power(false);
        assert_eq!(
            outcome,
            PowerOutcome::Session {
                display: ":0".to_string()
            }
        );
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].display, ":0");
        assert_eq!(calls[0].authority.as_deref(), Some(Path::new("/run/x0")));
        assert!(!calls[0].power_on);
    }

    #[test]
    fn rejection_earns_one_rescan_and_later_candidates_stay_untouched() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", ":0"]);
        add_server(proc.path(), 200, &["Xorg", ":1"]);
        add_client(proc.path(), 300, &["DISPLAY=:0", "XAUTHORITY=/run/user/xauth0"]);
        add_client(proc.path(), 400, &["DISPLAY=:1", "XAUTHORITY=/run/user/xauth1"]);
        // without credentials the server refuses; with them it accepts
        let (invoker, calls) = recording_invoker(|request| {
            if request.authority.is_some() {
                accepted()
            } else {
                rejected()
            }
        });
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        let outcome = engine.set_power(false);
        let calls = calls.lock().unwrap();
        // one direct attempt, one retry, nothing for the second candidate
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].authority, None);
        assert_eq!(calls[0].display, calls[1].display);
        let expected_auth = if calls[0].display == ":0" {
            "/run/user/xauth0"
        } else {
            "/run/user/xauth1"
        };
        assert_eq!(
            calls[1].authority.as_deref(),
            Some(Path::new(expected_auth))
        );
        assert_eq!(
            outcome,
            PowerOutcome::Session {
                display: calls[0].display.clone()
            }
        );
    }

    #[test]
    fn plain_failure_moves_on_without_a_rescan() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", ":0"]);
        add_server(proc.path(), 200, &["Xorg", ":1"]);
        add_client(proc.path(), 300, &["DISPLAY=:0", "XAUTHORITY=/run/xauth"]);
        let (invoker, calls) = recording_invoker(|_| refused());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        assert_eq!(engine.set_power(true), PowerOutcome::Unhandled);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call.authority.is_none()));
    }

    #[test]
    fn rejection_without_recoverable_credentials_moves_on() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", ":0"]);
        // a client of the right display that names no credential file
        add_client(proc.path(), 300, &["DISPLAY=:0", "HOME=/root"]);
        let (invoker, calls) = recording_invoker(|_| rejected());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        assert_eq!(engine.set_power(false), PowerOutcome::Unhandled);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn rescan_result_is_final_even_when_rejected_again() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", ":0"]);
        add_client(proc.path(), 300, &["DISPLAY=:0", "XAUTHORITY=/run/stale"]);
        let (invoker, calls) = recording_invoker(|_| rejected());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        assert_eq!(engine.set_power(false), PowerOutcome::Unhandled);
        // direct attempt plus exactly one retry, never a third
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn candidates_without_a_display_token_are_skipped() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", "-auth", "/run/x0", "vt7"]);
        let (invoker, calls) = recording_invoker(|_| accepted());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        assert_eq!(engine.set_power(false), PowerOutcome::Unhandled);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn repeated_calls_resolve_candidates_fresh_each_time() {
        let proc = fake_proc();
        add_server(proc.path(), 100, &["Xorg", ":0"]);
        let (invoker, calls) = recording_invoker(|_| accepted());
        let fallback = SessionFallback::with_invoker(proc.path(), invoker);
        let mut engine = PowerEngine::new(FakeDirect::unavailable(), fallback);

        let first = engine.set_power(false);
        let second = engine.set_power(false);
        assert_eq!(first, second);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| !call.power_on));
    }
}
