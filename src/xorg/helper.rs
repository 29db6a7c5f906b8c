use x11rb::connection::Connection;
use x11rb::errors::ConnectError;
use x11rb::protocol::dpms::{ConnectionExt as _, DPMSMode};
use x11rb::rust_connection::RustConnection;

/// Isolated helper entry point: connect to the session named by `DISPLAY`
/// (authorized by `XAUTHORITY`, both prepared by the parent) and force the
/// DPMS level. Runs in its own process so a misbehaving server cannot touch
/// the daemon's state; stderr is the only channel back to the parent.
///
/// Returns the process exit code: 0 once a connection was established, 1 when
/// the server could not be reached or refused the connection.
pub fn run(power_on: bool) -> i32 {
    match RustConnection::connect(None) {
        Ok((conn, _screen)) => {
            let level = if power_on { DPMSMode::ON } else { DPMSMode::OFF };
            // Post-connect protocol errors are ignored: a session without the
            // DPMS extension behaves like one that accepted the calls.
            if let Ok(cookie) = conn.dpms_enable() {
                let _ = cookie.check();
            }
            if let Ok(cookie) = conn.dpms_force_level(level) {
                let _ = cookie.check();
            }
            let _ = conn.flush();
            0
        }
        Err(err) => {
            // The server's refusal reason must reach the parent verbatim; it
            // matches on the exact text.
            eprint!("{}", connect_failure_text(&err));
            1
        }
    }
}

fn connect_failure_text(err: &ConnectError) -> String {
    match err {
        ConnectError::SetupFailed(failed) => String::from_utf8_lossy(&failed.reason).into_owned(),
        ConnectError::SetupAuthenticate(auth) => {
            String::from_utf8_lossy(&auth.reason).into_owned()
        }
        other => format!("{other}\n"),
    }
}
