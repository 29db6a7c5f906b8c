use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::scan;

/// Executable images recognized as an X display server.
pub const SERVER_BINARIES: [&str; 2] = ["/usr/bin/Xorg", "/usr/lib/Xorg"];

/// Content bytes kept of any single field, the rest is discarded. One byte of
/// the 200-byte working buffer is reserved for the terminator.
pub const FIELD_CAP: usize = 199;

/// NUL-delimited fields of a byte stream, each clamped to [`FIELD_CAP`].
///
/// Zero-length fields are skipped and a read error mid-stream ends the
/// sequence like EOF would; both show up in `/proc` files of processes that
/// exit mid-read.
pub struct BoundedFields<R> {
    reader: R,
    cap: usize,
}

impl<R: BufRead> BoundedFields<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            cap: FIELD_CAP,
        }
    }

    #[cfg(test)]
    fn with_cap(reader: R, cap: usize) -> Self {
        Self { reader, cap }
    }
}

impl<R: BufRead> Iterator for BoundedFields<R> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let mut field: Vec<u8> = Vec::new();
        loop {
            let chunk = match self.reader.fill_buf() {
                Ok(chunk) => chunk,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => &[],
            };
            if chunk.is_empty() {
                return (!field.is_empty()).then_some(field);
            }
            match chunk.iter().position(|&b| b == 0) {
                Some(pos) => {
                    let keep = pos.min(self.cap.saturating_sub(field.len()));
                    field.extend_from_slice(&chunk[..keep]);
                    self.reader.consume(pos + 1);
                    if !field.is_empty() {
                        return Some(field);
                    }
                }
                None => {
                    let len = chunk.len();
                    let keep = len.min(self.cap.saturating_sub(field.len()));
                    field.extend_from_slice(&chunk[..keep]);
                    self.reader.consume(len);
                }
            }
        }
    }
}

/// What a display server's command line told us about its session.
///
/// Either half may be missing; a present display with no authority is a
/// normal shape (the server may not need an explicit credential file).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerInvocation {
    pub display: Option<String>,
    pub authority: Option<PathBuf>,
}

/// First `:N`-shaped token and the value after the first `-auth` token.
///
/// A display-shaped token is recognized even directly after `-auth`; the
/// pending capture then applies to the next token instead.
pub fn parse_invocation(fields: impl Iterator<Item = Vec<u8>>) -> ServerInvocation {
    let mut invocation = ServerInvocation::default();
    let mut auth_pending = false;
    for field in fields {
        if is_display_token(&field) {
            if invocation.display.is_none() {
                invocation.display = Some(String::from_utf8_lossy(&field).into_owned());
            }
        } else if field == b"-auth" {
            if invocation.authority.is_none() {
                auth_pending = true;
            }
        } else if auth_pending {
            auth_pending = false;
            invocation.authority = Some(PathBuf::from(OsString::from_vec(field)));
        }
    }
    invocation
}

fn is_display_token(field: &[u8]) -> bool {
    field.len() >= 2 && field[0] == b':' && field[1].is_ascii_digit()
}

/// Read `<proc_root>/<pid>/cmdline`; an unreadable file yields the empty
/// invocation (the process may already be gone).
pub fn server_invocation(proc_root: &Path, pid: u32) -> ServerInvocation {
    match File::open(proc_root.join(pid.to_string()).join("cmdline")) {
        Ok(file) => parse_invocation(BoundedFields::new(BufReader::new(file))),
        Err(err) => {
            trace!(pid, error = %err, "cmdline unreadable; treating as empty");
            ServerInvocation::default()
        }
    }
}

/// PIDs under `proc_root` whose `exe` link resolves to a known display-server
/// binary. Lazy; processes that vanish mid-scan are skipped.
pub fn display_server_pids(proc_root: &Path) -> impl Iterator<Item = u32> {
    scan::matches(proc_root, |path| {
        let pid = pid_from_path(path)?;
        let exe = fs::read_link(path.join("exe")).ok()?;
        SERVER_BINARIES
            .iter()
            .any(|known| Path::new(known) == exe)
            .then_some(pid)
    })
}

/// Search every process's environment for one that is a client of `display`
/// and names a credential file, i.e. carries both `DISPLAY=<display>` (exact)
/// and an `XAUTHORITY=` entry. First such process wins.
pub fn find_session_authority(proc_root: &Path, display: &str) -> Option<PathBuf> {
    scan::first_match(proc_root, |path| {
        pid_from_path(path)?;
        environ_authority(path, display)
    })
}

fn environ_authority(pid_dir: &Path, display: &str) -> Option<PathBuf> {
    let file = File::open(pid_dir.join("environ")).ok()?;
    let mut display_matches = false;
    let mut authority: Option<PathBuf> = None;
    for field in BoundedFields::new(BufReader::new(file)) {
        if let Some(value) = field.strip_prefix(b"DISPLAY=") {
            if value == display.as_bytes() {
                display_matches = true;
            }
        } else if let Some(value) = field.strip_prefix(b"XAUTHORITY=") {
            authority = Some(PathBuf::from(OsString::from_vec(value.to_vec())));
        }
        if display_matches && authority.is_some() {
            break;
        }
    }
    if display_matches { authority } else { None }
}

fn pid_from_path(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}
