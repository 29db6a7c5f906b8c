use std::fs;
use std::path::Path;

/// Offer every entry of `dir` to `probe`, yielding the hits lazily.
///
/// Entries that cannot be read (vanished mid-scan, permission denied) are
/// skipped, and a missing directory yields nothing. The same primitive backs
/// the lid-device search, the display-server scan, and the credential scan.
pub fn matches<T, F>(dir: &Path, mut probe: F) -> impl Iterator<Item = T>
where
    F: FnMut(&Path) -> Option<T>,
{
    fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(move |entry| probe(&entry.ok()?.path()))
}

/// Scan `dir` until `probe` accepts an entry.
pub fn first_match<T, F>(dir: &Path, probe: F) -> Option<T>
where
    F: FnMut(&Path) -> Option<T>,
{
    matches(dir, probe).next()
}
