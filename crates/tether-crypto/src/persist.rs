use std::fs;
use std::io;
use std::path::Path;

/// Write `bytes` to `path` through a sibling temp file and an atomic rename,
/// so a crash mid-write never leaves a truncated store behind.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}
