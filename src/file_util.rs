//! Filesystem helpers shared by the packfile, index, and metadata log.
//!
//! The central idiom here is the same one used for every durable write in
//! this crate: stage content in a [`tempfile::NamedTempFile`] next to the
//! final path, `sync_data()` it, then atomically rename it into place. A
//! crash between the write and the rename leaves the old file (or nothing)
//! in place, never a half-written one.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;

/// An I/O error annotated with the path that caused it.
#[derive(Debug, thiserror::Error)]
#[error("failed to access {path}")]
pub struct PathError {
    pub path: PathBuf,
    #[source]
    pub error: io::Error,
}

pub fn create_or_reuse_dir(dir: &Path) -> Result<(), PathError> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(PathError {
            path: dir.to_owned(),
            error: err,
        }),
    }
}

/// Persists `temp_file` at `new_path`, syncing its data first so the bytes
/// are durable before the rename that makes them visible.
pub fn persist_temp_file(temp_file: NamedTempFile, new_path: impl AsRef<Path>) -> io::Result<()> {
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(new_path.as_ref())
        .map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_writes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let mut temp = NamedTempFile::new_in(dir.path()).unwrap();
        use std::io::Write as _;
        temp.write_all(b"payload").unwrap();
        persist_temp_file(temp, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

}
