//! Single-instance guard for CLI commands, held as a lock file on disk.
//! Complements the database lease: the file catches two commands on the
//! same host, the lease catches two hosts on the same database.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

pub struct CommandLock {
    path: PathBuf,
}

impl CommandLock {
    /// Try to take the named lock under `dir`. `Ok(None)` means another
    /// process already holds it.
    pub fn acquire(dir: &Path, name: &str) -> io::Result<Option<Self>> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.lock"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // Best effort hint for whoever inspects a stale lock.
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self { path }))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for CommandLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "could not remove lock file");
        }
    }
}
