//! Applies and removes OS write bits.
//!
//! Enforcement lives entirely in the file mode: a writer is blocked or allowed
//! by the bits set here, nothing intercepts its calls.

use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::scope::canonicalize_lenient;
use std::collections::HashSet;
use std::fs::{self, Permissions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[cfg(unix)]
const ALL_WRITE_BITS: u32 = 0o222;
#[cfg(unix)]
const OWNER_WRITE_BIT: u32 = 0o200;
#[cfg(unix)]
const GROUP_OTHER_WRITE_BITS: u32 = 0o022;

const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Files SQLite keeps next to a database.
const LEDGER_SIDECAR_SUFFIXES: &[&str] = &["-journal", "-wal", "-shm"];

/// Outcome of a recursive lock pass.
#[derive(Debug, Default, Clone)]
pub struct LockReport {
    pub locked: usize,
    pub skipped: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl LockReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: LockReport) {
        self.locked += other.locked;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }

    /// Short human summary of the failures, if any.
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let shown: Vec<String> = self
            .failures
            .iter()
            .take(5)
            .map(|(path, err)| format!("{}: {}", path.display(), err))
            .collect();
        let mut summary = format!("{} file(s) not locked: {}", self.failures.len(), shown.join("; "));
        if self.failures.len() > shown.len() {
            summary.push_str("; ...");
        }
        Some(summary)
    }
}

#[derive(Debug, Clone)]
pub struct FileModeEnforcer {
    skip_dirs: HashSet<String>,
    skip_extensions: HashSet<String>,
    retry_attempts: u32,
    /// Canonical paths never locked or unlocked: the ledger and its sidecars.
    excluded: HashSet<PathBuf>,
}

impl FileModeEnforcer {
    pub fn new(skip_dirs: HashSet<String>, skip_extensions: HashSet<String>, retry_attempts: u32) -> Self {
        Self {
            skip_dirs,
            skip_extensions,
            retry_attempts: retry_attempts.max(1),
            excluded: HashSet::new(),
        }
    }

    /// An enforcer that leaves the configured ledger files alone, wherever
    /// they sit relative to the protected roots.
    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new(
            config.skip_dirs.iter().cloned().collect(),
            config.skip_extensions.iter().cloned().collect(),
            config.fs_retry_attempts,
        )
        .excluding_ledger(&config.ledger_path)
    }

    pub fn excluding_ledger(mut self, ledger_path: &Path) -> Self {
        let ledger = canonicalize_lenient(ledger_path);
        for suffix in LEDGER_SIDECAR_SUFFIXES {
            let mut sidecar = ledger.clone().into_os_string();
            sidecar.push(suffix);
            self.excluded.insert(PathBuf::from(sidecar));
        }
        self.excluded.insert(ledger);
        self
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.contains(path)
    }

    /// Fail unless `path` is an existing regular file.
    pub fn ensure_file(&self, path: &Path) -> Result<()> {
        self.with_retry(path, || fs::metadata(path).and_then(regular_file))
            .map(|_| ())
    }

    /// Strip owner, group and other write bits.
    pub fn lock(&self, path: &Path) -> Result<()> {
        self.with_retry(path, || {
            let perms = fs::metadata(path)?.permissions();
            fs::set_permissions(path, locked(perms))
        })?;
        debug!("Locked {:?}", path);
        Ok(())
    }

    /// Add the owner write bit to a regular file. Group and other stay
    /// stripped.
    pub fn unlock(&self, path: &Path) -> Result<()> {
        self.with_retry(path, || {
            let metadata = fs::metadata(path).and_then(regular_file)?;
            fs::set_permissions(path, unlocked(metadata.permissions()))
        })?;
        debug!("Unlocked {:?}", path);
        Ok(())
    }

    /// Lock every regular file under `root`, skipping VCS/build/virtualenv
    /// directories, dotfiles, compiled artifacts and the ledger. Symlinks are not
    /// followed. Failures are collected, not raised, so one bad file does not
    /// leave the rest of the tree writable.
    pub fn lock_tree(&self, root: &Path) -> LockReport {
        let mut report = LockReport::default();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !self.is_skipped_dir(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    warn!("Failed to walk {:?}: {}", path, e);
                    report.failures.push((path, e.to_string()));
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if self.is_skipped_file(entry.path()) || self.is_excluded(entry.path()) {
                report.skipped += 1;
                continue;
            }

            match self.lock(entry.path()) {
                Ok(()) => report.locked += 1,
                Err(e) => {
                    warn!("Failed to lock {:?}: {}", entry.path(), e);
                    report.failures.push((entry.path().to_path_buf(), e.to_string()));
                }
            }
        }

        debug!(
            "Locked tree {:?}: {} locked, {} skipped, {} failed",
            root,
            report.locked,
            report.skipped,
            report.failures.len()
        );
        report
    }

    fn is_skipped_dir(&self, entry: &DirEntry) -> bool {
        entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .map(|name| self.skip_dirs.contains(name))
                .unwrap_or(false)
    }

    fn is_skipped_file(&self, path: &Path) -> bool {
        let is_dotfile = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);
        if is_dotfile {
            return true;
        }

        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.skip_extensions.contains(ext))
            .unwrap_or(false)
    }

    fn with_retry<T>(&self, path: &Path, mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retry_attempts => {
                    debug!("Retrying {:?} after transient error: {}", path, e);
                    thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(GuardError::file_system(path, e)),
            }
        }
    }
}

impl Default for FileModeEnforcer {
    fn default() -> Self {
        Self::from_config(&GuardConfig::default())
    }
}

fn regular_file(metadata: fs::Metadata) -> io::Result<fs::Metadata> {
    if metadata.is_file() {
        Ok(metadata)
    } else {
        Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"))
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(unix)]
fn locked(mut perms: Permissions) -> Permissions {
    perms.set_mode(perms.mode() & !ALL_WRITE_BITS);
    perms
}

#[cfg(unix)]
fn unlocked(mut perms: Permissions) -> Permissions {
    perms.set_mode((perms.mode() & !GROUP_OTHER_WRITE_BITS) | OWNER_WRITE_BIT);
    perms
}

#[cfg(not(unix))]
fn locked(mut perms: Permissions) -> Permissions {
    perms.set_readonly(true);
    perms
}

#[cfg(not(unix))]
fn unlocked(mut perms: Permissions) -> Permissions {
    perms.set_readonly(false);
    perms
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn set_mode(path: &Path, mode: u32) {
        fs::set_permissions(path, Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_lock_strips_all_write_bits() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("main.rs");
        fs::write(&file, "fn main() {}").unwrap();
        set_mode(&file, 0o666);

        let enforcer = FileModeEnforcer::default();
        enforcer.lock(&file).unwrap();
        assert_eq!(mode(&file), 0o444);
    }

    #[test]
    fn test_unlock_adds_owner_write_only() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("main.rs");
        fs::write(&file, "fn main() {}").unwrap();
        set_mode(&file, 0o464);

        let enforcer = FileModeEnforcer::default();
        enforcer.unlock(&file).unwrap();
        assert_eq!(mode(&file), 0o644);
    }

    #[test]
    fn test_unlock_rejects_directory() {
        let dir = tempdir().unwrap();
        let enforcer = FileModeEnforcer::default();
        let result = enforcer.unlock(dir.path());
        assert!(matches!(result, Err(GuardError::FileSystem { .. })));
    }

    #[test]
    fn test_lock_missing_file_reports_error() {
        let dir = tempdir().unwrap();
        let enforcer = FileModeEnforcer::default();
        match enforcer.lock(&dir.path().join("missing.rs")) {
            Err(GuardError::FileSystem { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound)
            }
            other => panic!("Expected filesystem error, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_tree_skips_conventional_entries() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();

        let tracked = [root.join("README.md"), root.join("src/lib.rs")];
        let ignored_dirs = [root.join(".git/HEAD"), root.join("node_modules/pkg/index.js")];
        let skipped_files = [root.join(".env"), root.join("src/cache.pyc")];
        for path in tracked
            .iter()
            .chain(ignored_dirs.iter())
            .chain(skipped_files.iter())
        {
            fs::write(path, "x").unwrap();
            set_mode(path, 0o664);
        }

        let report = FileModeEnforcer::default().lock_tree(root);
        assert!(report.is_clean());
        assert_eq!(report.locked, 2);
        assert_eq!(report.skipped, 2);

        for path in &tracked {
            assert_eq!(mode(path), 0o444, "{:?} should be locked", path);
        }
        for path in ignored_dirs.iter().chain(skipped_files.iter()) {
            assert_eq!(mode(path), 0o664, "{:?} should be untouched", path);
        }
    }

    #[test]
    fn test_lock_tree_leaves_ledger_files_writable() {
        let dir = tempdir().unwrap();
        let root = &dir.path().canonicalize().unwrap();
        let ledger = root.join("state/permissions.db");
        let journal = root.join("state/permissions.db-journal");
        let source = root.join("state/notes.md");
        fs::create_dir_all(root.join("state")).unwrap();
        for path in [&ledger, &journal, &source] {
            fs::write(path, "x").unwrap();
            set_mode(path, 0o644);
        }

        let enforcer = FileModeEnforcer::default().excluding_ledger(&ledger);
        let report = enforcer.lock_tree(root);
        assert_eq!(report.locked, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(mode(&ledger), 0o644);
        assert_eq!(mode(&journal), 0o644);
        assert_eq!(mode(&source), 0o444);
        assert!(enforcer.is_excluded(&ledger.canonicalize().unwrap()));
    }

    #[test]
    fn test_ensure_file_rejects_missing_and_directories() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("lib.rs");
        fs::write(&file, "").unwrap();

        let enforcer = FileModeEnforcer::default();
        assert!(enforcer.ensure_file(&file).is_ok());
        assert!(enforcer.ensure_file(dir.path()).is_err());
        assert!(enforcer.ensure_file(&dir.path().join("missing.rs")).is_err());
    }

    #[test]
    fn test_lock_tree_missing_root_is_reported() {
        let dir = tempdir().unwrap();
        let report = FileModeEnforcer::default().lock_tree(&dir.path().join("gone"));
        assert!(!report.is_clean());
        assert!(report.failure_summary().unwrap().contains("gone"));
    }
}
