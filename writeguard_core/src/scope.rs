//! Decides which paths the guard governs.

use std::env;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ProtectedScopeResolver {
    roots: Vec<PathBuf>,
}

impl ProtectedScopeResolver {
    /// Canonicalize each configured root. A root that does not exist yet is
    /// kept in its lexically normalized absolute form.
    pub fn new<P: AsRef<Path>>(roots: impl IntoIterator<Item = P>) -> Self {
        let roots = roots
            .into_iter()
            .map(|root| {
                let root = root.as_ref();
                match root.canonicalize() {
                    Ok(canonical) => canonical,
                    Err(e) => {
                        let fallback = normalize(&absolute(root));
                        warn!(
                            "Protected root {:?} could not be resolved ({}); using {:?}",
                            root, e, fallback
                        );
                        fallback
                    }
                }
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve `path` to its canonical form. Symlinks are followed as far as
    /// the path exists; a missing tail is appended lexically.
    pub fn canonicalize(&self, path: &Path) -> PathBuf {
        canonicalize_lenient(path)
    }

    /// The canonical path when it lies strictly below a protected root.
    pub fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let canonical = canonicalize_lenient(path);
        self.contains(&canonical).then_some(canonical)
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }

    fn contains(&self, canonical: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| canonical != root && canonical.starts_with(root))
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize as much of `path` as exists. The OS resolves symlinks and
/// `..` in the existing prefix; `.` and `..` in the missing tail are applied
/// to the canonical prefix afterwards, where no symlink can intervene.
pub(crate) fn canonicalize_lenient(path: &Path) -> PathBuf {
    let path = absolute(path);
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let components: Vec<Component<'_>> = path.components().collect();
    for split in (1..components.len()).rev() {
        let prefix: PathBuf = components[..split].iter().collect();
        let Ok(mut canonical) = prefix.canonicalize() else {
            continue;
        };
        for component in &components[split..] {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    canonical.pop();
                }
                other => canonical.push(other.as_os_str()),
            }
        }
        return canonical;
    }
    normalize(&path)
}
