// Per-domain security: the one-way trusted flag, the permission set and
// secure IO. Untrusted domains with file permissions are confined to a
// fresh per-domain directory under the configured secure root, and every
// path they hand to a file primitive is validated and re-anchored.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use log::{debug, warn};

use crate::abort::abort_with_message;

pub const FILE_IO_PERMISSION: &str = "FileIOPermission";
pub const DOMAIN_CREATION_PERMISSION: &str = "DomainCreationPermission";

const PATH_NOT_SECURE: &str = "Path can't be proven to be secure.";
const ACCESS_DENIED: &str = "Code access denied.";
const OUTSIDE_SECURE_DIR: &str = "File access outside of the allowed directory denied.";

/// Process-wide capture of the current directory and the secure root.
/// Captured once: native code in one domain may change the OS-level current
/// directory and must not affect path resolution in others.
struct CurrentDirectoryManager {
    current_directory: PathBuf,
    secure_root: PathBuf,
}

fn global() -> &'static RwLock<Option<CurrentDirectoryManager>> {
    static G: RwLock<Option<CurrentDirectoryManager>> = RwLock::new(None);
    &G
}

/// Embedder init. `secure_root` defaults to `<cwd>/secure`.
pub fn init_security(secure_root: Option<PathBuf>) {
    let current_directory =
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let secure_root = secure_root.unwrap_or_else(|| current_directory.join("secure"));
    let mut guard = global().write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(CurrentDirectoryManager {
        current_directory,
        secure_root,
    });
}

pub fn deinit_security() {
    let mut guard = global().write().unwrap_or_else(|e| e.into_inner());
    *guard = None;
}

fn with_global<R>(f: impl FnOnce(&CurrentDirectoryManager) -> R) -> R {
    {
        let guard = global().read().unwrap_or_else(|e| e.into_inner());
        if let Some(mgr) = guard.as_ref() {
            return f(mgr);
        }
    }
    init_security(None);
    let guard = global().read().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(mgr) => f(mgr),
        None => abort_with_message(ACCESS_DENIED),
    }
}

pub fn captured_current_directory() -> PathBuf {
    with_global(|g| g.current_directory.clone())
}

pub fn secure_root() -> PathBuf {
    with_global(|g| g.secure_root.clone())
}

pub struct SecurityManager {
    trusted: bool,
    permissions: Vec<String>,
    secure_path: Option<PathBuf>,
}

static SECURE_DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

impl SecurityManager {
    pub fn new() -> Self {
        Self {
            trusted: true,
            permissions: Vec::new(),
            secure_path: None,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// One-way transition: trusted -> untrusted. An untrusted domain may
    /// never elevate.
    pub fn set_trusted(&mut self, value: bool) {
        if value && !self.trusted {
            return;
        }
        self.trusted = value;
    }

    pub fn add_permission(&mut self, permission: impl Into<String>) {
        self.permissions.push(permission.into());
    }

    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }

    pub fn is_permission_granted(&self, name: &str) -> bool {
        self.permissions.iter().any(|p| p == name)
    }

    /// No-op for trusted domains; raises `Code access denied.` when an
    /// untrusted domain lacks the permission.
    pub fn demand_permission(&self, name: &str) {
        if !self.trusted && !self.is_permission_granted(name) {
            warn!("permission denied: {}", name);
            abort_with_message(ACCESS_DENIED);
        }
    }

    // ------------------------------------------------------------------
    // Secure IO.
    // ------------------------------------------------------------------

    pub fn secure_path(&self) -> Option<&Path> {
        self.secure_path.as_deref()
    }

    /// Eagerly creates the per-domain directory for untrusted domains that
    /// hold the file-IO permission.
    pub fn init_secure_io(&mut self) {
        if !self.trusted && self.is_permission_granted(FILE_IO_PERMISSION) {
            let unique = format!(
                "sd{}_{}",
                std::process::id(),
                SECURE_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            let path = secure_root().join(unique);
            if let Err(err) = std::fs::create_dir_all(&path) {
                warn!("failed to create secure directory {:?}: {}", path, err);
            }
            debug!("secure directory: {:?}", path);
            self.secure_path = Some(path);
        }
    }

    /// Destroys the secure directory; errors are ignored.
    pub fn deinit_secure_io(&mut self) {
        if let Some(path) = self.secure_path.take() {
            let _ = std::fs::remove_dir_all(&path);
        }
    }

    /// The directory user code observes: the real process directory for
    /// trusted domains, the secure directory for untrusted ones. Demands
    /// the file-IO permission first.
    pub fn current_directory(&self) -> PathBuf {
        self.demand_permission(FILE_IO_PERMISSION);
        if self.trusted {
            captured_current_directory()
        } else {
            match &self.secure_path {
                Some(path) => path.clone(),
                None => abort_with_message(ACCESS_DENIED),
            }
        }
    }

    /// Validates and re-anchors a user-supplied path; untrusted domains may
    /// only reach descendants of their secure directory.
    pub fn demand_file_io_permission(&self, path: &str) {
        if self.trusted {
            return;
        }
        self.demand_permission(FILE_IO_PERMISSION);
        let full = self.full_path(path);
        let allowed = self
            .secure_path
            .as_ref()
            .map(|secure| full.starts_with(secure))
            .unwrap_or(false);
        if !allowed {
            abort_with_message(OUTSIDE_SECURE_DIR);
        }
    }

    /// Domain-aware full path: resolves relative paths against the
    /// domain-recorded directory, never the process-wide one.
    pub fn full_path(&self, path: &str) -> PathBuf {
        validate_path_is_secure(path);
        let p = Path::new(path);
        if p.is_absolute() {
            normalize_lexically(p)
        } else {
            let base = if self.trusted {
                captured_current_directory()
            } else {
                self.secure_path
                    .clone()
                    .unwrap_or_else(captured_current_directory)
            };
            normalize_lexically(&base.join(p))
        }
    }
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects paths that cannot be proven secure: embedded NULs (truncation
/// tricks), backslashes (foreign separators), parent components and shell
/// metacharacters.
pub fn validate_path_is_secure(path: &str) {
    let bytes = path.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            0 | b'\\' | b'<' | b'>' | b'|' | b'"' | b'*' | b'?' => {
                abort_with_message(PATH_NOT_SECURE)
            }
            b'.' if bytes.get(i + 1) == Some(&b'.') => abort_with_message(PATH_NOT_SECURE),
            _ => {}
        }
    }
}

/// Purely lexical normalization; the target may not exist yet, so
/// filesystem canonicalization is not an option.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // validate_path_is_secure already rejected `..`.
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::catch_abort;

    #[test]
    fn test_trusted_demand_is_noop() {
        let mgr = SecurityManager::new();
        assert!(catch_abort(|| mgr.demand_permission(FILE_IO_PERMISSION)).is_ok());
    }

    #[test]
    fn test_untrusted_denied_without_permission() {
        let mut mgr = SecurityManager::new();
        mgr.set_trusted(false);
        let err = catch_abort(|| mgr.demand_permission(FILE_IO_PERMISSION)).unwrap_err();
        assert_eq!(err.message, "Code access denied.");
    }

    #[test]
    fn test_untrusted_with_permission_passes() {
        let mut mgr = SecurityManager::new();
        mgr.set_trusted(false);
        mgr.add_permission(FILE_IO_PERMISSION);
        assert!(catch_abort(|| mgr.demand_permission(FILE_IO_PERMISSION)).is_ok());
    }

    #[test]
    fn test_elevation_is_impossible() {
        let mut mgr = SecurityManager::new();
        mgr.set_trusted(false);
        mgr.set_trusted(true);
        assert!(!mgr.is_trusted());
    }

    #[test]
    fn test_path_validation_rejects_escapes() {
        for bad in ["../etc/passwd", "a\\b", "a\0b", "sneaky/..", "wild*card"] {
            let err = catch_abort(|| validate_path_is_secure(bad)).unwrap_err();
            assert_eq!(err.message, "Path can't be proven to be secure.", "{bad}");
        }
        assert!(catch_abort(|| validate_path_is_secure("plain/file.txt")).is_ok());
    }

    #[test]
    fn test_secure_io_confinement() {
        let root = tempfile::tempdir().unwrap();
        init_security(Some(root.path().to_path_buf()));

        let mut mgr = SecurityManager::new();
        mgr.set_trusted(false);
        mgr.add_permission(FILE_IO_PERMISSION);
        mgr.init_secure_io();
        let secure = mgr.secure_path().unwrap().to_path_buf();
        assert!(secure.starts_with(root.path()));
        assert!(secure.is_dir());

        // Relative paths resolve under the secure directory.
        assert!(catch_abort(|| mgr.demand_file_io_permission("data.txt")).is_ok());
        // Absolute paths outside it are rejected.
        let err = catch_abort(|| mgr.demand_file_io_permission("/etc/hosts")).unwrap_err();
        assert_eq!(
            err.message,
            "File access outside of the allowed directory denied."
        );

        mgr.deinit_secure_io();
        assert!(!secure.exists());
        deinit_security();
    }
}
