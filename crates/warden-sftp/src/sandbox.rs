//! Chroot-style path sandbox
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Input Validation)
//! STIG: V-222396, V-222596
//!
//! Every path the peer sends is canonicalized as an absolute path first and
//! only then prefixed with the customer's home directory. Because `..` is
//! collapsed and clamped at `/` before the prefix exists, no amount of `..`
//! can climb out of the home. Symlinks inside the home are checked against
//! the real filesystem afterwards.

use crate::{Error, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Dangling symlinks followed before giving up, like the kernel's ELOOP limit
const MAX_LINK_HOPS: usize = 40;

/// Collapse `.`, `..` and repeated slashes into an absolute sandbox path.
///
/// Relative paths are taken relative to `/`, the customer's home. `..` at the
/// top is clamped, so `../../etc/passwd` becomes `/etc/passwd`.
pub fn canonicalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }

    format!("/{}", parts.join("/"))
}

/// Sandbox rooted at one customer's home directory
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Sandbox rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory the peer sees as `/`
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a peer path to the host path under the root, without touching the
    /// filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] for paths containing NUL bytes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.contains('\0') {
            warn!("Path contains null bytes: {:?}", path);
            return Err(Error::InvalidPath("Path contains invalid characters".into()));
        }

        let logical = canonicalize(path);
        let relative = logical.trim_start_matches('/');

        if relative.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(relative))
        }
    }

    /// Resolve and make sure symlinks on the way do not lead outside the root.
    ///
    /// With `follow_final` unset the last component is not followed, which is
    /// what `lstat`, `remove` and friends need.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] when a symlink leads outside the root, or
    /// the I/O error hit while checking.
    pub async fn resolve_checked(&self, path: &str, follow_final: bool) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        let check_from = if follow_final || resolved == self.root {
            resolved.as_path()
        } else {
            resolved.parent().unwrap_or(&self.root)
        };

        self.ensure_contained(check_from).await?;
        Ok(resolved)
    }

    /// Realpath of the deepest existing ancestor must stay under the realpath
    /// of the root. Missing trailing components are fine (file creation),
    /// except that a dangling symlink on the way is followed to wherever it
    /// points, since `open(2)` with `O_CREAT` would create its target.
    async fn ensure_contained(&self, path: &Path) -> Result<()> {
        let real_root = tokio::fs::canonicalize(&self.root).await?;
        let mut pending = path.to_path_buf();

        for _ in 0..MAX_LINK_HOPS {
            let mut cursor = pending.clone();
            let mut missing: Vec<OsString> = Vec::new();

            let dangling = loop {
                match tokio::fs::canonicalize(&cursor).await {
                    Ok(real) if real.starts_with(&real_root) => return Ok(()),
                    Ok(_) => return Err(escape_blocked(path)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        if is_symlink(&cursor).await {
                            break cursor;
                        }
                        let Some(last) = cursor.components().next_back() else {
                            return Err(escape_blocked(path));
                        };
                        missing.push(last.as_os_str().to_owned());
                        cursor.pop();
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            // The link exists, so its parent does too.
            let parent = dangling.parent().unwrap_or_else(|| Path::new("/"));
            let real_parent = tokio::fs::canonicalize(parent).await?;
            if !real_parent.starts_with(&real_root) {
                return Err(escape_blocked(path));
            }

            let target = tokio::fs::read_link(&dangling).await?;
            pending = real_parent.join(target);
            pending.extend(missing.iter().rev());
        }

        warn!(
            event = "sandbox_symlink_loop",
            path = ?path,
            "Too many dangling symlinks while resolving"
        );
        Err(Error::PermissionDenied("too many levels of symbolic links".into()))
    }

    /// Host path back to the sandbox path the peer should see
    pub fn to_logical(&self, host: &Path) -> Option<String> {
        let relative = host.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Some(format!("/{}", parts.join("/")))
    }
}

async fn is_symlink(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .is_ok_and(|m| m.file_type().is_symlink())
}

fn escape_blocked(path: &Path) -> Error {
    warn!(
        event = "sandbox_escape_blocked",
        path = ?path,
        "Symlink leads outside the sandbox root"
    );
    Error::PermissionDenied("path leaves the sandbox".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        let cases = [
            ("", "/"),
            (".", "/"),
            ("/", "/"),
            ("a/b/c", "/a/b/c"),
            ("/a//b/./c/", "/a/b/c"),
            ("a/../b", "/b"),
            ("../../etc/passwd", "/etc/passwd"),
            ("/../../..", "/"),
            ("uploads/../../../../root/.ssh", "/root/.ssh"),
        ];
        for (input, expected) in cases {
            assert_eq!(canonicalize(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_resolve_prefixes_root() {
        let sandbox = Sandbox::new("/home/richard");
        assert_eq!(sandbox.resolve("/").unwrap(), PathBuf::from("/home/richard"));
        assert_eq!(
            sandbox.resolve("docs/report.txt").unwrap(),
            PathBuf::from("/home/richard/docs/report.txt")
        );
        assert_eq!(
            sandbox.resolve("../../etc/passwd").unwrap(),
            PathBuf::from("/home/richard/etc/passwd")
        );
    }

    #[test]
    fn test_resolve_never_leaves_root() {
        let sandbox = Sandbox::new("/home/richard");
        for path in [
            "../../../etc/passwd",
            "/../outside",
            "subdir/../../outside/file.txt",
            "./.././../",
        ] {
            let resolved = sandbox.resolve(path).unwrap();
            assert!(resolved.starts_with("/home/richard"), "{path} -> {resolved:?}");
        }
    }

    #[test]
    fn test_resolve_rejects_nul() {
        let sandbox = Sandbox::new("/home/richard");
        assert!(matches!(
            sandbox.resolve("test\0file.txt"),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_to_logical() {
        let sandbox = Sandbox::new("/home/richard");
        assert_eq!(
            sandbox.to_logical(Path::new("/home/richard/a/b")).as_deref(),
            Some("/a/b")
        );
        assert_eq!(
            sandbox.to_logical(Path::new("/home/richard")).as_deref(),
            Some("/")
        );
        assert_eq!(sandbox.to_logical(Path::new("/etc/passwd")), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_checked_blocks_symlink_escape() {
        let outside = tempfile::TempDir::new().unwrap();
        let home = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), home.path().join("escape")).unwrap();

        let sandbox = Sandbox::new(home.path());
        let err = sandbox.resolve_checked("/escape/secret", true).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        // lstat of the link itself is allowed: the parent is the home.
        assert!(sandbox.resolve_checked("/escape", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_checked_allows_missing_leaf() {
        let home = tempfile::TempDir::new().unwrap();
        let sandbox = Sandbox::new(home.path());
        let path = sandbox.resolve_checked("/new/dir/file.txt", true).await.unwrap();
        assert_eq!(path, home.path().join("new/dir/file.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_checked_blocks_dangling_symlink() {
        let outside = tempfile::TempDir::new().unwrap();
        let home = tempfile::TempDir::new().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("pwned"),
            home.path().join("link"),
        )
        .unwrap();
        // Relative and chained: hop -> link -> outside.
        std::os::unix::fs::symlink("link", home.path().join("hop")).unwrap();

        let sandbox = Sandbox::new(home.path());
        for path in ["/link", "/hop"] {
            let err = sandbox.resolve_checked(path, true).await.unwrap_err();
            assert!(matches!(err, Error::PermissionDenied(_)), "{path}");
        }
        // Not following the final link is still fine.
        assert!(sandbox.resolve_checked("/link", false).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_checked_allows_dangling_symlink_inside() {
        let home = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(home.path().join("data")).unwrap();
        std::os::unix::fs::symlink("data/later.txt", home.path().join("pending")).unwrap();

        let sandbox = Sandbox::new(home.path());
        assert!(sandbox.resolve_checked("/pending", true).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_checked_relative_escape_through_dotdot() {
        let outside = tempfile::TempDir::new().unwrap();
        let home = tempfile::TempDir::new().unwrap();
        let target = format!(
            "{}/../../../../../..{}/new.txt",
            home.path().display(),
            outside.path().display()
        );
        std::os::unix::fs::symlink(target, home.path().join("up")).unwrap();

        let sandbox = Sandbox::new(home.path());
        assert!(sandbox.resolve_checked("/up", true).await.is_err());
    }
}
