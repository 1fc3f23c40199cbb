//! Sandboxed file access
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-11 (Error Handling)
//! Implementation: Every operation resolves the peer's path inside the
//! customer's home and answers with an SFTP status code on failure, never
//! with a raw OS error.

use crate::config::MutationPolicy;
use crate::protocol::{DirEntry, FileAttrs, OpenFlags, StatusCode};
use crate::registry::CustomerRecord;
use crate::sandbox::{self, Sandbox};
use crate::Error;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Outcome of a file-access operation
pub type FsResult<T> = std::result::Result<T, StatusCode>;

/// Mode for newly created files when the peer sends no permissions
pub const DEFAULT_FILE_MODE: u32 = 0o666;

/// Largest single READ the server will serve
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// Filesystem operations behind the SFTP subsystem
#[async_trait]
pub trait FileAccessHandler: Send + Sync {
    /// Canonical sandbox path for `path` (REALPATH)
    async fn realpath(&self, path: &str) -> FsResult<String>;

    /// Entries of a directory with their attributes
    async fn list_folder(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// Attributes of `path`, following symlinks
    async fn stat(&self, path: &str) -> FsResult<FileAttrs>;

    /// Like [`stat`](Self::stat) but a final symlink is not followed
    async fn lstat(&self, path: &str) -> FsResult<FileAttrs>;

    /// Open or create a file; `attrs` apply only to a newly created file
    async fn open(&self, path: &str, flags: OpenFlags, attrs: &FileAttrs)
        -> FsResult<OpenFileHandle>;

    /// Remove a file
    async fn remove(&self, path: &str) -> FsResult<()>;

    /// Rename without overwriting an existing target
    async fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()>;

    /// Create a directory
    async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> FsResult<()>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &str) -> FsResult<()>;

    /// Change attributes of `path` (SETSTAT)
    async fn chattr(&self, path: &str, attrs: &FileAttrs) -> FsResult<()>;

    /// Create `link_path` pointing at `target_path`
    async fn symlink(&self, target_path: &str, link_path: &str) -> FsResult<()>;

    /// Target of a symlink
    async fn readlink(&self, path: &str) -> FsResult<String>;
}

/// An open file owned by one SFTP session
#[derive(Debug)]
pub struct OpenFileHandle {
    file: fs::File,
    path: PathBuf,
    flags: OpenFlags,
}

impl OpenFileHandle {
    /// Host path the handle was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flags from the OPEN request
    pub const fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Read up to `len` bytes at `offset`. An empty buffer means end of file.
    ///
    /// # Errors
    ///
    /// OS errors are translated with [`StatusCode::from_io_error`].
    pub async fn read(&mut self, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; len.min(MAX_READ_LEN) as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Write `data` at `offset`. Append handles ignore the offset.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> FsResult<()> {
        if !self.flags.has_append() {
            self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Attributes of the open descriptor (fstat), correct even after the
    /// path was renamed or unlinked.
    pub async fn stat(&self) -> FsResult<FileAttrs> {
        let metadata = self.file.metadata().await?;
        Ok(FileAttrs::from_metadata(&metadata))
    }
}

impl Drop for OpenFileHandle {
    fn drop(&mut self) {
        debug!("Closing file handle for {:?}", self.path);
    }
}

/// [`FileAccessHandler`] confined to one customer's home directory
pub struct SandboxFs {
    customer: Arc<CustomerRecord>,
    sandbox: Sandbox,
    mutations: MutationPolicy,
}

impl SandboxFs {
    /// Handler for `customer`, rooted at their home directory
    pub fn new(customer: Arc<CustomerRecord>, mutations: MutationPolicy) -> Self {
        let sandbox = Sandbox::new(customer.home_directory.clone());
        Self {
            customer,
            sandbox,
            mutations,
        }
    }

    /// Customer this handler serves
    pub fn customer(&self) -> &CustomerRecord {
        &self.customer
    }

    /// Sandbox every path goes through
    pub const fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    async fn resolve(&self, path: &str, follow_final: bool) -> FsResult<PathBuf> {
        self.sandbox
            .resolve_checked(path, follow_final)
            .await
            .map_err(|e| self.reject(path, &e))
    }

    fn reject(&self, path: &str, error: &Error) -> StatusCode {
        if error.is_security_event() {
            warn!(
                event = "sandbox_violation",
                user = %self.customer.username,
                path = %path,
                error = %error,
                "Security event during path resolution"
            );
        } else {
            debug!(user = %self.customer.username, path = %path, error = %error, "Path resolution failed");
        }
        error.to_status_code()
    }

    async fn followed_metadata(&self, dir: &str, name: &str) -> Option<std::fs::Metadata> {
        let child = format!("{}/{name}", sandbox::canonicalize(dir));
        let resolved = self.sandbox.resolve_checked(&child, true).await.ok()?;
        fs::metadata(&resolved).await.ok()
    }

    /// `true` when mutations are inert; logs the skipped request
    fn skip_mutation(&self, op: &str, path: &str) -> bool {
        if self.mutations == MutationPolicy::Inert {
            info!(
                event = "mutation_ignored",
                user = %self.customer.username,
                op,
                path = %path,
                "Reporting success without changing the filesystem"
            );
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl FileAccessHandler for SandboxFs {
    async fn realpath(&self, path: &str) -> FsResult<String> {
        if path.contains('\0') {
            return Err(StatusCode::NoSuchFile);
        }
        Ok(sandbox::canonicalize(path))
    }

    async fn list_folder(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let dir = self.resolve(path, true).await?;
        let mut reader = fs::read_dir(&dir).await?;
        let mut entries = Vec::new();

        while let Some(entry) = reader.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                // Such a name could not be sent back in a request.
                debug!(user = %self.customer.username, name = ?entry.file_name(), "Skipping non-UTF-8 entry");
                continue;
            };

            let own = fs::symlink_metadata(entry.path()).await?;
            // Links are followed only while they stay in the sandbox; dangling
            // or escaping ones are listed with their own attributes.
            let metadata = if own.file_type().is_symlink() {
                self.followed_metadata(path, &name).await.unwrap_or(own)
            } else {
                own
            };
            entries.push(DirEntry::new(name, FileAttrs::from_metadata(&metadata)));
        }

        debug!(user = %self.customer.username, path = %path, count = entries.len(), "Listed folder");
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> FsResult<FileAttrs> {
        let resolved = self.resolve(path, true).await?;
        let metadata = fs::metadata(&resolved).await?;
        Ok(FileAttrs::from_metadata(&metadata))
    }

    async fn lstat(&self, path: &str) -> FsResult<FileAttrs> {
        let resolved = self.resolve(path, false).await?;
        let metadata = fs::symlink_metadata(&resolved).await?;
        Ok(FileAttrs::from_metadata(&metadata))
    }

    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: &FileAttrs,
    ) -> FsResult<OpenFileHandle> {
        let resolved = self.resolve(path, true).await?;

        // Files are always binary here; there is no text mode to opt out of.
        let mut options = fs::OpenOptions::new();
        options
            .read(flags.has_read() || !flags.has_write())
            .write(flags.has_write())
            .append(flags.has_append())
            .truncate(flags.has_trunc());
        if flags.has_creat() {
            if flags.has_excl() {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }

        // Explicit permissions go to open(2) and are not reapplied afterwards.
        #[cfg(unix)]
        options.mode(attrs.permissions.map_or(DEFAULT_FILE_MODE, |p| p & 0o7777));

        let file = options.open(&resolved).await.map_err(|e| {
            debug!(user = %self.customer.username, path = ?resolved, error = %e, "Open failed");
            StatusCode::from_io_error(&e)
        })?;

        if flags.has_creat() {
            let rest = FileAttrs {
                permissions: None,
                ..attrs.clone()
            };
            apply_to_file(&file, &rest).await?;
        }

        info!(
            event = "file_opened",
            user = %self.customer.username,
            path = %sandbox::canonicalize(path),
            flags = flags.0,
            "Opened file"
        );

        Ok(OpenFileHandle {
            file,
            path: resolved,
            flags,
        })
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        if self.skip_mutation("remove", path) {
            return Ok(());
        }
        let resolved = self.resolve(path, false).await?;
        fs::remove_file(&resolved).await?;
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        if self.skip_mutation("rename", old_path) {
            return Ok(());
        }
        let from = self.resolve(old_path, false).await?;
        let to = self.resolve(new_path, false).await?;
        if fs::symlink_metadata(&to).await.is_ok() {
            // SFTP v3 rename must not overwrite.
            return Err(StatusCode::Failure);
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str, attrs: &FileAttrs) -> FsResult<()> {
        if self.skip_mutation("mkdir", path) {
            return Ok(());
        }
        let resolved = self.resolve(path, false).await?;
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(attrs.permissions.map_or(0o777, |p| p & 0o7777));
        builder.create(&resolved).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        if self.skip_mutation("rmdir", path) {
            return Ok(());
        }
        let resolved = self.resolve(path, false).await?;
        fs::remove_dir(&resolved).await?;
        Ok(())
    }

    async fn chattr(&self, path: &str, attrs: &FileAttrs) -> FsResult<()> {
        if self.skip_mutation("chattr", path) {
            return Ok(());
        }
        let resolved = self.resolve(path, true).await?;
        apply_to_path(&resolved, attrs).await
    }

    async fn symlink(&self, target_path: &str, link_path: &str) -> FsResult<()> {
        if self.skip_mutation("symlink", link_path) {
            return Ok(());
        }
        let link = self.resolve(link_path, false).await?;
        // Targets are sandbox paths, relative ones taken from the link's
        // directory, and are stored rooted.
        let logical_target = if target_path.starts_with('/') {
            target_path.to_owned()
        } else {
            let link_logical = sandbox::canonicalize(link_path);
            let link_dir = link_logical.rsplit_once('/').map_or("", |(dir, _)| dir);
            format!("{link_dir}/{target_path}")
        };
        let target = self
            .sandbox
            .resolve(&logical_target)
            .map_err(|e| self.reject(target_path, &e))?;
        create_symlink(&target, &link).await
    }

    async fn readlink(&self, _path: &str) -> FsResult<String> {
        // Link targets are never revealed to the peer.
        Err(StatusCode::NoSuchFile)
    }
}

#[cfg(unix)]
async fn create_symlink(target: &Path, link: &Path) -> FsResult<()> {
    fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(_target: &Path, _link: &Path) -> FsResult<()> {
    Err(StatusCode::OpUnsupported)
}

/// Apply size and times to an open file (permissions are handled by open)
async fn apply_to_file(file: &fs::File, attrs: &FileAttrs) -> FsResult<()> {
    if let Some(size) = attrs.size {
        file.set_len(size).await?;
    }
    if let Some(times) = file_times(attrs) {
        let std_file = file.try_clone().await?.into_std().await;
        tokio::task::spawn_blocking(move || std_file.set_times(times))
            .await
            .map_err(|_| StatusCode::Failure)??;
    }
    Ok(())
}

/// Apply permissions, size and times to a path
async fn apply_to_path(path: &Path, attrs: &FileAttrs) -> FsResult<()> {
    #[cfg(unix)]
    if let Some(permissions) = attrs.permissions {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(permissions & 0o7777)).await?;
    }

    if attrs.size.is_some() || file_times(attrs).is_some() {
        let file = fs::OpenOptions::new().write(true).open(path).await?;
        apply_to_file(&file, attrs).await?;
    }

    Ok(())
}

fn file_times(attrs: &FileAttrs) -> Option<std::fs::FileTimes> {
    let (atime, mtime) = (attrs.atime?, attrs.mtime?);
    let at = |secs: u32| UNIX_EPOCH + Duration::from_secs(u64::from(secs));
    Some(
        std::fs::FileTimes::new()
            .set_accessed(at(atime))
            .set_modified(at(mtime)),
    )
}
