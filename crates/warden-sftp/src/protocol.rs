//! SFTP Protocol Implementation
//!
//! Wire-level pieces of the SSH File Transfer Protocol as defined in
//! draft-ietf-secsh-filexfer-02 (protocol version 3), which is what OpenSSH
//! and most clients speak. Only encoding lives here; request semantics are in
//! [`crate::sftp`] and [`crate::filesystem`].

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use std::io;

/// SFTP Protocol Version
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initialize SFTP session
    Init = 1,
    /// Server version reply
    Version = 2,
    /// Open file
    Open = 3,
    /// Close handle
    Close = 4,
    /// Read from file
    Read = 5,
    /// Write to file
    Write = 6,
    /// Stat without following a final symlink
    Lstat = 7,
    /// Stat an open handle
    Fstat = 8,
    /// Set attributes by path
    Setstat = 9,
    /// Set attributes by handle
    Fsetstat = 10,
    /// Open directory
    Opendir = 11,
    /// Read directory entries
    Readdir = 12,
    /// Remove file
    Remove = 13,
    /// Create directory
    Mkdir = 14,
    /// Remove directory
    Rmdir = 15,
    /// Canonicalize path
    Realpath = 16,
    /// Stat following symlinks
    Stat = 17,
    /// Rename file
    Rename = 18,
    /// Read symlink target
    Readlink = 19,
    /// Create symlink
    Symlink = 20,
    /// Status reply
    Status = 101,
    /// Handle reply
    Handle = 102,
    /// Data reply
    Data = 103,
    /// Name reply
    Name = 104,
    /// Attributes reply
    Attrs = 105,
    /// Vendor extension request
    Extended = 200,
    /// Vendor extension reply
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let msg = match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::Readlink,
            20 => Self::Symlink,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            201 => Self::ExtendedReply,
            _ => {
                return Err(crate::Error::Protocol(format!(
                    "Unknown message type: {value}"
                )))
            }
        };
        Ok(msg)
    }
}

/// SFTP status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// End of file
    Eof = 1,
    /// No such file or directory
    NoSuchFile = 2,
    /// Permission denied
    PermissionDenied = 3,
    /// Generic failure
    Failure = 4,
    /// Malformed packet
    BadMessage = 5,
    /// No connection
    NoConnection = 6,
    /// Connection lost
    ConnectionLost = 7,
    /// Operation not supported
    OpUnsupported = 8,
}

impl StatusCode {
    /// Translate an OS error into the status code the peer sees.
    ///
    /// `EACCES`/`EPERM` become permission denied, `ENOENT`/`ENOTDIR` become
    /// no such file, everything else is a generic failure.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EACCES | libc::EPERM) => Self::PermissionDenied,
            Some(libc::ENOENT | libc::ENOTDIR) => Self::NoSuchFile,
            Some(_) => Self::Failure,
            None => match err.kind() {
                io::ErrorKind::NotFound => Self::NoSuchFile,
                io::ErrorKind::PermissionDenied => Self::PermissionDenied,
                _ => Self::Failure,
            },
        }
    }

    /// Default human readable message for a STATUS reply
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation unsupported",
        }
    }
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> Self {
        code as Self
    }
}

impl From<io::Error> for StatusCode {
    fn from(err: io::Error) -> Self {
        Self::from_io_error(&err)
    }
}

/// File open flags (SSH_FXF_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading
    pub const READ: u32 = 0x0000_0001;
    /// Open for writing
    pub const WRITE: u32 = 0x0000_0002;
    /// Writes go to the end of the file
    pub const APPEND: u32 = 0x0000_0004;
    /// Create the file if missing
    pub const CREAT: u32 = 0x0000_0008;
    /// Truncate an existing file
    pub const TRUNC: u32 = 0x0000_0010;
    /// With `CREAT`, fail if the file exists
    pub const EXCL: u32 = 0x0000_0020;

    /// `READ` is set
    pub const fn has_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    /// `WRITE` is set
    pub const fn has_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// `APPEND` is set
    pub const fn has_append(self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// `CREAT` is set
    pub const fn has_creat(self) -> bool {
        self.0 & Self::CREAT != 0
    }

    /// `TRUNC` is set
    pub const fn has_trunc(self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// `EXCL` is set
    pub const fn has_excl(self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// File attributes (ATTRS structure, version 3)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// File size in bytes
    pub size: Option<u64>,
    /// Owner user id
    pub uid: Option<u32>,
    /// Owner group id
    pub gid: Option<u32>,
    /// Mode bits, file type included
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch
    pub atime: Option<u32>,
    /// Modification time, seconds since the epoch
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;
    const FLAG_EXTENDED: u32 = 0x8000_0000;

    /// Build attributes from `stat` output. The permission field keeps the
    /// file type bits so clients can tell directories from files.
    #[cfg(unix)]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            size: Some(metadata.size()),
            uid: Some(metadata.uid()),
            gid: Some(metadata.gid()),
            permissions: Some(metadata.mode()),
            atime: Some(metadata.atime() as u32),
            mtime: Some(metadata.mtime() as u32),
        }
    }

    /// Build attributes from `stat` output (size and times only).
    #[cfg(not(unix))]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let to_secs = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32)
        };
        let mode = if metadata.is_dir() { 0o040_755 } else { 0o100_644 };

        Self {
            size: Some(metadata.len()),
            uid: None,
            gid: None,
            permissions: Some(mode),
            atime: to_secs(metadata.accessed()),
            mtime: to_secs(metadata.modified()),
        }
    }

    /// Encode file attributes to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    /// Decode file attributes from bytes. Extended attribute pairs are
    /// consumed and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`](crate::Error::Protocol) if the buffer ends
    /// early.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        let flags = codec::get_u32(buf)?;
        let mut attrs = Self::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::get_u64(buf)?);
        }
        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::get_u32(buf)?);
            attrs.gid = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::get_u32(buf)?);
            attrs.mtime = Some(codec::get_u32(buf)?);
        }
        if flags & Self::FLAG_EXTENDED != 0 {
            let count = codec::get_u32(buf)?;
            for _ in 0..count {
                codec::get_bytes(buf)?;
                codec::get_bytes(buf)?;
            }
        }

        Ok(attrs)
    }

    /// `ls -l` style line used as the `longname` of NAME entries
    pub fn long_name(&self, filename: &str) -> String {
        let mode = self.permissions.unwrap_or(0);
        let mtime = i64::from(self.mtime.unwrap_or(0));
        let date = DateTime::<Utc>::from_timestamp(mtime, 0).map_or_else(String::new, |t| {
            let six_months = 60 * 60 * 24 * 182;
            if (Utc::now().timestamp() - mtime).abs() > six_months {
                t.format("%d %b %Y").to_string()
            } else {
                t.format("%d %b %H:%M").to_string()
            }
        });

        format!(
            "{}   1 {:<8} {:<8} {:>8} {:<12} {}",
            mode_string(mode),
            self.uid.unwrap_or(0),
            self.gid.unwrap_or(0),
            self.size.unwrap_or(0),
            date,
            filename
        )
    }
}

fn mode_string(mode: u32) -> String {
    let kind = match mode & 0o170_000 {
        0o040_000 => 'd',
        0o120_000 => 'l',
        0o020_000 => 'c',
        0o060_000 => 'b',
        0o010_000 => 'p',
        0o140_000 => 's',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// One entry of a NAME response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name relative to the listed directory
    pub filename: String,
    /// Attributes of the entry
    pub attrs: FileAttrs,
}

impl DirEntry {
    /// Entry named `filename`
    pub fn new(filename: impl Into<String>, attrs: FileAttrs) -> Self {
        Self {
            filename: filename.into(),
            attrs,
        }
    }

    /// Append `filename`, `longname` and `attrs` to a NAME response body
    pub fn encode_into(&self, buf: &mut BytesMut) {
        codec::put_string(buf, &self.filename);
        codec::put_string(buf, &self.attrs.long_name(&self.filename));
        buf.put(self.attrs.encode());
    }
}

/// Helper functions for encoding/decoding SFTP protocol primitives
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    /// Encode a string as SFTP string (length + data)
    #[allow(clippy::cast_possible_truncation)]
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode an SFTP string
    ///
    /// # Errors
    ///
    /// Truncated input or bytes that are not UTF-8 give
    /// [`Error::Protocol`](crate::Error::Protocol).
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::Protocol(format!("Invalid UTF-8 string: {e}")))
    }

    /// Encode bytes as SFTP string (length + data)
    #[allow(clippy::cast_possible_truncation)]
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode SFTP bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`](crate::Error::Protocol) on truncated input.
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(crate::Error::Protocol("Insufficient data for bytes".into()));
        }

        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }

    /// Decode a big-endian `u32`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`](crate::Error::Protocol) on truncated input.
    pub fn get_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol("Insufficient data for u32".into()));
        }
        Ok(buf.get_u32())
    }

    /// Decode a big-endian `u64`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`](crate::Error::Protocol) on truncated input.
    pub fn get_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        if buf.remaining() < 8 {
            return Err(crate::Error::Protocol("Insufficient data for u64".into()));
        }
        Ok(buf.get_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_errno() {
        let cases = [
            (libc::ENOENT, StatusCode::NoSuchFile),
            (libc::ENOTDIR, StatusCode::NoSuchFile),
            (libc::EACCES, StatusCode::PermissionDenied),
            (libc::EPERM, StatusCode::PermissionDenied),
            (libc::EISDIR, StatusCode::Failure),
            (libc::EEXIST, StatusCode::Failure),
        ];
        for (errno, expected) in cases {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(StatusCode::from_io_error(&err), expected, "errno {errno}");
        }
    }

    #[test]
    fn test_status_from_kind_without_errno() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(StatusCode::from_io_error(&err), StatusCode::NoSuchFile);
        let err = io::Error::new(io::ErrorKind::InvalidInput, "bad flags");
        assert_eq!(StatusCode::from_io_error(&err), StatusCode::Failure);
    }

    #[test]
    fn test_attrs_decode_skips_extended() {
        let mut raw = BytesMut::new();
        raw.put_u32(FileAttrs::FLAG_PERMISSIONS | FileAttrs::FLAG_EXTENDED);
        raw.put_u32(0o600);
        raw.put_u32(1);
        codec::put_string(&mut raw, "vendor@example.com");
        codec::put_string(&mut raw, "value");
        raw.put_u8(0xff);

        let mut buf = &raw[..];
        let attrs = FileAttrs::decode(&mut buf).unwrap();
        assert_eq!(attrs.permissions, Some(0o600));
        assert_eq!(attrs.size, None);
        assert_eq!(buf, &[0xff]);
    }

    #[test]
    fn test_attrs_decode_truncated() {
        let raw = [0u8, 0, 0, 1, 0, 0];
        let mut buf = &raw[..];
        assert!(FileAttrs::decode(&mut buf).is_err());
    }

    #[test]
    fn test_long_name_formats_mode() {
        let attrs = FileAttrs {
            size: Some(42),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o040_750),
            atime: Some(0),
            mtime: Some(0),
        };
        let line = attrs.long_name("uploads");
        assert!(line.starts_with("drwxr-x---"), "{line}");
        assert!(line.ends_with(" uploads"), "{line}");
        assert!(line.contains("01 Jan 1970"), "{line}");
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC);
        assert!(flags.has_write());
        assert!(flags.has_creat());
        assert!(flags.has_trunc());
        assert!(!flags.has_read());
        assert!(!flags.has_append());
        assert!(!flags.has_excl());
    }
}
