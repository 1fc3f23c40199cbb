//! SFTP subsystem session
//!
//! Reads length-prefixed SFTP packets from the subsystem channel, dispatches
//! them to a [`FileAccessHandler`] and writes the replies back. One session
//! owns its handle table; nothing is shared with other sessions.
//!
//! NIST 800-53: SI-11 (Error Handling), AC-12 (Session Termination)

use crate::filesystem::{FileAccessHandler, FsResult, OpenFileHandle};
use crate::protocol::{codec, DirEntry, FileAttrs, MessageType, OpenFlags, StatusCode, SFTP_VERSION};
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Largest packet accepted from the peer (a full-size WRITE plus headers)
pub const MAX_PACKET_LEN: u32 = 256 * 1024 + 1024;

/// Open handles allowed per session
pub const MAX_HANDLES: usize = 1024;

/// Entries per READDIR reply
const READDIR_BATCH: usize = 100;

enum Handle {
    File(OpenFileHandle),
    Dir(DirListing),
}

/// Snapshot of a directory taken at OPENDIR
struct DirListing {
    entries: Vec<DirEntry>,
    position: usize,
}

/// State of one SFTP subsystem channel
pub struct SftpSession<H> {
    handler: H,
    user: String,
    handles: HashMap<u32, Handle>,
    next_handle_id: u32,
    initialized: bool,
}

impl<H: FileAccessHandler> SftpSession<H> {
    /// Session serving `user` through `handler`; waits for INIT first
    pub fn new(handler: H, user: impl Into<String>) -> Self {
        Self {
            handler,
            user: user.into(),
            handles: HashMap::new(),
            next_handle_id: 0,
            initialized: false,
        }
    }

    /// Serve requests until the peer closes the stream.
    ///
    /// # Errors
    ///
    /// Returns an error only for framing problems or a broken stream; every
    /// per-request failure is answered with a STATUS reply instead.
    pub async fn run<S>(mut self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(event = "sftp_session_start", user = %self.user, "SFTP session started");

        loop {
            let len = match stream.read_u32().await {
                Ok(len) => len,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            if len == 0 || len > MAX_PACKET_LEN {
                warn!(user = %self.user, len, "Rejecting SFTP packet with invalid length");
                return Err(Error::Protocol(format!("Invalid packet length: {len}")));
            }

            let mut packet = vec![0u8; len as usize];
            stream.read_exact(&mut packet).await?;

            let response = self.handle_packet(&packet).await?;

            let mut framed = BytesMut::with_capacity(response.len() + 4);
            #[allow(clippy::cast_possible_truncation)]
            framed.put_u32(response.len() as u32);
            framed.put_slice(&response);
            stream.write_all(&framed).await?;
            stream.flush().await?;
        }

        info!(
            event = "sftp_session_end",
            user = %self.user,
            open_handles = self.handles.len(),
            "SFTP session ended"
        );
        Ok(())
    }

    /// Handle one packet (without its length prefix) and build the reply
    ///
    /// # Errors
    ///
    /// An empty packet or a malformed INIT or request id is a protocol error
    /// that ends the session; a malformed request body is answered with
    /// `BadMessage`.
    pub async fn handle_packet(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let Some((&kind, mut buf)) = data.split_first() else {
            return Err(Error::Protocol("Empty packet".into()));
        };

        if kind == MessageType::Init as u8 {
            let version = codec::get_u32(&mut buf)?;
            info!(user = %self.user, client_version = version, "SFTP init");
            self.initialized = true;

            let mut response = BytesMut::new();
            response.put_u8(MessageType::Version as u8);
            response.put_u32(SFTP_VERSION);
            return Ok(response.to_vec());
        }

        let request_id = codec::get_u32(&mut buf)?;

        if !self.initialized {
            warn!(user = %self.user, kind, "Request before SFTP init");
            return Ok(status(request_id, StatusCode::Failure, "Session not initialized"));
        }

        let Ok(msg_type) = MessageType::try_from(kind) else {
            debug!(user = %self.user, kind, "Unknown SFTP message type");
            return Ok(status_code(request_id, StatusCode::OpUnsupported));
        };

        debug!(user = %self.user, request_id, ?msg_type, "SFTP request");

        // A body that does not decode spoils only this request.
        match self.dispatch(request_id, msg_type, buf).await {
            Err(Error::Protocol(reason)) => {
                warn!(user = %self.user, request_id, ?msg_type, %reason, "Malformed SFTP request");
                Ok(status(request_id, StatusCode::BadMessage, "Malformed request"))
            }
            other => other,
        }
    }

    async fn dispatch(
        &mut self,
        request_id: u32,
        msg_type: MessageType,
        mut buf: &[u8],
    ) -> Result<Vec<u8>> {
        let reply = match msg_type {
            MessageType::Open => self.handle_open(request_id, &mut buf).await?,
            MessageType::Close => self.handle_close(request_id, &mut buf)?,
            MessageType::Read => self.handle_read(request_id, &mut buf).await?,
            MessageType::Write => self.handle_write(request_id, &mut buf).await?,
            MessageType::Lstat => {
                let path = codec::get_string(&mut buf)?;
                attrs_reply(request_id, self.handler.lstat(&path).await)
            }
            MessageType::Stat => {
                let path = codec::get_string(&mut buf)?;
                attrs_reply(request_id, self.handler.stat(&path).await)
            }
            MessageType::Fstat => self.handle_fstat(request_id, &mut buf).await?,
            MessageType::Setstat => {
                let path = codec::get_string(&mut buf)?;
                let attrs = FileAttrs::decode(&mut buf)?;
                unit_reply(request_id, self.handler.chattr(&path, &attrs).await)
            }
            MessageType::Opendir => self.handle_opendir(request_id, &mut buf).await?,
            MessageType::Readdir => self.handle_readdir(request_id, &mut buf)?,
            MessageType::Remove => {
                let path = codec::get_string(&mut buf)?;
                unit_reply(request_id, self.handler.remove(&path).await)
            }
            MessageType::Mkdir => {
                let path = codec::get_string(&mut buf)?;
                let attrs = FileAttrs::decode(&mut buf)?;
                unit_reply(request_id, self.handler.mkdir(&path, &attrs).await)
            }
            MessageType::Rmdir => {
                let path = codec::get_string(&mut buf)?;
                unit_reply(request_id, self.handler.rmdir(&path).await)
            }
            MessageType::Realpath => {
                let path = codec::get_string(&mut buf)?;
                match self.handler.realpath(&path).await {
                    Ok(real) => name_reply(request_id, &[DirEntry::new(real, FileAttrs::default())]),
                    Err(code) => status_code(request_id, code),
                }
            }
            MessageType::Rename => {
                let old_path = codec::get_string(&mut buf)?;
                let new_path = codec::get_string(&mut buf)?;
                unit_reply(request_id, self.handler.rename(&old_path, &new_path).await)
            }
            MessageType::Readlink => {
                let path = codec::get_string(&mut buf)?;
                match self.handler.readlink(&path).await {
                    Ok(target) => {
                        name_reply(request_id, &[DirEntry::new(target, FileAttrs::default())])
                    }
                    Err(code) => status_code(request_id, code),
                }
            }
            MessageType::Symlink => {
                // OpenSSH sends (target, link), swapped relative to the draft.
                let target_path = codec::get_string(&mut buf)?;
                let link_path = codec::get_string(&mut buf)?;
                unit_reply(request_id, self.handler.symlink(&target_path, &link_path).await)
            }
            // Handle based attribute changes are not offered.
            MessageType::Fsetstat | MessageType::Extended => {
                let err = Error::NotSupported(format!("{msg_type:?}").to_lowercase());
                debug!(user = %self.user, "{}", err);
                status(request_id, err.to_status_code(), &err.sanitized_message())
            }
            other => {
                warn!(user = %self.user, ?other, "Unexpected SFTP message from client");
                status_code(request_id, StatusCode::BadMessage)
            }
        };

        Ok(reply)
    }

    async fn handle_open(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let filename = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let attrs = FileAttrs::decode(buf)?;

        if self.handles.len() >= MAX_HANDLES {
            let err = Error::ResourceExhaustion(format!("more than {MAX_HANDLES} open handles"));
            warn!(user = %self.user, "{}", err);
            return Ok(status(request_id, err.to_status_code(), &err.sanitized_message()));
        }

        Ok(match self.handler.open(&filename, flags, &attrs).await {
            Ok(file) => {
                let id = self.allocate_handle(Handle::File(file));
                handle_reply(request_id, id)
            }
            Err(code) => status_code(request_id, code),
        })
    }

    fn handle_close(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;

        Ok(match decode_handle(&handle).and_then(|id| self.handles.remove(&id)) {
            Some(_) => status_code(request_id, StatusCode::Ok),
            None => invalid_handle(request_id, &handle),
        })
    }

    async fn handle_read(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?;

        let Some(Handle::File(file)) = decode_handle(&handle).and_then(|id| self.handles.get_mut(&id))
        else {
            return Ok(invalid_handle(request_id, &handle));
        };

        Ok(match file.read(offset, len).await {
            Ok(data) if data.is_empty() => status_code(request_id, StatusCode::Eof),
            Ok(data) => {
                let mut response = BytesMut::new();
                response.put_u8(MessageType::Data as u8);
                response.put_u32(request_id);
                codec::put_bytes(&mut response, &data);
                response.to_vec()
            }
            Err(code) => status_code(request_id, code),
        })
    }

    async fn handle_write(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        let Some(Handle::File(file)) = decode_handle(&handle).and_then(|id| self.handles.get_mut(&id))
        else {
            return Ok(invalid_handle(request_id, &handle));
        };

        Ok(unit_reply(request_id, file.write(offset, &data).await))
    }

    async fn handle_fstat(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;

        let Some(Handle::File(file)) = decode_handle(&handle).and_then(|id| self.handles.get(&id))
        else {
            return Ok(invalid_handle(request_id, &handle));
        };

        Ok(attrs_reply(request_id, file.stat().await))
    }

    async fn handle_opendir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let path = codec::get_string(buf)?;

        if self.handles.len() >= MAX_HANDLES {
            return Ok(status_code(request_id, StatusCode::Failure));
        }

        Ok(match self.handler.list_folder(&path).await {
            Ok(entries) => {
                let id = self.allocate_handle(Handle::Dir(DirListing {
                    entries,
                    position: 0,
                }));
                handle_reply(request_id, id)
            }
            Err(code) => status_code(request_id, code),
        })
    }

    fn handle_readdir(&mut self, request_id: u32, buf: &mut &[u8]) -> Result<Vec<u8>> {
        let handle = codec::get_bytes(buf)?;

        let Some(Handle::Dir(listing)) = decode_handle(&handle).and_then(|id| self.handles.get_mut(&id))
        else {
            return Ok(invalid_handle(request_id, &handle));
        };

        if listing.position >= listing.entries.len() {
            return Ok(status_code(request_id, StatusCode::Eof));
        }

        let end = (listing.position + READDIR_BATCH).min(listing.entries.len());
        let batch = &listing.entries[listing.position..end];
        listing.position = end;

        Ok(name_reply(request_id, batch))
    }

    fn allocate_handle(&mut self, handle: Handle) -> u32 {
        let id = self.next_handle_id;
        self.next_handle_id = self.next_handle_id.wrapping_add(1);
        self.handles.insert(id, handle);
        id
    }
}

impl<H> Drop for SftpSession<H> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            debug!(
                user = %self.user,
                "Cleaning up {} open handles on session end",
                self.handles.len()
            );
        }
    }
}

fn decode_handle(raw: &[u8]) -> Option<u32> {
    <[u8; 4]>::try_from(raw).ok().map(u32::from_be_bytes)
}

fn status(request_id: u32, code: StatusCode, msg: &str) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Status as u8);
    response.put_u32(request_id);
    response.put_u32(code.into());
    codec::put_string(&mut response, msg);
    codec::put_string(&mut response, "en");
    response.to_vec()
}

fn status_code(request_id: u32, code: StatusCode) -> Vec<u8> {
    status(request_id, code, code.message())
}

fn invalid_handle(request_id: u32, raw: &[u8]) -> Vec<u8> {
    let err = Error::InvalidHandle(format!("{raw:02x?}"));
    debug!(request_id, "{}", err);
    status(request_id, err.to_status_code(), "Invalid handle")
}

fn unit_reply(request_id: u32, result: FsResult<()>) -> Vec<u8> {
    status_code(request_id, result.err().unwrap_or(StatusCode::Ok))
}

fn handle_reply(request_id: u32, id: u32) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Handle as u8);
    response.put_u32(request_id);
    codec::put_bytes(&mut response, &id.to_be_bytes());
    response.to_vec()
}

fn attrs_reply(request_id: u32, result: FsResult<FileAttrs>) -> Vec<u8> {
    match result {
        Ok(attrs) => {
            let mut response = BytesMut::new();
            response.put_u8(MessageType::Attrs as u8);
            response.put_u32(request_id);
            response.put(attrs.encode());
            response.to_vec()
        }
        Err(code) => status_code(request_id, code),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn name_reply(request_id: u32, entries: &[DirEntry]) -> Vec<u8> {
    let mut response = BytesMut::new();
    response.put_u8(MessageType::Name as u8);
    response.put_u32(request_id);
    response.put_u32(entries.len() as u32);
    for entry in entries {
        entry.encode_into(&mut response);
    }
    response.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MutationPolicy;
    use crate::filesystem::SandboxFs;
    use crate::registry::CustomerRecord;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn session() -> (SftpSession<SandboxFs>, TempDir) {
        let home = TempDir::new().unwrap();
        let customer = Arc::new(CustomerRecord::new("richard", home.path(), home.path().join("key.pub")));
        let fs = SandboxFs::new(customer, MutationPolicy::Inert);
        (SftpSession::new(fs, "richard"), home)
    }

    fn request(kind: MessageType, request_id: u32, body: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        let mut packet = BytesMut::new();
        packet.put_u8(kind as u8);
        packet.put_u32(request_id);
        body(&mut packet);
        packet.to_vec()
    }

    fn init() -> Vec<u8> {
        vec![MessageType::Init as u8, 0, 0, 0, 3]
    }

    fn status_of(reply: &[u8]) -> StatusCode {
        assert_eq!(reply[0], MessageType::Status as u8);
        let mut buf = &reply[5..];
        let code = codec::get_u32(&mut buf).unwrap();
        [
            StatusCode::Ok,
            StatusCode::Eof,
            StatusCode::NoSuchFile,
            StatusCode::PermissionDenied,
            StatusCode::Failure,
            StatusCode::BadMessage,
            StatusCode::NoConnection,
            StatusCode::ConnectionLost,
            StatusCode::OpUnsupported,
        ][code as usize]
    }

    fn handle_of(reply: &[u8]) -> Vec<u8> {
        assert_eq!(reply[0], MessageType::Handle as u8);
        let mut buf = &reply[5..];
        codec::get_bytes(&mut buf).unwrap()
    }

    #[tokio::test]
    async fn test_init_replies_version_3() {
        let (mut session, _home) = session();
        let reply = session.handle_packet(&init()).await.unwrap();
        assert_eq!(reply, vec![MessageType::Version as u8, 0, 0, 0, 3]);
    }

    #[tokio::test]
    async fn test_requests_before_init_fail() {
        let (mut session, _home) = session();
        let stat = request(MessageType::Stat, 7, |b| codec::put_string(b, "/"));
        let reply = session.handle_packet(&stat).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::Failure);
        assert_eq!(&reply[1..5], &7u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_unsupported_requests() {
        let (mut session, _home) = session();
        session.handle_packet(&init()).await.unwrap();

        let fsetstat = request(MessageType::Fsetstat, 1, |b| {
            codec::put_bytes(b, &0u32.to_be_bytes());
            b.put_u32(0);
        });
        let reply = session.handle_packet(&fsetstat).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::OpUnsupported);

        let unknown = vec![250, 0, 0, 0, 2];
        let reply = session.handle_packet(&unknown).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::OpUnsupported);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_message() {
        let (mut session, _home) = session();
        session.handle_packet(&init()).await.unwrap();

        let lstat = request(MessageType::Lstat, 4, |b| codec::put_bytes(b, b"\xff\xfe"));
        let reply = session.handle_packet(&lstat).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::BadMessage);
        assert_eq!(&reply[1..5], &4u32.to_be_bytes());

        let truncated = request(MessageType::Read, 5, |b| b.put_u32(2));
        let reply = session.handle_packet(&truncated).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::BadMessage);
    }

    #[tokio::test]
    async fn test_close_unknown_handle() {
        let (mut session, _home) = session();
        session.handle_packet(&init()).await.unwrap();
        let close = request(MessageType::Close, 3, |b| codec::put_bytes(b, b"nope"));
        let reply = session.handle_packet(&close).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::Failure);
    }

    #[tokio::test]
    async fn test_file_handle_lifecycle() {
        let (mut session, home) = session();
        session.handle_packet(&init()).await.unwrap();

        let open = request(MessageType::Open, 1, |b| {
            codec::put_string(b, "/notes.txt");
            b.put_u32(OpenFlags::WRITE | OpenFlags::CREAT);
            b.put_u32(0);
        });
        let handle = handle_of(&session.handle_packet(&open).await.unwrap());

        let write = request(MessageType::Write, 2, |b| {
            codec::put_bytes(b, &handle);
            b.put_u64(0);
            codec::put_bytes(b, b"hello");
        });
        let reply = session.handle_packet(&write).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::Ok);

        let close = request(MessageType::Close, 3, |b| codec::put_bytes(b, &handle));
        assert_eq!(status_of(&session.handle_packet(&close).await.unwrap()), StatusCode::Ok);
        // A closed handle is gone.
        assert_eq!(status_of(&session.handle_packet(&close).await.unwrap()), StatusCode::Failure);

        assert_eq!(std::fs::read(home.path().join("notes.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_read_past_end_is_eof() {
        let (mut session, home) = session();
        std::fs::write(home.path().join("small"), b"abc").unwrap();
        session.handle_packet(&init()).await.unwrap();

        let open = request(MessageType::Open, 1, |b| {
            codec::put_string(b, "small");
            b.put_u32(OpenFlags::READ);
            b.put_u32(0);
        });
        let handle = handle_of(&session.handle_packet(&open).await.unwrap());

        let read = |offset: u64| {
            request(MessageType::Read, 2, |b| {
                codec::put_bytes(b, &handle);
                b.put_u64(offset);
                b.put_u32(1024);
            })
        };

        let reply = session.handle_packet(&read(0)).await.unwrap();
        assert_eq!(reply[0], MessageType::Data as u8);
        let mut buf = &reply[5..];
        assert_eq!(codec::get_bytes(&mut buf).unwrap(), b"abc");

        let reply = session.handle_packet(&read(3)).await.unwrap();
        assert_eq!(status_of(&reply), StatusCode::Eof);
    }

    #[tokio::test]
    async fn test_readdir_batches_then_eof() {
        let (mut session, home) = session();
        for i in 0..150 {
            std::fs::write(home.path().join(format!("f{i:03}")), b"").unwrap();
        }
        session.handle_packet(&init()).await.unwrap();

        let opendir = request(MessageType::Opendir, 1, |b| codec::put_string(b, "/"));
        let handle = handle_of(&session.handle_packet(&opendir).await.unwrap());
        let readdir = request(MessageType::Readdir, 2, |b| codec::put_bytes(b, &handle));

        let mut total = 0;
        loop {
            let reply = session.handle_packet(&readdir).await.unwrap();
            if reply[0] == MessageType::Status as u8 {
                assert_eq!(status_of(&reply), StatusCode::Eof);
                break;
            }
            assert_eq!(reply[0], MessageType::Name as u8);
            let mut buf = &reply[5..];
            let count = codec::get_u32(&mut buf).unwrap() as usize;
            assert!(count <= READDIR_BATCH);
            total += count;
        }
        assert_eq!(total, 150);
    }

    #[tokio::test]
    async fn test_run_over_duplex() {
        let (session, _home) = session();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(session.run(server));

        let packet = init();
        client.write_u32(packet.len() as u32).await.unwrap();
        client.write_all(&packet).await.unwrap();

        let len = client.read_u32().await.unwrap();
        let mut reply = vec![0u8; len as usize];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], MessageType::Version as u8);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_rejects_oversized_packet() {
        let (session, _home) = session();
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(session.run(server));

        client.write_u32(MAX_PACKET_LEN + 1).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
    }
}
