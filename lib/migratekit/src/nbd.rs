// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A small NBD client for reading disk extents from the block server.
//!
//! Only the pieces the delta driver needs are implemented: the
//! fixed-newstyle handshake, `NBD_OPT_GO` on the default export, and
//! `NBD_CMD_READ` with simple replies, all over a Unix-domain socket.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

// Handshake magics ("NBDMAGIC", "IHAVEOPT") and the reply magic.
const NBDMAGIC: u64 = 0x4e42444d41474943;
const IHAVEOPT: u64 = 0x49484156454f5054;
const OPTION_REPLY_MAGIC: u64 = 0x3e889045565a9;

const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;

const NBD_OPT_GO: u32 = 7;
const NBD_REP_ACK: u32 = 1;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
const NBD_INFO_EXPORT: u16 = 0;

const REQUEST_MAGIC: u32 = 0x25609513;
const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_DISC: u16 = 2;

#[derive(Debug, Error)]
pub enum NbdError {
    #[error("not an NBD export URI: {0}")]
    InvalidUri(String),

    #[error("unexpected magic {got:#x} during {phase}")]
    BadMagic { phase: &'static str, got: u64 },

    #[error("server does not speak fixed-newstyle negotiation")]
    OldstyleServer,

    #[error("option negotiation rejected (reply type {0:#x})")]
    OptionRejected(u32),

    #[error("read at offset {offset} failed with NBD error {errno}")]
    ReadError { offset: u64, errno: u32 },

    #[error("reply handle mismatch (sent {sent}, got {got})")]
    HandleMismatch { sent: u64, got: u64 },

    #[error("I/O error on NBD socket")]
    Io(#[from] std::io::Error),
}

/// Extracts the socket path from a `nbd+unix:///?socket=<path>` URI, the
/// only export addressing the block server hands out.
pub fn socket_path(uri: &str) -> Result<Utf8PathBuf, NbdError> {
    let invalid = || NbdError::InvalidUri(uri.to_string());
    let rest = uri.strip_prefix("nbd+unix://").ok_or_else(invalid)?;
    let (_, query) = rest.split_once('?').ok_or_else(invalid)?;
    query
        .split('&')
        .find_map(|kv| kv.strip_prefix("socket="))
        .filter(|path| !path.is_empty())
        .map(Utf8PathBuf::from)
        .ok_or_else(invalid)
}

/// A connected transmission-phase NBD client.
pub struct Client {
    stream: UnixStream,
    export_size: u64,
    next_handle: u64,
}

impl Client {
    /// Connects to an export URI and completes the handshake.
    pub async fn connect_uri(uri: &str) -> Result<Self, NbdError> {
        Self::connect(&socket_path(uri)?).await
    }

    pub async fn connect(path: &Utf8Path) -> Result<Self, NbdError> {
        let mut stream = UnixStream::connect(path).await?;
        let export_size = handshake(&mut stream).await?;
        Ok(Self { stream, export_size, next_handle: 1 })
    }

    /// Size of the negotiated export in bytes.
    pub fn size(&self) -> u64 {
        self.export_size
    }

    /// Reads exactly `buf.len()` bytes at `offset` into `buf`.
    pub async fn pread(
        &mut self,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), NbdError> {
        let handle = self.next_handle;
        self.next_handle += 1;

        self.stream.write_u32(REQUEST_MAGIC).await?;
        self.stream.write_u16(0).await?; // command flags
        self.stream.write_u16(NBD_CMD_READ).await?;
        self.stream.write_u64(handle).await?;
        self.stream.write_u64(offset).await?;
        self.stream.write_u32(buf.len() as u32).await?;

        let magic = self.stream.read_u32().await?;
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(NbdError::BadMagic {
                phase: "read reply",
                got: magic as u64,
            });
        }
        let errno = self.stream.read_u32().await?;
        let got = self.stream.read_u64().await?;
        if got != handle {
            return Err(NbdError::HandleMismatch { sent: handle, got });
        }
        if errno != 0 {
            return Err(NbdError::ReadError { offset, errno });
        }
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    /// Sends a soft disconnect. The server is free to drop the socket
    /// without replying.
    pub async fn shutdown(mut self) -> Result<(), NbdError> {
        self.stream.write_u32(REQUEST_MAGIC).await?;
        self.stream.write_u16(0).await?;
        self.stream.write_u16(NBD_CMD_DISC).await?;
        self.stream.write_u64(self.next_handle).await?;
        self.stream.write_u64(0).await?;
        self.stream.write_u32(0).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Fixed-newstyle negotiation against the default (empty-named) export.
/// Returns the export size announced in the `NBD_INFO_EXPORT` block.
async fn handshake<S>(stream: &mut S) -> Result<u64, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let magic = stream.read_u64().await?;
    if magic != NBDMAGIC {
        return Err(NbdError::BadMagic { phase: "greeting", got: magic });
    }
    let magic = stream.read_u64().await?;
    if magic != IHAVEOPT {
        return Err(NbdError::BadMagic { phase: "greeting", got: magic });
    }
    let handshake_flags = stream.read_u16().await?;
    if handshake_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(NbdError::OldstyleServer);
    }
    stream.write_u32(NBD_FLAG_C_FIXED_NEWSTYLE).await?;

    // NBD_OPT_GO with an empty export name and no extra info requests.
    stream.write_u64(IHAVEOPT).await?;
    stream.write_u32(NBD_OPT_GO).await?;
    stream.write_u32(4 + 2).await?;
    stream.write_u32(0).await?; // export name length
    stream.write_u16(0).await?; // info request count

    let mut export_size = None;
    loop {
        let magic = stream.read_u64().await?;
        if magic != OPTION_REPLY_MAGIC {
            return Err(NbdError::BadMagic { phase: "option reply", got: magic });
        }
        let _option = stream.read_u32().await?;
        let reply_type = stream.read_u32().await?;
        let length = stream.read_u32().await? as usize;
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;

        if reply_type & NBD_REP_FLAG_ERROR != 0 {
            return Err(NbdError::OptionRejected(reply_type));
        }
        match reply_type {
            NBD_REP_INFO => {
                if length >= 12 {
                    let info =
                        u16::from_be_bytes([payload[0], payload[1]]);
                    if info == NBD_INFO_EXPORT {
                        export_size = Some(u64::from_be_bytes(
                            payload[2..10].try_into().unwrap(),
                        ));
                    }
                }
            }
            NBD_REP_ACK => break,
            other => return Err(NbdError::OptionRejected(other)),
        }
    }

    // A conformant server always sends NBD_INFO_EXPORT before the ACK.
    export_size.ok_or(NbdError::OptionRejected(NBD_REP_ACK))
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn parses_export_uris() {
        assert_eq!(
            socket_path("nbd+unix:///?socket=/tmp/scratch/nbdkit.sock")
                .unwrap(),
            Utf8PathBuf::from("/tmp/scratch/nbdkit.sock")
        );
        assert!(socket_path("nbd://127.0.0.1:10809").is_err());
        assert!(socket_path("nbd+unix:///?export=disk").is_err());
        assert!(socket_path("nbd+unix:///?socket=").is_err());
    }

    /// Serves one scripted fixed-newstyle session: handshake, then answers
    /// reads out of `data`, until the client disconnects.
    async fn serve_export(listener: UnixListener, data: Vec<u8>) {
        let (mut sock, _) = listener.accept().await.unwrap();

        sock.write_u64(NBDMAGIC).await.unwrap();
        sock.write_u64(IHAVEOPT).await.unwrap();
        sock.write_u16(NBD_FLAG_FIXED_NEWSTYLE).await.unwrap();

        assert_eq!(sock.read_u32().await.unwrap(), NBD_FLAG_C_FIXED_NEWSTYLE);
        assert_eq!(sock.read_u64().await.unwrap(), IHAVEOPT);
        assert_eq!(sock.read_u32().await.unwrap(), NBD_OPT_GO);
        let opt_len = sock.read_u32().await.unwrap() as usize;
        let mut opt = vec![0u8; opt_len];
        sock.read_exact(&mut opt).await.unwrap();

        // NBD_REP_INFO (export info) followed by NBD_REP_ACK.
        sock.write_u64(OPTION_REPLY_MAGIC).await.unwrap();
        sock.write_u32(NBD_OPT_GO).await.unwrap();
        sock.write_u32(NBD_REP_INFO).await.unwrap();
        sock.write_u32(12).await.unwrap();
        sock.write_u16(NBD_INFO_EXPORT).await.unwrap();
        sock.write_u64(data.len() as u64).await.unwrap();
        sock.write_u16(0).await.unwrap();
        sock.write_u64(OPTION_REPLY_MAGIC).await.unwrap();
        sock.write_u32(NBD_OPT_GO).await.unwrap();
        sock.write_u32(NBD_REP_ACK).await.unwrap();
        sock.write_u32(0).await.unwrap();

        loop {
            assert_eq!(sock.read_u32().await.unwrap(), REQUEST_MAGIC);
            let _flags = sock.read_u16().await.unwrap();
            let cmd = sock.read_u16().await.unwrap();
            let handle = sock.read_u64().await.unwrap();
            let offset = sock.read_u64().await.unwrap() as usize;
            let length = sock.read_u32().await.unwrap() as usize;
            if cmd == NBD_CMD_DISC {
                break;
            }
            assert_eq!(cmd, NBD_CMD_READ);
            sock.write_u32(SIMPLE_REPLY_MAGIC).await.unwrap();
            sock.write_u32(0).await.unwrap();
            sock.write_u64(handle).await.unwrap();
            sock.write_all(&data[offset..offset + length]).await.unwrap();
        }
    }

    #[tokio::test]
    async fn handshake_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nbd.sock"))
            .unwrap();
        let listener = UnixListener::bind(&path).unwrap();

        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let server = tokio::spawn(serve_export(listener, data));

        let mut client = Client::connect(&path).await.unwrap();
        assert_eq!(client.size(), 4096);

        let mut buf = vec![0u8; 512];
        client.pread(&mut buf, 1024).await.unwrap();
        assert_eq!(&buf[..], &expected[1024..1536]);

        let mut buf = vec![0u8; 17];
        client.pread(&mut buf, 4000).await.unwrap();
        assert_eq!(&buf[..], &expected[4000..4017]);

        client.shutdown().await.unwrap();
        server.await.unwrap();
    }
}
