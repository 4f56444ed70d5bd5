//! # Message Adapter
//!
//! An in-order, length-delimited byte-message channel over a TCP stream.
//!
//! ## Setup handshake
//!
//! Immediately after connect/accept both sides run a fixed octet-level
//! exchange (public keys are 32 bytes, known a priori):
//!
//! - The **active** side writes its public key, reads the remote key (and
//!   aborts on a mismatch with the expected peer), then writes the remote
//!   address and its own address, each as `u8(len) || bytes`.
//! - The **passive** side reads the remote key, writes its own, then reads
//!   two length-prefixed addresses: the first overrides its notion of its
//!   local address (address auto-discovery behind NAT or rebinding), the
//!   second is the remote's address.
//!
//! ## Framing
//!
//! After setup every message is `varuint(len) || payload` where the length
//! prefix is unsigned LEB128. Frames whose declared length exceeds the
//! configured maximum close the connection without delivering the frame.
//!
//! ## Delivery
//!
//! A single receiver task decodes frames in arrival order into a bounded
//! channel; the channel closing is the end-of-stream signal (EOF, framing
//! error, or [`MessageAdapter::close`]). Writes are serialized internally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace};

use crate::identity::{PublicKey, ID_LEN};

/// Default bound on a single frame's payload (4 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// Capacity of the decoded-frame channel; applies backpressure to the
/// socket when the session layer falls behind.
const RECV_CHANNEL_CAPACITY: usize = 64;

/// Protocol-level setup and framing errors. Fatal to the one connection.
#[derive(Debug)]
pub enum ProtocolError {
    /// The remote presented a public key other than the expected one.
    IdMismatch,
    /// An address exceeds the u8 length prefix.
    AddressTooLong(usize),
    /// A frame declared a length above the configured maximum.
    FrameTooLarge { declared: u64, max: usize },
    /// The length prefix was not a valid LEB128 varuint.
    MalformedLength,
    Io(std::io::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::IdMismatch => write!(f, "remote id does not match expected peer"),
            ProtocolError::AddressTooLong(len) => {
                write!(f, "address length {} exceeds 255", len)
            }
            ProtocolError::FrameTooLarge { declared, max } => {
                write!(f, "frame length {} exceeds maximum {}", declared, max)
            }
            ProtocolError::MalformedLength => write!(f, "malformed frame length prefix"),
            ProtocolError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

pub struct MessageAdapter {
    writer: Mutex<OwnedWriteHalf>,
    shutdown: Notify,
    closed: AtomicBool,
    local_public_key: PublicKey,
    remote_public_key: PublicKey,
    local_addr: String,
    remote_addr: String,
    max_payload_len: usize,
}

impl MessageAdapter {
    /// Perform the active-side setup handshake and start the receiver task.
    pub async fn active(
        mut stream: TcpStream,
        local: PublicKey,
        remote: PublicKey,
        local_addr: &str,
        remote_addr: &str,
        max_payload_len: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>), ProtocolError> {
        if local_addr.len() > 255 {
            return Err(ProtocolError::AddressTooLong(local_addr.len()));
        }
        if remote_addr.len() > 255 {
            return Err(ProtocolError::AddressTooLong(remote_addr.len()));
        }

        stream.write_all(local.as_bytes()).await?;

        let mut received = [0u8; ID_LEN];
        stream.read_exact(&mut received).await?;
        if received != *remote.as_bytes() {
            return Err(ProtocolError::IdMismatch);
        }

        write_len_prefixed(&mut stream, remote_addr.as_bytes()).await?;
        write_len_prefixed(&mut stream, local_addr.as_bytes()).await?;

        Ok(Self::start(
            stream,
            local,
            remote,
            local_addr.to_string(),
            remote_addr.to_string(),
            max_payload_len,
        ))
    }

    /// Perform the passive-side setup handshake and start the receiver task.
    ///
    /// The returned adapter's local address is the one announced by the
    /// dialer, falling back to `local_addr` when the dialer sent none.
    pub async fn passive(
        mut stream: TcpStream,
        local: PublicKey,
        local_addr: &str,
        max_payload_len: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>), ProtocolError> {
        if local_addr.len() > 255 {
            return Err(ProtocolError::AddressTooLong(local_addr.len()));
        }

        let mut received = [0u8; ID_LEN];
        stream.read_exact(&mut received).await?;
        let remote = PublicKey::from_bytes(received);

        stream.write_all(local.as_bytes()).await?;

        let announced_local = read_len_prefixed(&mut stream).await?;
        let local_addr = if announced_local.is_empty() {
            local_addr.to_string()
        } else {
            String::from_utf8_lossy(&announced_local).into_owned()
        };

        let remote_addr_bytes = read_len_prefixed(&mut stream).await?;
        let remote_addr = String::from_utf8_lossy(&remote_addr_bytes).into_owned();

        Ok(Self::start(
            stream,
            local,
            remote,
            local_addr,
            remote_addr,
            max_payload_len,
        ))
    }

    fn start(
        stream: TcpStream,
        local: PublicKey,
        remote: PublicKey,
        local_addr: String,
        remote_addr: String,
        max_payload_len: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (read_half, write_half) = stream.into_split();

        let adapter = Arc::new(Self {
            writer: Mutex::new(write_half),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            local_public_key: local,
            remote_public_key: remote,
            local_addr,
            remote_addr,
            max_payload_len,
        });

        let (tx, rx) = mpsc::channel(RECV_CHANNEL_CAPACITY);
        tokio::spawn(recv_worker(adapter.clone(), read_half, tx));

        (adapter, rx)
    }

    /// Write one frame. Concurrent senders are serialized internally; the
    /// session layer additionally keeps cipher order and write order in
    /// sync by holding its own send lock across this call.
    pub async fn send(&self, message: &[u8]) -> Result<(), ProtocolError> {
        if message.len() > self.max_payload_len {
            return Err(ProtocolError::FrameTooLarge {
                declared: message.len() as u64,
                max: self.max_payload_len,
            });
        }

        let mut frame = Vec::with_capacity(message.len() + 10);
        write_varuint(&mut frame, message.len() as u64);
        frame.extend_from_slice(message);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the underlying stream and wake the receiver task. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // notify_one stores a permit, so the receiver wakes even if it is
        // not parked on the notification yet.
        self.shutdown.notify_one();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_public_key(&self) -> PublicKey {
        self.local_public_key
    }

    pub fn remote_public_key(&self) -> PublicKey {
        self.remote_public_key
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

impl std::fmt::Debug for MessageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageAdapter")
            .field("remote", &self.remote_public_key)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn recv_worker(
    adapter: Arc<MessageAdapter>,
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<Vec<u8>>,
) {
    let mut reader = BufReader::new(read_half);
    let max = adapter.max_payload_len;

    loop {
        if adapter.is_closed() {
            break;
        }
        tokio::select! {
            _ = adapter.shutdown.notified() => break,
            frame = read_frame(&mut reader, max) => match frame {
                Ok(Some(buf)) => {
                    if tx.send(buf).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(
                        remote = %hex::encode(&adapter.remote_public_key.as_bytes()[..8]),
                        error = %e,
                        "receive stream terminated"
                    );
                    break;
                }
            }
        }
    }

    trace!(
        remote = %hex::encode(&adapter.remote_public_key.as_bytes()[..8]),
        "receiver task exiting"
    );
    adapter.close().await;
    // Dropping `tx` closes the channel: the end-of-stream signal for the
    // session layer.
}

/// Read one frame. `Ok(None)` means clean EOF at a frame boundary.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload_len: usize,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let len = match read_varuint(reader).await {
        Ok(Some(len)) => len,
        Ok(None) => return Ok(None),
        Err(e) => return Err(e),
    };

    if len > max_payload_len as u64 {
        return Err(ProtocolError::FrameTooLarge {
            declared: len,
            max: max_payload_len,
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

fn write_varuint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read an unsigned LEB128 value. `Ok(None)` on EOF before the first byte.
async fn read_varuint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>, ProtocolError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if first && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        first = false;

        if shift >= 63 && byte > 1 {
            return Err(ProtocolError::MalformedLength);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift > 63 {
            return Err(ProtocolError::MalformedLength);
        }
    }
}

async fn write_len_prefixed(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), ProtocolError> {
    debug_assert!(bytes.len() <= 255);
    let mut buf = Vec::with_capacity(bytes.len() + 1);
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_len_prefixed(stream: &mut TcpStream) -> Result<Vec<u8>, ProtocolError> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut buf).await?;
    }
    Ok(buf)
}
