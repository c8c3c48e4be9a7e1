//! MySQL TCP transport: a [`Connector`] that opens plain TCP sessions.
//!
//! Only the framing needed to manage links lives here: the server greeting,
//! `COM_PING`, `COM_RESET_CONNECTION` and `COM_QUIT`. The authentication
//! exchange is delegated to an [`Authenticator`].
//!
//! # Packet framing
//!
//! ```text
//! [payload_len: 3 bytes LE] [seq_id: 1 byte] [payload ...]
//!
//! Client → Server:  [0x01, 0x00, 0x00, 0x00, 0x0e]   COM_PING
//! Server → Client:  [len, len, len, 0x01, 0x00, ...]  OK
//!                   [len, len, len, 0x01, 0xff, ...]  ERR
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mylink_core::{Credentials, HostEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::LinkError;
use crate::link::{Connector, Session};

pub const COM_QUIT: u8 = 0x01;
pub const COM_PING: u8 = 0x0e;
pub const COM_RESET_CONNECTION: u8 = 0x1f;

/// 3 bytes length + 1 byte sequence id.
pub const HEADER_SIZE: usize = 4;

pub const OK_MARKER: u8 = 0x00;
pub const ERR_MARKER: u8 = 0xff;

const MAX_PAYLOAD: usize = 0x00ff_ffff;

/// Default bound on every read from the server.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The initial handshake packet sent by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerGreeting {
    pub protocol_version: u8,
    pub server_version: String,
    /// Connection id assigned by the server.
    pub thread_id: u32,
    /// Everything after the thread id (auth plugin data, capabilities, ...).
    pub auth_data: Vec<u8>,
}

impl ServerGreeting {
    /// Parse a greeting payload. An error packet is reported as refused.
    pub fn parse(address: &str, payload: &[u8]) -> Result<Self, LinkError> {
        match payload.first() {
            None => return Err(LinkError::Protocol("empty greeting".to_string())),
            Some(&ERR_MARKER) => {
                return Err(LinkError::Refused {
                    address: address.to_string(),
                    reason: parse_error_packet(payload),
                });
            }
            Some(_) => {}
        }

        let protocol_version = payload[0];
        let rest = &payload[1..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| LinkError::Protocol("unterminated server version".to_string()))?;
        let server_version = String::from_utf8_lossy(&rest[..nul]).into_owned();

        let after_version = &rest[nul + 1..];
        let Some(id_bytes) = after_version.get(..4) else {
            return Err(LinkError::Protocol("greeting truncated before thread id".to_string()));
        };
        let thread_id = u32::from_le_bytes([id_bytes[0], id_bytes[1], id_bytes[2], id_bytes[3]]);

        Ok(Self {
            protocol_version,
            server_version,
            thread_id,
            auth_data: after_version[4..].to_vec(),
        })
    }
}

/// Render an ERR packet payload as `code (state): message`.
pub fn parse_error_packet(payload: &[u8]) -> String {
    let body = payload.get(1..).unwrap_or_default();
    let Some(code) = body.get(..2).map(|c| u16::from_le_bytes([c[0], c[1]])) else {
        return "malformed error packet".to_string();
    };
    let body = &body[2..];
    match body.split_first() {
        Some((b'#', tail)) if tail.len() >= 5 => {
            let state = String::from_utf8_lossy(&tail[..5]);
            let message = String::from_utf8_lossy(&tail[5..]);
            format!("{code} ({state}): {message}")
        }
        _ => format!("{code}: {}", String::from_utf8_lossy(body)),
    }
}

/// Performs the authentication exchange after the greeting.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        stream: &mut TcpStream,
        greeting: &ServerGreeting,
        credentials: &Credentials,
    ) -> Result<(), LinkError>;
}

/// Write one packet with the given sequence id.
pub async fn write_packet(stream: &mut TcpStream, seq: u8, payload: &[u8]) -> Result<(), LinkError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(LinkError::Protocol(format!(
            "payload of {} bytes exceeds one packet",
            payload.len()
        )));
    }
    let len = payload.len() as u32;
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.extend_from_slice(&len.to_le_bytes()[..3]);
    packet.push(seq);
    packet.extend_from_slice(payload);
    stream.write_all(&packet).await?;
    Ok(())
}

/// Read one packet, bounded by `timeout`. Returns the sequence id and payload.
pub async fn read_packet(stream: &mut TcpStream, timeout: Duration) -> Result<(u8, Vec<u8>), LinkError> {
    let read = async {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok::<_, std::io::Error>((header[3], payload))
    };
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(LinkError::Broken(format!("no answer within {timeout:?}"))),
    }
}

// ── MysqlConnector ───────────────────────────────────────────────────

/// Opens MySQL sessions over plain TCP.
pub struct MysqlConnector {
    authenticator: Arc<dyn Authenticator>,
    read_timeout: Duration,
}

impl MysqlConnector {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(self, read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..self
        }
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    async fn open(
        &self,
        host: &HostEntry,
        credentials: &Credentials,
    ) -> Result<Box<dyn Session>, LinkError> {
        let address = host.to_string();
        let port = host.port_or_default();
        let mut stream = TcpStream::connect((host.host.as_str(), port))
            .await
            .map_err(|e| LinkError::Refused {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (_, payload) = read_packet(&mut stream, self.read_timeout).await?;
        let greeting = ServerGreeting::parse(&address, &payload)?;
        tracing::debug!(
            host = %address,
            server_version = %greeting.server_version,
            thread_id = greeting.thread_id,
            "received server greeting"
        );

        self.authenticator
            .authenticate(&mut stream, &greeting, credentials)
            .await?;

        Ok(Box::new(MysqlSession {
            stream,
            address,
            thread_id: u64::from(greeting.thread_id),
            read_timeout: self.read_timeout,
        }))
    }
}

// ── MysqlSession ─────────────────────────────────────────────────────

/// An authenticated MySQL session over TCP.
pub struct MysqlSession {
    stream: TcpStream,
    address: String,
    thread_id: u64,
    read_timeout: Duration,
}

impl std::fmt::Debug for MysqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlSession")
            .field("address", &self.address)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

impl MysqlSession {
    /// Send a single-byte command and read the first response packet.
    async fn command(&mut self, command: u8) -> Result<Vec<u8>, LinkError> {
        write_packet(&mut self.stream, 0, &[command]).await?;
        let (_, payload) = read_packet(&mut self.stream, self.read_timeout).await?;
        Ok(payload)
    }
}

#[async_trait]
impl Session for MysqlSession {
    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    async fn ping(&mut self) -> bool {
        match self.command(COM_PING).await {
            Ok(payload) if payload.first() == Some(&OK_MARKER) => true,
            Ok(payload) => {
                tracing::debug!(
                    host = %self.address,
                    thread_id = self.thread_id,
                    marker = ?payload.first(),
                    "mysql COM_PING: not an OK packet"
                );
                false
            }
            Err(e) => {
                tracing::debug!(
                    host = %self.address,
                    thread_id = self.thread_id,
                    error = %e,
                    "mysql COM_PING failed"
                );
                false
            }
        }
    }

    async fn reset(&mut self) -> Result<(), LinkError> {
        let payload = self.command(COM_RESET_CONNECTION).await?;
        match payload.first() {
            Some(&OK_MARKER) => Ok(()),
            Some(&ERR_MARKER) => Err(LinkError::Protocol(parse_error_packet(&payload))),
            other => Err(LinkError::Protocol(format!(
                "unexpected reply {other:?} to COM_RESET_CONNECTION"
            ))),
        }
    }

    async fn close(&mut self) {
        let _ = write_packet(&mut self.stream, 0, &[COM_QUIT]).await;
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting_payload(thread_id: u32) -> Vec<u8> {
        let mut payload = vec![10];
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&thread_id.to_le_bytes());
        payload.extend_from_slice(b"salt1234\0");
        payload
    }

    #[test]
    fn parse_greeting() {
        let greeting = ServerGreeting::parse("db1", &greeting_payload(4242)).unwrap();
        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, "8.0.36");
        assert_eq!(greeting.thread_id, 4242);
        assert_eq!(greeting.auth_data, b"salt1234\0");
    }

    #[test]
    fn greeting_error_packet_is_refused() {
        let mut payload = vec![ERR_MARKER];
        payload.extend_from_slice(&1040u16.to_le_bytes());
        payload.extend_from_slice(b"#08004Too many connections");

        match ServerGreeting::parse("db1:3306", &payload) {
            Err(LinkError::Refused { address, reason }) => {
                assert_eq!(address, "db1:3306");
                assert_eq!(reason, "1040 (08004): Too many connections");
            }
            other => panic!("expected Refused, got {other:?}"),
        }
    }

    #[test]
    fn truncated_greeting_is_a_protocol_error() {
        assert!(matches!(
            ServerGreeting::parse("db1", &[]),
            Err(LinkError::Protocol(_))
        ));
        assert!(matches!(
            ServerGreeting::parse("db1", b"\x0a8.0.36"),
            Err(LinkError::Protocol(_))
        ));
        assert!(matches!(
            ServerGreeting::parse("db1", b"\x0a8.0.36\0\x01\x02"),
            Err(LinkError::Protocol(_))
        ));
    }

    #[test]
    fn error_packet_without_sql_state() {
        let mut payload = vec![ERR_MARKER];
        payload.extend_from_slice(&1045u16.to_le_bytes());
        payload.extend_from_slice(b"Access denied");
        assert_eq!(parse_error_packet(&payload), "1045: Access denied");
        assert_eq!(parse_error_packet(&[ERR_MARKER]), "malformed error packet");
    }

    #[tokio::test]
    async fn packet_framing_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (seq, payload) = read_packet(&mut socket, Duration::from_secs(5)).await.unwrap();
            assert_eq!((seq, payload.as_slice()), (0, &[COM_PING][..]));
            write_packet(&mut socket, 1, &[OK_MARKER, 0, 0, 2, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_packet(&mut client, 0, &[COM_PING]).await.unwrap();
        let (seq, payload) = read_packet(&mut client, Duration::from_secs(5)).await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(payload[0], OK_MARKER);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn read_packet_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (_silent, _) = listener.accept().await.unwrap();

        let err = read_packet(&mut client, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LinkError::Broken(_)));
    }
}
