use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::protocol::{
    Codec, FrameScanner, Protocol, ProtocolError, TuyaFrame, TuyaMessage, CMD_SESS_KEY_FINISH,
    CMD_SESS_KEY_RESP, CMD_SESS_KEY_START,
};
use crate::session::{self, HandshakeError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(750);

const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum ConnectionError {
    Tcp(std::io::Error),
    Protocol(ProtocolError),
    Handshake(HandshakeError),
    Timeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Tcp(e) => write!(f, "TCP error: {e}"),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ConnectionError::Handshake(e) => write!(f, "Handshake error: {e}"),
            ConnectionError::Timeout => write!(f, "Connection timed out"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Tcp(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<HandshakeError> for ConnectionError {
    fn from(e: HandshakeError) -> Self {
        ConnectionError::Handshake(e)
    }
}

/// One live TCP link to the device: the socket plus its reassembly buffer.
/// The dispatcher owns exactly one of these at a time; the device drops an
/// older connection when a new one arrives, so we never open a second.
pub struct Link {
    pub stream: TcpStream,
    pub scanner: FrameScanner,
}

impl Link {
    pub async fn send(&mut self, frame: &TuyaFrame) -> Result<(), ConnectionError> {
        self.stream.write_all(&frame.bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// One read into the reassembly buffer. Returns the bytes read; zero
    /// means the device closed the connection.
    pub async fn fill(&mut self) -> Result<usize, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        if n > 0 {
            self.scanner.extend(&chunk[..n]);
        }
        Ok(n)
    }
}

/// Connect to the device and bring the link to the established state. For
/// 3.1/3.3 that is just the TCP connect; for 3.4 the session-key
/// negotiation runs before any DP traffic, and the codec key is swapped to
/// the derived session key on success.
pub async fn establish(
    config: &Config,
    codec: &mut Codec,
    seqno: &mut u16,
) -> Result<Link, ConnectionError> {
    let addr = format!("{}:{}", config.device_ip, config.device_port);

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Tcp)?;

    tracing::debug!(addr = %addr, protocol = %codec.protocol(), "Connected to device");

    let mut link = Link {
        stream,
        scanner: FrameScanner::new(),
    };

    if codec.protocol() == Protocol::V34 {
        negotiate_session_key(config, codec, seqno, &mut link).await?;
    }

    Ok(link)
}

/// Three-step 3.4 key exchange. The KEY_RESP wait is bounded; on expiry
/// the caller tears the link down and the session resets to disconnected.
async fn negotiate_session_key(
    config: &Config,
    codec: &mut Codec,
    seqno: &mut u16,
    link: &mut Link,
) -> Result<(), ConnectionError> {
    let local_nonce = session::generate_nonce();

    let payload = session::key_start_payload(&config.local_key, &local_nonce);
    let frame = codec.build_raw(next_seq(seqno), CMD_SESS_KEY_START, payload);
    link.send(&frame).await?;

    let resp = read_handshake_frame(codec, link).await?;
    let remote_nonce =
        session::parse_key_response(&config.local_key, &local_nonce, &resp.payload)?;

    let payload = session::key_final_payload(&config.local_key, &remote_nonce);
    let frame = codec.build_raw(next_seq(seqno), CMD_SESS_KEY_FINISH, payload);
    link.send(&frame).await?;

    let session_key = session::derive_session_key(&config.local_key, &local_nonce, &remote_nonce);
    codec.set_key(session_key);

    tracing::debug!(key_fp = %codec.key_fingerprint(), "Session key negotiated");
    Ok(())
}

/// Wait for the KEY_RESP frame, dropping anything else the device sends
/// in the meantime.
async fn read_handshake_frame(
    codec: &Codec,
    link: &mut Link,
) -> Result<TuyaMessage, ConnectionError> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

    loop {
        while let Some(raw) = link.scanner.next_frame() {
            let msg = codec.parse(&raw)?;
            if msg.cmd == CMD_SESS_KEY_RESP {
                return Ok(msg);
            }
            tracing::trace!(cmd = msg.cmd, "Dropping non-handshake frame during key exchange");
        }

        let n = tokio::time::timeout_at(deadline, link.fill())
            .await
            .map_err(|_| ConnectionError::Handshake(HandshakeError::Timeout))??;
        if n == 0 {
            return Err(ConnectionError::Tcp(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device closed during key exchange",
            )));
        }
    }
}

/// Take the next outbound sequence number. Starts at 1 and wraps.
pub fn next_seq(seqno: &mut u16) -> u16 {
    let current = *seqno;
    *seqno = seqno.wrapping_add(1);
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increment_and_wrap() {
        let mut seq = 1u16;
        assert_eq!(next_seq(&mut seq), 1);
        assert_eq!(next_seq(&mut seq), 2);

        let mut seq = u16::MAX;
        assert_eq!(next_seq(&mut seq), u16::MAX);
        assert_eq!(next_seq(&mut seq), 0);
    }
}
