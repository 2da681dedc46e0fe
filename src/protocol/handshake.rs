//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |          [Handshake Complete]          |
//! ```
//!
//! Only the simple handshake is implemented. [`Handshake`] is a pure state
//! machine over byte buffers; [`accept`] and [`connect`] drive it over any
//! async stream, reading exactly the bytes each step needs so nothing that
//! follows the handshake is consumed.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Nothing sent or received yet
    Initial,
    /// Waiting for C0+C1 (server) or S0+S1+S2 (client)
    WaitingForPeerPacket,
    /// Server only: waiting for C2
    WaitingForPeerEcho,
    Done,
}

/// Handshake state machine
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    /// Our C1/S1, kept to verify the peer's echo
    our_packet: Option<[u8; HANDSHAKE_SIZE]>,
    verify_echo: bool,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
            our_packet: None,
            verify_echo: true,
        }
    }

    /// Require C2 to echo S1 (server role only; on by default)
    pub fn verify_echo(mut self, verify: bool) -> Self {
        self.verify_echo = verify;
        self
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes the next call to [`Handshake::process`] needs
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                1 + HANDSHAKE_SIZE * 2
            }
            (HandshakeState::WaitingForPeerEcho, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Start the handshake
    ///
    /// Returns C0+C1 for a client. A server sends nothing until it has C0+C1.
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::WaitingForPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                let c1 = generate_packet();
                self.our_packet = Some(c1);

                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&c1);
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Feed received bytes, returning what must be sent back
    ///
    /// Returns `Ok(None)` when more input is needed or nothing has to be sent.
    pub fn process(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        let needed = self.bytes_needed();
        if needed == 0 || data.remaining() < needed {
            return Ok(None);
        }

        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => {
                let c1 = read_versioned_packet(data)?;

                let s1 = generate_packet();
                self.our_packet = Some(s1);

                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&s1);
                response.put_slice(&generate_echo(&c1));

                self.state = HandshakeState::WaitingForPeerEcho;
                Ok(Some(response.freeze()))
            }
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                let s1 = read_versioned_packet(data)?;
                // S2 is not checked: ingest servers are inconsistent about echoing C1
                data.advance(HANDSHAKE_SIZE);

                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&generate_echo(&s1))))
            }
            (HandshakeState::WaitingForPeerEcho, _) => {
                let mut c2 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut c2);

                if self.verify_echo {
                    if let Some(s1) = &self.our_packet {
                        if c2[0..4] != s1[0..4] || c2[8..] != s1[8..] {
                            return Err(HandshakeError::EchoMismatch.into());
                        }
                    }
                }

                self.state = HandshakeState::Done;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

fn read_versioned_packet(data: &mut Bytes) -> Result<[u8; HANDSHAKE_SIZE]> {
    let version = data.get_u8();
    if version != RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version).into());
    }
    let mut packet = [0u8; HANDSHAKE_SIZE];
    data.copy_to_slice(&mut packet);
    Ok(packet)
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// C1/S1: 4 byte time, 4 zero bytes, 1528 bytes of filler
///
/// The filler only has to differ between peers; an LCG seeded from the clock
/// and a counter is enough.
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SALT: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

    let mut packet = [0u8; HANDSHAKE_SIZE];
    let time = now_millis();
    packet[0..4].copy_from_slice(&time.to_be_bytes());

    let mut seed = (time as u64) ^ SALT.fetch_add(0x6A09_E667, Ordering::Relaxed);
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    packet
}

/// C2/S2: the peer's packet with our receive time in bytes 4..8
fn generate_echo(peer: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}

/// Run the server side of the handshake on `stream`
pub async fn accept<S>(stream: &mut S, timeout: Duration, verify_echo: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(HandshakeRole::Server).verify_echo(verify_echo);
    handshake.generate_initial();

    tokio::time::timeout(timeout, drive(stream, &mut handshake))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Run the client side of the handshake on `stream`
pub async fn connect<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(HandshakeRole::Client);

    tokio::time::timeout(timeout, async {
        if let Some(c0c1) = handshake.generate_initial() {
            stream.write_all(&c0c1).await?;
            stream.flush().await?;
        }
        drive(stream, &mut handshake).await
    })
    .await
    .map_err(|_| HandshakeError::Timeout)?
}

async fn drive<S>(stream: &mut S, handshake: &mut Handshake) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while !handshake.is_done() {
        let mut buf = vec![0u8; handshake.bytes_needed()];
        stream.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Handshake(HandshakeError::Truncated)
            } else {
                Error::Io(e)
            }
        })?;

        let mut data = Bytes::from(buf);
        if let Some(response) = handshake.process(&mut data)? {
            stream.write_all(&response).await?;
            stream.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_response(server: &mut Handshake, c0c1: Bytes) -> Bytes {
        server.generate_initial();
        let mut buf = c0c1;
        server.process(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_client_server_handshake() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let c0c1 = client.generate_initial().unwrap();
        assert_eq!(c0c1.len(), 1 + HANDSHAKE_SIZE);
        assert_eq!(c0c1[0], RTMP_VERSION);

        let s0s1s2 = server_response(&mut server, c0c1);
        assert_eq!(s0s1s2.len(), 1 + HANDSHAKE_SIZE * 2);

        let mut buf = s0s1s2;
        let c2 = client.process(&mut buf).unwrap().unwrap();
        assert_eq!(c2.len(), HANDSHAKE_SIZE);
        assert!(client.is_done());

        let mut buf = c2;
        assert!(server.process(&mut buf).unwrap().is_none());
        assert!(server.is_done());
    }

    #[test]
    fn test_bytes_needed_per_role() {
        let mut client = Handshake::new(HandshakeRole::Client);
        assert_eq!(client.bytes_needed(), 0);
        client.generate_initial();
        assert_eq!(client.bytes_needed(), 1 + HANDSHAKE_SIZE * 2);

        let mut server = Handshake::new(HandshakeRole::Server);
        assert!(server.generate_initial().is_none());
        assert_eq!(server.bytes_needed(), 1 + HANDSHAKE_SIZE);
    }

    #[test]
    fn test_partial_input_waits() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut partial = Bytes::from(vec![RTMP_VERSION; 100]);
        assert!(server.process(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 100);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut c0c1 = BytesMut::new();
        c0c1.put_u8(6);
        c0c1.put_slice(&[0u8; HANDSHAKE_SIZE]);
        let err = server.process(&mut c0c1.freeze()).unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::InvalidVersion(6))
        ));
    }

    #[test]
    fn test_bad_echo_rejected() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);
        let c0c1 = client.generate_initial().unwrap();
        server_response(&mut server, c0c1);

        let mut bogus_c2 = Bytes::from(vec![0xAB; HANDSHAKE_SIZE]);
        let err = server.process(&mut bogus_c2).unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::EchoMismatch)));
    }

    #[test]
    fn test_bad_echo_accepted_when_lenient() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server).verify_echo(false);
        let c0c1 = client.generate_initial().unwrap();
        server_response(&mut server, c0c1);

        let mut bogus_c2 = Bytes::from(vec![0xAB; HANDSHAKE_SIZE]);
        assert!(server.process(&mut bogus_c2).is_ok());
        assert!(server.is_done());
    }

    #[test]
    fn test_echo_keeps_peer_time_and_random() {
        let packet = generate_packet();
        let echo = generate_echo(&packet);
        assert_eq!(&packet[0..4], &echo[0..4]);
        assert_eq!(&packet[8..], &echo[8..]);
        assert_ne!(generate_packet()[8..], generate_packet()[8..]);
    }

    #[tokio::test]
    async fn test_async_drivers_over_duplex() {
        let (mut client_io, mut server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            accept(&mut server_io, Duration::from_secs(5), true).await
        });
        connect(&mut client_io, Duration::from_secs(5)).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_accept_rejects_bad_version_from_mock() {
        let mut c0c1 = vec![9u8];
        c0c1.extend_from_slice(&[0u8; HANDSHAKE_SIZE]);
        let mut mock = tokio_test::io::Builder::new().read(&c0c1).build();

        let err = accept(&mut mock, Duration::from_secs(5), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake(HandshakeError::InvalidVersion(9))
        ));
    }

    #[tokio::test]
    async fn test_accept_reports_truncation() {
        let mut c0c1 = vec![RTMP_VERSION];
        c0c1.extend_from_slice(&[0u8; 100]);
        let mut mock = tokio_test::io::Builder::new().read(&c0c1).build();

        let err = accept(&mut mock, Duration::from_secs(5), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::Truncated)));
    }

    #[tokio::test]
    async fn test_accept_times_out_on_silent_peer() {
        let (_client_io, mut server_io) = tokio::io::duplex(64);
        let err = accept(&mut server_io, Duration::from_millis(50), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(HandshakeError::Timeout)));
    }
}
