//! Session state machine
//!
//! Tracks one RTMP connection from handshake to close and validates the
//! order of commands. The I/O side lives in `server::connection`; every
//! transition here is pure so it can be tested without sockets.
//!
//! ```text
//! Handshaking ──connect──► Connected ──publish──► Publishing ─┐
//!      │                    │    ▲  └────play───► Playing ────┤
//!      │                    │    └───deleteStream/unpublish───┘
//!      └────────────────────┴──────────────► Closed ◄── any error
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::protocol::constants::*;
use crate::protocol::message::ConnectParams;
use crate::registry::StreamKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Handshake done or in progress, `connect` not yet accepted
    Handshaking,
    /// `connect` accepted, no stream bound
    Connected,
    Publishing,
    Playing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Handshaking => "handshaking",
            SessionPhase::Connected => "connected",
            SessionPhase::Publishing => "publishing",
            SessionPhase::Playing => "playing",
            SessionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream a session is bound to while publishing or playing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundStream {
    pub stream_id: u32,
    pub key: StreamKey,
}

#[derive(Debug)]
pub struct SessionState {
    pub id: u64,
    pub peer_addr: SocketAddr,
    phase: SessionPhase,
    pub connected_at: Instant,
    pub handshake_completed_at: Option<Instant>,
    connect_params: Option<ConnectParams>,
    /// Message stream ids handed out by `createStream`
    streams: BTreeSet<u32>,
    next_stream_id: u32,
    bound: Option<BoundStream>,

    /// Window size announced by the peer
    pub window_ack_size: u32,
    bytes_received: u64,
    last_ack: u64,
    pub media_packets: u64,
}

impl SessionState {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Handshaking,
            connected_at: Instant::now(),
            handshake_completed_at: None,
            connect_params: None,
            streams: BTreeSet::new(),
            // Stream 0 is the NetConnection itself
            next_stream_id: 1,
            bound: None,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            bytes_received: 0,
            last_ack: 0,
            media_packets: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn complete_handshake(&mut self) {
        self.handshake_completed_at = Some(Instant::now());
    }

    /// Accept or reject `connect`
    ///
    /// The application name must match `expected_app`. A rejected connect
    /// closes the session.
    pub fn on_connect(
        &mut self,
        params: ConnectParams,
        expected_app: &str,
    ) -> Result<(), ProtocolError> {
        self.require(CMD_CONNECT, &[SessionPhase::Handshaking])?;
        if params.app.is_empty() || params.app != expected_app {
            self.phase = SessionPhase::Closed;
            return Err(ProtocolError::InvalidApp(params.app));
        }
        self.connect_params = Some(params);
        self.phase = SessionPhase::Connected;
        Ok(())
    }

    /// `createStream`: hand out the next message stream id
    pub fn create_stream(&mut self) -> Result<u32, ProtocolError> {
        self.require(CMD_CREATE_STREAM, &[SessionPhase::Connected])?;
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(id);
        Ok(id)
    }

    /// Commands encoders send around `publish` (`releaseStream`, `FCPublish`)
    pub fn on_publish_preamble(&mut self, command: &str) -> Result<(), ProtocolError> {
        self.require(command, &[SessionPhase::Connected, SessionPhase::Publishing])
    }

    pub fn start_publish(&mut self, stream_id: u32, key: StreamKey) -> Result<(), ProtocolError> {
        self.require(CMD_PUBLISH, &[SessionPhase::Connected])?;
        self.bound = Some(BoundStream { stream_id, key });
        self.phase = SessionPhase::Publishing;
        Ok(())
    }

    pub fn start_play(&mut self, stream_id: u32, key: StreamKey) -> Result<(), ProtocolError> {
        self.require(CMD_PLAY, &[SessionPhase::Connected])?;
        self.bound = Some(BoundStream { stream_id, key });
        self.phase = SessionPhase::Playing;
        Ok(())
    }

    /// Media is only accepted from a publisher
    pub fn check_media(&self, kind: &str) -> Result<(), ProtocolError> {
        if self.phase == SessionPhase::Publishing {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedCommand {
                command: kind.to_string(),
                phase: self.phase.as_str(),
            })
        }
    }

    /// `deleteStream`/`closeStream`/`FCUnpublish`: unbind and return to
    /// Connected. Returns the stream that was bound, if any.
    pub fn stop_stream(&mut self) -> Option<BoundStream> {
        match self.phase {
            SessionPhase::Publishing | SessionPhase::Playing => {
                self.phase = SessionPhase::Connected;
                self.bound.take()
            }
            _ => None,
        }
    }

    /// `deleteStream` for an id that was never bound
    pub fn release_stream_id(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
        self.bound = None;
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    pub fn has_stream(&self, stream_id: u32) -> bool {
        self.streams.contains(&stream_id)
    }

    pub fn bound(&self) -> Option<&BoundStream> {
        self.bound.as_ref()
    }

    pub fn app(&self) -> Option<&str> {
        self.connect_params.as_ref().map(|p| p.app.as_str())
    }

    pub fn connect_params(&self) -> Option<&ConnectParams> {
        self.connect_params.as_ref()
    }

    /// Record the decoder's running byte count
    ///
    /// Returns the sequence number to acknowledge once a full window has
    /// arrived since the last acknowledgement.
    pub fn record_bytes_received(&mut self, total: u64) -> Option<u32> {
        self.bytes_received = total;
        if self.window_ack_size == 0 {
            return None;
        }
        if total.saturating_sub(self.last_ack) >= u64::from(self.window_ack_size) {
            self.last_ack = total;
            // The sequence number wraps at 32 bits
            return Some(total as u32);
        }
        None
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Fail with `UnexpectedCommand` (and close) unless in one of `allowed`
    pub fn require(&mut self, command: &str, allowed: &[SessionPhase]) -> Result<(), ProtocolError> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        let phase = self.phase.as_str();
        self.phase = SessionPhase::Closed;
        Err(ProtocolError::UnexpectedCommand {
            command: command.to_string(),
            phase,
        })
    }
}
