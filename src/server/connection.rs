//! Per-connection session driver
//!
//! Owns the socket of one accepted client: runs the handshake, decodes
//! chunks, feeds commands through `SessionState` and bridges the session to
//! the registry (ingest for publishers, a subscription for players).

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::time::{timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::amf::{AmfObject, AmfValue};
use crate::error::{Error, ProtocolError, Result};
use crate::media::packet::MediaPacket;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::message::{
    Command, ConnectParams, DataMessage, PlayParams, PublishParams, RtmpMessage, UserControlEvent,
};
use crate::registry::{
    Delivery, PublisherHandle, RegistryError, StreamKey, StreamRegistry, Subscription,
};
use crate::server::config::ServerConfig;
use crate::session::{SessionPhase, SessionState};

/// Handshake then serve one client until it disconnects or misbehaves
pub async fn serve<S>(
    mut stream: S,
    session_id: u64,
    peer_addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<StreamRegistry>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    handshake::accept(
        &mut stream,
        config.handshake_timeout,
        config.verify_handshake_echo,
    )
    .await?;
    tracing::debug!(session_id, peer = %peer_addr, "Handshake complete");

    let mut connection = Connection::new(stream, session_id, peer_addr, config, registry);
    connection.state.complete_handshake();
    connection.run().await
}

enum Step {
    Inbound(Option<Result<RtmpChunk>>),
    Delivery(Delivery),
    Ping,
}

pub struct Connection<S> {
    state: SessionState,
    config: ServerConfig,
    registry: Arc<StreamRegistry>,
    reader: FramedRead<ReadHalf<S>, ChunkDecoder>,
    writer: FramedWrite<WriteHalf<S>, ChunkEncoder>,
    publisher: Option<PublisherHandle>,
    subscription: Option<Subscription>,
    /// Player saw the previous publisher end and waits for the next one
    awaiting_publisher: bool,
    last_inbound: Instant,
    next_ping: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        session_id: u64,
        peer_addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let decoder = ChunkDecoder::new().max_message_size(config.max_message_size);
        let now = Instant::now();
        let next_ping = now + config.ping_interval;
        Self {
            state: SessionState::new(session_id, peer_addr),
            config,
            registry,
            reader: FramedRead::new(read_half, decoder),
            writer: FramedWrite::new(write_half, ChunkEncoder::new()),
            publisher: None,
            subscription: None,
            awaiting_publisher: false,
            last_inbound: now,
            next_ping,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        self.send(RtmpMessage::SetChunkSize(self.config.chunk_size), 0)
            .await?;
        self.writer
            .encoder_mut()
            .set_chunk_size(self.config.chunk_size);

        let result = self.message_loop().await;

        // Dropping the handles releases registry state right away
        self.publisher.take();
        self.subscription.take();
        self.state.close();

        match &result {
            Ok(()) => tracing::info!(
                session_id = self.state.id,
                duration_secs = self.state.duration().as_secs(),
                bytes_in = self.state.bytes_received(),
                "Session closed"
            ),
            Err(e) => tracing::info!(
                session_id = self.state.id,
                error = %e,
                "Session terminated"
            ),
        }
        result
    }

    async fn message_loop(&mut self) -> Result<()> {
        let idle_timeout = self.config.idle_timeout;
        let pings = !self.config.ping_interval.is_zero();
        loop {
            let next_ping = self.next_ping;
            let step = match self.subscription.as_mut() {
                // Players are silent by nature, so liveness comes from pings
                Some(subscription) => tokio::select! {
                    biased;
                    delivery = subscription.recv() => Step::Delivery(delivery),
                    inbound = self.reader.next() => Step::Inbound(inbound),
                    _ = tokio::time::sleep_until(next_ping), if pings => Step::Ping,
                },
                None => match timeout(idle_timeout, self.reader.next()).await {
                    Ok(inbound) => Step::Inbound(inbound),
                    Err(_) => {
                        tracing::debug!(session_id = self.state.id, "Idle timeout");
                        return Err(Error::Timeout);
                    }
                },
            };

            match step {
                Step::Inbound(None) => return Ok(()),
                Step::Inbound(Some(chunk)) => {
                    self.last_inbound = Instant::now();
                    self.handle_chunk(chunk?).await?;
                    if self.state.is_closed() {
                        return Ok(());
                    }
                    let consumed = self.reader.decoder().bytes_consumed();
                    if let Some(sequence) = self.state.record_bytes_received(consumed) {
                        self.send(RtmpMessage::Acknowledgement { sequence }, 0)
                            .await?;
                    }
                }
                Step::Delivery(delivery) => self.handle_delivery(delivery).await?,
                Step::Ping => self.ping().await?,
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        if self.last_inbound.elapsed() >= self.config.ping_timeout {
            tracing::info!(session_id = self.state.id, "Player stopped answering pings");
            return Err(Error::Timeout);
        }
        let timestamp = self.state.duration().as_millis() as u32;
        self.send(
            RtmpMessage::UserControl(UserControlEvent::PingRequest(timestamp)),
            0,
        )
        .await?;
        self.next_ping = Instant::now() + self.config.ping_interval;
        Ok(())
    }

    async fn handle_chunk(&mut self, chunk: RtmpChunk) -> Result<()> {
        match RtmpMessage::from_chunk(&chunk)? {
            // Chunk size and abort are applied inside the decoder
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.state.id, size, "Peer chunk size");
            }
            RtmpMessage::Abort { csid } => {
                tracing::debug!(session_id = self.state.id, csid, "Peer aborted message");
            }
            RtmpMessage::Acknowledgement { .. } => {}
            RtmpMessage::WindowAckSize(size) => self.state.window_ack_size = size,
            RtmpMessage::SetPeerBandwidth { .. } => {}
            RtmpMessage::UserControl(event) => self.handle_user_control(event).await?,
            message @ (RtmpMessage::Audio { .. } | RtmpMessage::Video { .. }) => {
                self.handle_media(&message)?
            }
            RtmpMessage::Data(data) => self.handle_data(data)?,
            RtmpMessage::Command(cmd) => self.handle_command(cmd).await?,
            RtmpMessage::Unknown { message_type, .. } => {
                tracing::trace!(session_id = self.state.id, message_type, "Ignoring message");
            }
        }
        Ok(())
    }

    async fn handle_user_control(&mut self, event: UserControlEvent) -> Result<()> {
        match event {
            UserControlEvent::PingRequest(timestamp) => {
                self.send(
                    RtmpMessage::UserControl(UserControlEvent::PingResponse(timestamp)),
                    0,
                )
                .await
            }
            other => {
                tracing::trace!(session_id = self.state.id, event = ?other, "User control");
                Ok(())
            }
        }
    }

    fn handle_media(&mut self, message: &RtmpMessage) -> Result<()> {
        let kind = if matches!(message, RtmpMessage::Audio { .. }) {
            "audio"
        } else {
            "video"
        };
        self.state.check_media(kind)?;
        let (Some(publisher), Some(packet)) =
            (self.publisher.as_ref(), MediaPacket::from_message(message))
        else {
            return Ok(());
        };
        publisher.ingest(packet)?;
        self.state.media_packets += 1;
        Ok(())
    }

    fn handle_data(&mut self, data: DataMessage) -> Result<()> {
        let Some(publisher) = self.publisher.as_ref() else {
            tracing::debug!(session_id = self.state.id, name = %data.name, "Data outside publish");
            return Ok(());
        };
        match data.metadata() {
            Some(metadata) => {
                tracing::debug!(
                    session_id = self.state.id,
                    stream = %publisher.key(),
                    "Metadata received"
                );
                publisher.ingest(MediaPacket::metadata(data.timestamp, metadata))?;
            }
            None => {
                tracing::trace!(session_id = self.state.id, name = %data.name, "Ignoring data message");
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        tracing::debug!(
            session_id = self.state.id,
            command = %cmd.name,
            transaction_id = cmd.transaction_id,
            "Command"
        );
        match cmd.name.as_str() {
            CMD_CONNECT => self.handle_connect(cmd).await,
            CMD_CREATE_STREAM => {
                let stream_id = self.state.create_stream()?;
                let result = Command::result(cmd.transaction_id, AmfValue::Null, stream_id.into());
                self.send(RtmpMessage::Command(result), 0).await
            }
            CMD_RELEASE_STREAM => Ok(self.state.on_publish_preamble(&cmd.name)?),
            CMD_FC_PUBLISH => {
                self.state.on_publish_preamble(&cmd.name)?;
                let name = cmd.first_string_argument().unwrap_or_default().to_string();
                let info = AmfObject::new()
                    .with("code", NS_PUBLISH_START)
                    .with("description", name);
                let reply = Command::new(CMD_ON_FC_PUBLISH, 0.0, AmfValue::Null, vec![info.into()]);
                self.send(RtmpMessage::Command(reply), 0).await
            }
            CMD_PUBLISH => self.handle_publish(cmd).await,
            CMD_PLAY => self.handle_play(cmd).await,
            CMD_FC_UNPUBLISH | CMD_DELETE_STREAM | CMD_CLOSE_STREAM => {
                self.handle_stop(cmd).await
            }
            _ => {
                tracing::trace!(session_id = self.state.id, command = %cmd.name, "Unhandled command");
                Ok(())
            }
        }
    }

    async fn handle_connect(&mut self, cmd: Command) -> Result<()> {
        let params = ConnectParams::from_amf(&cmd.command_object);
        let object_encoding = params.object_encoding;

        match self.state.on_connect(params, &self.config.app) {
            Ok(()) => {}
            Err(ProtocolError::InvalidApp(app)) => {
                tracing::warn!(session_id = self.state.id, app = %app, "Connect rejected");
                let info = AmfObject::new()
                    .with("level", "error")
                    .with("code", NC_CONNECT_REJECTED)
                    .with("description", format!("Unknown application {:?}", app));
                let reply = Command::error(cmd.transaction_id, AmfValue::Null, info.into());
                self.send(RtmpMessage::Command(reply), 0).await?;
                return Err(Error::Rejected(format!("unknown application {:?}", app)));
            }
            Err(e) => return Err(e.into()),
        }

        self.send(RtmpMessage::WindowAckSize(self.config.window_ack_size), 0)
            .await?;
        self.send(
            RtmpMessage::SetPeerBandwidth {
                size: self.config.peer_bandwidth,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
            0,
        )
        .await?;
        self.send(
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(0)),
            0,
        )
        .await?;

        let properties = AmfObject::new()
            .with("fmsVer", "FMS/3,5,7,7009")
            .with("capabilities", 31.0)
            .with("mode", 1.0);
        let info = AmfObject::new()
            .with("level", "status")
            .with("code", NC_CONNECT_SUCCESS)
            .with("description", "Connection succeeded.")
            .with("objectEncoding", object_encoding);
        let reply = Command::result(cmd.transaction_id, properties.into(), info.into());
        self.send(RtmpMessage::Command(reply), 0).await?;

        tracing::info!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            app = self.state.app().unwrap_or_default(),
            "Client connected"
        );
        Ok(())
    }

    async fn handle_publish(&mut self, cmd: Command) -> Result<()> {
        self.state
            .require(CMD_PUBLISH, &[SessionPhase::Connected])?;
        let params = PublishParams::from_command(&cmd);
        let stream_id = params.stream_id;

        let key = match self.stream_key(&params.stream_name) {
            Ok(key) => key,
            Err(e) => {
                self.reject_publish(stream_id, "Invalid stream name").await?;
                return Err(e);
            }
        };

        if let Some(expected) = self.config.publish_key.as_deref() {
            if key.name() != expected {
                tracing::warn!(session_id = self.state.id, stream = %key, "Publish key mismatch");
                self.reject_publish(stream_id, "Invalid stream key").await?;
                return Err(Error::Rejected("publish key mismatch".into()));
            }
        }

        let handle = match self.registry.begin_publish(&key, self.state.id) {
            Ok(handle) => handle,
            Err(e) => {
                let description = e.to_string();
                self.reject_publish(stream_id, &description).await?;
                return Err(e.into());
            }
        };
        self.state.start_publish(stream_id, key.clone())?;
        self.publisher = Some(handle);

        self.send(
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(stream_id)),
            0,
        )
        .await?;
        let status = Command::on_status(
            stream_id,
            "status",
            NS_PUBLISH_START,
            &format!("{} is now published.", key),
        );
        self.send(RtmpMessage::Command(status), stream_id).await?;

        tracing::info!(
            session_id = self.state.id,
            stream = %key,
            publish_type = %params.publish_type,
            "Publish accepted"
        );
        Ok(())
    }

    async fn reject_publish(&mut self, stream_id: u32, description: &str) -> Result<()> {
        let status = Command::on_status(stream_id, "error", NS_PUBLISH_BAD_NAME, description);
        self.send(RtmpMessage::Command(status), stream_id).await?;
        self.state.close();
        Ok(())
    }

    async fn handle_play(&mut self, cmd: Command) -> Result<()> {
        self.state.require(CMD_PLAY, &[SessionPhase::Connected])?;
        let params = PlayParams::from_command(&cmd);
        let stream_id = params.stream_id;
        let key = self.stream_key(&params.stream_name)?;

        let mut subscription = self.registry.subscribe(&key, self.state.id);
        self.state.start_play(stream_id, key.clone())?;
        let live = self.registry.is_publishing(&key);

        self.send_play_start(stream_id, params.reset).await?;
        for packet in subscription.take_catchup() {
            self.send_packet(stream_id, &packet).await?;
        }
        self.subscription = Some(subscription);
        self.awaiting_publisher = !live;
        self.next_ping = Instant::now() + self.config.ping_interval;

        tracing::info!(session_id = self.state.id, stream = %key, live, "Playback started");
        Ok(())
    }

    async fn send_play_start(&mut self, stream_id: u32, reset: bool) -> Result<()> {
        self.send(
            RtmpMessage::UserControl(UserControlEvent::StreamBegin(stream_id)),
            0,
        )
        .await?;
        if reset {
            let status = Command::on_status(stream_id, "status", NS_PLAY_RESET, "Playing and resetting.");
            self.send(RtmpMessage::Command(status), stream_id).await?;
        }
        let status = Command::on_status(stream_id, "status", NS_PLAY_START, "Started playing.");
        self.send(RtmpMessage::Command(status), stream_id).await
    }

    async fn handle_stop(&mut self, cmd: Command) -> Result<()> {
        if cmd.name == CMD_DELETE_STREAM {
            if let Some(id) = cmd.arguments.first().and_then(AmfValue::as_number) {
                self.state.release_stream_id(id as u32);
            }
        }

        let Some(bound) = self.state.stop_stream() else {
            return Ok(());
        };

        if let Some(handle) = self.publisher.take() {
            handle.end();
            let status = Command::on_status(
                bound.stream_id,
                "status",
                NS_UNPUBLISH_SUCCESS,
                &format!("{} is now unpublished.", bound.key),
            );
            self.send(RtmpMessage::Command(status), bound.stream_id)
                .await?;
            tracing::info!(session_id = self.state.id, stream = %bound.key, "Unpublished");
        }
        if self.subscription.take().is_some() {
            tracing::info!(session_id = self.state.id, stream = %bound.key, "Playback stopped");
        }
        Ok(())
    }

    async fn handle_delivery(&mut self, delivery: Delivery) -> Result<()> {
        let Some(stream_id) = self.state.bound().map(|b| b.stream_id) else {
            return Ok(());
        };
        match delivery {
            Delivery::Packet(packet) => {
                if self.awaiting_publisher {
                    self.awaiting_publisher = false;
                    self.send_play_start(stream_id, false).await?;
                }
                self.send_packet(stream_id, &packet).await
            }
            Delivery::Ended => {
                self.send(
                    RtmpMessage::UserControl(UserControlEvent::StreamEof(stream_id)),
                    0,
                )
                .await?;
                let status = Command::on_status(stream_id, "status", NS_PLAY_STOP, "Stream ended.");
                self.send(RtmpMessage::Command(status), stream_id).await?;

                // Keep waiting for the next publisher on the same key
                if let Some(subscription) = self.subscription.as_mut() {
                    subscription.resubscribe();
                    let catchup = subscription.take_catchup();
                    self.awaiting_publisher = true;
                    for packet in catchup {
                        self.send_packet(stream_id, &packet).await?;
                    }
                }
                tracing::debug!(session_id = self.state.id, "Publisher left, player waiting");
                Ok(())
            }
            Delivery::TooSlow => {
                tracing::warn!(session_id = self.state.id, "Disconnecting slow player");
                Err(Error::Rejected("player too slow".into()))
            }
        }
    }

    fn stream_key(&self, stream_name: &str) -> Result<StreamKey> {
        let app = self.state.app().unwrap_or_default();
        StreamKey::try_new(app, stream_name)
            .map_err(|_: RegistryError| ProtocolError::InvalidStreamKey(stream_name.to_string()).into())
    }

    async fn send_packet(&mut self, stream_id: u32, packet: &MediaPacket) -> Result<()> {
        self.send(packet.to_message(stream_id, false), stream_id).await
    }

    /// A peer that stops reading fails the write instead of parking the
    /// session forever
    async fn send(&mut self, message: RtmpMessage, stream_id: u32) -> Result<()> {
        timeout(self.config.write_timeout, self.writer.send(message.into_chunk(stream_id)))
            .await
            .map_err(|_| Error::Timeout)?
    }
}
