//! Outbound RTMP connection
//!
//! Drives the client side of the protocol far enough to publish: TCP
//! connect, handshake, `connect`, then `releaseStream`/`FCPublish`/
//! `createStream`/`publish`. After `NetStream.Publish.Start` the caller
//! pushes media with [`RtmpConnector::send_packet`] and feeds whatever
//! [`RtmpConnector::next_message`] yields to
//! [`RtmpConnector::handle_control`]. Every write is bounded by the
//! configured write timeout.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::amf::{AmfObject, AmfValue};
use crate::error::{Error, RelayError, Result};
use crate::media::packet::MediaPacket;
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder};
use crate::protocol::constants::*;
use crate::protocol::handshake;
use crate::protocol::message::{Command, RtmpMessage, UserControlEvent};

use super::config::ClientConfig;

/// A connected (and possibly publishing) RTMP client session
pub struct RtmpConnector {
    config: ClientConfig,
    reader: FramedRead<ReadHalf<TcpStream>, ChunkDecoder>,
    writer: FramedWrite<WriteHalf<TcpStream>, ChunkEncoder>,
    next_transaction_id: u32,
    /// Invocations still waiting for `_result`/`_error`
    pending: HashMap<u32, &'static str>,
    /// Message stream we publish on, once `createStream` answered
    stream_id: Option<u32>,
    publishing: bool,
    window_ack_size: u32,
    last_ack: u64,
}

impl RtmpConnector {
    /// Open the TCP connection, handshake and `connect` to the application
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let addr = config.url.socket_addr();
        let mut socket = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(RelayError::Connect(format!("{}: {}", addr, e)).into()),
            Err(_) => return Err(RelayError::Connect(format!("{}: connect timed out", addr)).into()),
        };
        if config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }
        }

        handshake::connect(&mut socket, config.handshake_timeout)
            .await
            .map_err(|e| match e {
                Error::Io(e) => Error::Relay(RelayError::Connect(e.to_string())),
                other => other,
            })?;
        tracing::debug!(addr = %addr, "Client handshake complete");

        let (read_half, write_half) = tokio::io::split(socket);
        let mut connector = Self {
            config,
            reader: FramedRead::new(read_half, ChunkDecoder::new()),
            writer: FramedWrite::new(write_half, ChunkEncoder::new()),
            next_transaction_id: 1,
            pending: HashMap::new(),
            stream_id: None,
            publishing: false,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            last_ack: 0,
        };

        let chunk_size = connector.config.chunk_size;
        connector.send(RtmpMessage::SetChunkSize(chunk_size), 0).await?;
        connector.writer.encoder_mut().set_chunk_size(chunk_size);

        connector.connect_app().await?;
        Ok(connector)
    }

    async fn connect_app(&mut self) -> Result<()> {
        let url = &self.config.url;
        let object = AmfObject::new()
            .with("app", url.app.as_str())
            .with("type", "nonprivate")
            .with("flashVer", self.config.flash_ver.as_str())
            .with("tcUrl", url.tc_url())
            .with("fpad", false)
            .with("capabilities", 15.0)
            .with("audioCodecs", 3191.0)
            .with("videoCodecs", 252.0)
            .with("videoFunction", 1.0)
            .with("objectEncoding", 0.0);

        let transaction_id = self
            .invoke(CMD_CONNECT, object.into(), Vec::new(), 0)
            .await?;
        let reply = self.await_result(transaction_id).await?;
        tracing::debug!(
            app = %self.config.url.app,
            code = reply.status_code().unwrap_or_default(),
            "Connected to application"
        );
        Ok(())
    }

    /// Create a stream and publish `stream_name` on it
    ///
    /// Returns once the server answers `NetStream.Publish.Start`. An
    /// `_error` reply or an error-level status becomes `RelayError::Auth`.
    pub async fn publish(&mut self, stream_name: &str) -> Result<()> {
        let name = AmfValue::from(stream_name);
        self.invoke(CMD_RELEASE_STREAM, AmfValue::Null, vec![name.clone()], 0)
            .await?;
        self.invoke(CMD_FC_PUBLISH, AmfValue::Null, vec![name.clone()], 0)
            .await?;
        let transaction_id = self
            .invoke(CMD_CREATE_STREAM, AmfValue::Null, Vec::new(), 0)
            .await?;
        let reply = self.await_result(transaction_id).await?;
        let stream_id = reply
            .arguments
            .first()
            .and_then(AmfValue::as_number)
            .map(|id| id as u32)
            .ok_or_else(|| RelayError::Auth("createStream returned no stream id".into()))?;
        self.stream_id = Some(stream_id);

        self.invoke(CMD_PUBLISH, AmfValue::Null, vec![name, "live".into()], stream_id)
            .await?;

        timeout(self.config.response_timeout, self.await_publish_start())
            .await
            .map_err(|_| Error::Timeout)??;

        self.publishing = true;
        tracing::debug!(stream_id, "Publish started");
        Ok(())
    }

    /// Send one media packet on the publishing stream, metadata re-wrapped
    /// in `@setDataFrame`
    pub async fn send_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        let stream_id = match (self.publishing, self.stream_id) {
            (true, Some(id)) => id,
            _ => return Err(Error::Rejected("not publishing".into())),
        };
        self.send(packet.to_message(stream_id, true), stream_id)
            .await
    }

    /// Next inbound message. Cancel safe, for use in `select!`.
    pub async fn next_message(&mut self) -> Result<RtmpMessage> {
        let chunk = self.reader.next().await.ok_or(Error::ConnectionClosed)??;
        RtmpMessage::from_chunk(&chunk)
    }

    /// React to a message that is not part of a pending exchange
    pub async fn handle_control(&mut self, message: RtmpMessage) -> Result<()> {
        match message {
            RtmpMessage::UserControl(UserControlEvent::PingRequest(timestamp)) => {
                self.send(
                    RtmpMessage::UserControl(UserControlEvent::PingResponse(timestamp)),
                    0,
                )
                .await?;
            }
            RtmpMessage::WindowAckSize(size) => self.window_ack_size = size,
            RtmpMessage::Command(cmd) => self.handle_command(cmd)?,
            other => {
                tracing::trace!(message = ?other, "Control message");
            }
        }
        self.acknowledge().await
    }

    fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd.name.as_str() {
            CMD_RESULT | CMD_ERROR => {
                let id = cmd.transaction_id as u32;
                if let Some(command) = self.pending.remove(&id) {
                    tracing::trace!(command, reply = %cmd.name, "Late reply");
                }
                Ok(())
            }
            CMD_ON_STATUS if self.publishing && cmd.status_level() == Some("error") => {
                let code = cmd.status_code().unwrap_or_default().to_string();
                Err(RelayError::Auth(code).into())
            }
            _ => {
                tracing::trace!(command = %cmd.name, "Ignoring command");
                Ok(())
            }
        }
    }

    async fn acknowledge(&mut self) -> Result<()> {
        let consumed = self.reader.decoder().bytes_consumed();
        if self.window_ack_size > 0
            && consumed.saturating_sub(self.last_ack) >= u64::from(self.window_ack_size)
        {
            self.last_ack = consumed;
            self.send(
                RtmpMessage::Acknowledgement {
                    sequence: consumed as u32,
                },
                0,
            )
            .await?;
        }
        Ok(())
    }

    async fn invoke(
        &mut self,
        name: &'static str,
        object: AmfValue,
        arguments: Vec<AmfValue>,
        stream_id: u32,
    ) -> Result<u32> {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id += 1;
        self.pending.insert(transaction_id, name);

        let cmd = Command::new(name, f64::from(transaction_id), object, arguments).on_stream(stream_id);
        self.send(RtmpMessage::Command(cmd), stream_id).await?;
        Ok(transaction_id)
    }

    /// Wait for `_result` of `transaction_id`, servicing everything else
    async fn await_result(&mut self, transaction_id: u32) -> Result<Command> {
        timeout(self.config.response_timeout, self.read_until_result(transaction_id))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn read_until_result(&mut self, transaction_id: u32) -> Result<Command> {
        loop {
            match self.next_message().await? {
                RtmpMessage::Command(cmd)
                    if cmd.transaction_id as u32 == transaction_id
                        && (cmd.name == CMD_RESULT || cmd.name == CMD_ERROR) =>
                {
                    let command = self.pending.remove(&transaction_id).unwrap_or("invoke");
                    if cmd.name == CMD_ERROR {
                        let reason = cmd
                            .status_code()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("{} refused", command));
                        return Err(RelayError::Auth(reason).into());
                    }
                    return Ok(cmd);
                }
                other => self.handle_control(other).await?,
            }
        }
    }

    async fn await_publish_start(&mut self) -> Result<()> {
        loop {
            let message = self.next_message().await?;
            if let RtmpMessage::Command(cmd) = &message {
                if cmd.name == CMD_ON_STATUS {
                    let code = cmd.status_code().unwrap_or_default();
                    if code == NS_PUBLISH_START {
                        return Ok(());
                    }
                    if cmd.status_level() == Some("error") {
                        return Err(RelayError::Auth(code.to_string()).into());
                    }
                    continue;
                }
            }
            self.handle_control(message).await?;
        }
    }

    async fn send(&mut self, message: RtmpMessage, stream_id: u32) -> Result<()> {
        timeout(self.config.write_timeout, self.writer.send(message.into_chunk(stream_id)))
            .await
            .map_err(|_| Error::Timeout)?
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
