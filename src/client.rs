//! Host-side client driving a tester over a byte stream.
//!
//! The client sends one command at a time and waits for its reply. Events
//! arriving in the meantime are kept in a bounded queue; when the queue is
//! full the oldest event is discarded.

use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_util::codec::Framed;

use crate::{
    codec::FrameCodec,
    config::ClientConfig,
    frame::{Frame, OpcodeKind, STATUS_OPCODE},
    status::Status,
};

/// Stream types the client can drive.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin {}
impl<T> ClientStream for T where T: AsyncRead + AsyncWrite + Unpin {}

/// Errors emitted by [`TesterClient`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or codec error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// The tester closed the connection.
    #[error("connection closed by tester")]
    Disconnected,
    /// No reply arrived in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// A frame arrived that does not answer the pending command.
    #[error("unexpected response {service:#04x}/{opcode:#04x}")]
    UnexpectedResponse { service: u8, opcode: u8 },
    /// A status frame did not carry exactly one known status code.
    #[error("malformed status payload {0:02x?}")]
    InvalidStatus(Bytes),
    /// The command payload exceeds what one frame can carry.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Reply to a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub service: u8,
    pub opcode: u8,
    pub index: u8,
    pub status: Status,
    /// Reply payload; always empty unless `status` is success.
    pub payload: Bytes,
}

impl Response {
    fn from_frame(frame: Frame) -> Result<Self, ClientError> {
        if frame.opcode != STATUS_OPCODE {
            return Ok(Self {
                service: frame.service,
                opcode: frame.opcode,
                index: frame.index,
                status: Status::Success,
                payload: frame.payload,
            });
        }
        let status = match frame.payload.as_ref() {
            &[code] => Status::from_code(code),
            _ => None,
        }
        .ok_or_else(|| ClientError::InvalidStatus(frame.payload.clone()))?;
        Ok(Self {
            service: frame.service,
            opcode: frame.opcode,
            index: frame.index,
            status,
            payload: Bytes::new(),
        })
    }

    #[must_use]
    pub fn is_success(&self) -> bool { self.status.is_success() }
}

/// Client for a tester reachable over `T`.
pub struct TesterClient<T: ClientStream = TcpStream> {
    framed: Framed<T, FrameCodec>,
    config: ClientConfig,
    events: VecDeque<Frame>,
}

impl TesterClient<TcpStream> {
    /// Connect to a tester listening on `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Io`] if the connection fails.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, config))
    }
}

impl<T: ClientStream> TesterClient<T> {
    /// Drive a tester over an established stream.
    pub fn new(stream: T, config: ClientConfig) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new(config.max_payload())),
            events: VecDeque::with_capacity(config.event_capacity()),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig { &self.config }

    /// Number of events received but not yet consumed.
    #[must_use]
    pub fn pending_events(&self) -> usize { self.events.len() }

    /// Send a command and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::PayloadTooLarge`] before sending anything if
    /// `payload` does not fit a frame, [`ClientError::Timeout`] if no reply
    /// arrives within the configured timeout, and
    /// [`ClientError::UnexpectedResponse`] if the reply does not echo the
    /// command's service and opcode.
    pub async fn send(
        &mut self,
        service: u8,
        opcode: u8,
        index: u8,
        payload: &[u8],
    ) -> Result<Response, ClientError> {
        let max = self.config.max_payload();
        if payload.len() > max {
            return Err(ClientError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        debug!("sending command {service:#04x}/{opcode:#04x} index {index:#04x}");
        self.framed
            .send(Frame::new(service, opcode, index, Bytes::copy_from_slice(payload)))
            .await?;

        let timeout = self.config.response_timeout();
        let frame = tokio::time::timeout(timeout, self.next_response())
            .await
            .map_err(|_| ClientError::Timeout(timeout))??;
        if frame.service != service || (frame.opcode != opcode && frame.opcode != STATUS_OPCODE) {
            return Err(ClientError::UnexpectedResponse {
                service: frame.service,
                opcode: frame.opcode,
            });
        }
        Response::from_frame(frame)
    }

    /// Wait for the event `service`/`opcode`, discarding every other event.
    ///
    /// There is no timeout; wrap the call in [`tokio::time::timeout`] if one
    /// is needed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnexpectedResponse`] if a non-event frame
    /// arrives while waiting.
    pub async fn wait_for_event(
        &mut self,
        service: u8,
        opcode: u8,
    ) -> Result<Frame, ClientError> {
        loop {
            let event = match self.events.pop_front() {
                Some(event) => event,
                None => self.next_event().await?,
            };
            if event.service == service && event.opcode == opcode {
                return Ok(event);
            }
            debug!(
                "discarding event {:#04x}/{:#04x} while waiting for {service:#04x}/{opcode:#04x}",
                event.service, event.opcode
            );
        }
    }

    /// Take the oldest queued event, reading one from the tester if none is
    /// queued.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnexpectedResponse`] if a non-event frame
    /// arrives.
    pub async fn recv_event(&mut self) -> Result<Frame, ClientError> {
        match self.events.pop_front() {
            Some(event) => Ok(event),
            None => self.next_event().await,
        }
    }

    async fn next_event(&mut self) -> Result<Frame, ClientError> {
        let frame = self.next_frame().await?;
        if frame.kind() == OpcodeKind::Event {
            Ok(frame)
        } else {
            Err(ClientError::UnexpectedResponse {
                service: frame.service,
                opcode: frame.opcode,
            })
        }
    }

    async fn next_response(&mut self) -> Result<Frame, ClientError> {
        loop {
            let frame = self.next_frame().await?;
            if frame.kind() != OpcodeKind::Event {
                return Ok(frame);
            }
            self.queue_event(frame);
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        match self.framed.next().await {
            Some(frame) => Ok(frame?),
            None => Err(ClientError::Disconnected),
        }
    }

    fn queue_event(&mut self, event: Frame) {
        if self.events.len() >= self.config.event_capacity()
            && let Some(dropped) = self.events.pop_front()
        {
            warn!(
                "event queue full; dropping event {:#04x}/{:#04x}",
                dropped.service, dropped.opcode
            );
        }
        self.events.push_back(event);
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> T { self.framed.into_inner() }
}

impl<T: ClientStream> std::fmt::Debug for TesterClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesterClient")
            .field("config", &self.config)
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}
