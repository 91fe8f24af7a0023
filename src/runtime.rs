//! Serving the tester protocol over an asynchronous byte stream.
//!
//! [`Tester::serve`] wires the pieces together: the pooled decoder reads
//! the transport and feeds the dispatch queue, the dispatcher runs on its
//! own task, and a writer task encodes every reply and event in emission
//! order.

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    task::JoinError,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    codec::FrameCodec,
    config::TesterConfig,
    decoder::FrameDecoder,
    dispatcher::{self, Completer, Dispatcher, Service},
    error::TesterError,
    handler::HandlerEntry,
    pool::BufferPool,
    queue::{QueueSender, SubmitError, dispatch_queue},
    registry::HandlerRegistry,
    response::{EventEmitter, OutboundReceiver, Responder},
};

/// Builder for a [`Tester`].
///
/// ```
/// use btpwire::{
///     handler::{ExpectedLength, HandlerEntry},
///     runtime::Tester,
///     status::Status,
/// };
///
/// let tester = Tester::builder()
///     .register(
///         0x05,
///         [HandlerEntry::new(0x01, ExpectedLength::Empty, |_| {
///             Status::Success.into()
///         })],
///     )
///     .expect("service registers")
///     .build();
/// assert_eq!(tester.pool().available(), 2);
/// ```
pub struct TesterBuilder {
    config: TesterConfig,
    registry: HandlerRegistry,
    catalogue: Vec<Box<dyn Service>>,
}

impl TesterBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = HandlerRegistry::new();
        dispatcher::reserve_core(&mut registry);
        Self {
            config: TesterConfig::default(),
            registry,
            catalogue: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(mut self, config: TesterConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a handler table that is available from the start.
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::Registry`] if the service id is out of range or
    /// reserved, is already registered, or lists an opcode twice.
    pub fn register(
        mut self,
        service: u8,
        handlers: impl IntoIterator<Item = HandlerEntry>,
    ) -> Result<Self, TesterError> {
        self.registry.register(service, handlers)?;
        Ok(self)
    }

    /// Register `service` now and keep it in the catalogue, so the peer can
    /// unregister and register it again.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn register_service(
        mut self,
        mut service: impl Service + 'static,
    ) -> Result<Self, TesterError> {
        self.registry.register(service.id(), service.handlers())?;
        Ok(self.service(service))
    }

    /// Offer `service` for registration by the peer.
    #[must_use]
    pub fn service(mut self, service: impl Service + 'static) -> Self {
        self.catalogue.push(Box::new(service));
        self
    }

    #[must_use]
    pub fn build(self) -> Tester {
        let TesterBuilder {
            config,
            registry,
            catalogue,
        } = self;
        let (responder, outbound) = Responder::channel(config.max_payload());
        let dispatcher = catalogue
            .into_iter()
            .fold(Dispatcher::new(registry, responder), Dispatcher::with_service);
        Tester {
            pool: BufferPool::new(config.pool_slots(), config.max_payload()),
            config,
            dispatcher,
            outbound,
        }
    }
}

impl Default for TesterBuilder {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for TesterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TesterBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field(
                "catalogue",
                &self.catalogue.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A fully assembled tester, ready to serve one transport.
pub struct Tester {
    config: TesterConfig,
    pool: BufferPool,
    dispatcher: Dispatcher,
    outbound: OutboundReceiver,
}

impl Tester {
    #[must_use]
    pub fn builder() -> TesterBuilder { TesterBuilder::new() }

    #[must_use]
    pub fn config(&self) -> &TesterConfig { &self.config }

    /// Pool the decoder draws command slots from.
    #[must_use]
    pub fn pool(&self) -> &BufferPool { &self.pool }

    /// Emitter for events raised outside any handler.
    #[must_use]
    pub fn events(&self) -> EventEmitter { self.dispatcher.events().clone() }

    /// Handle completing the deferred command, for collaborators living
    /// outside the handlers.
    #[must_use]
    pub fn completer(&self) -> Completer { self.dispatcher.completer().clone() }

    /// Serve commands read from `reader` and write replies and events to
    /// `writer` until `reader` reaches end of stream.
    ///
    /// The IUT-ready event is the first frame written. Every frame emitted
    /// before the dispatcher drained the queue is flushed before this
    /// returns. A command still deferred at that point is released without
    /// a reply.
    ///
    /// # Errors
    ///
    /// Returns [`TesterError::Io`] if the transport fails.
    ///
    /// # Panics
    ///
    /// Resumes the panic of the dispatcher task, which only panics on a
    /// handler contract violation.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<(), TesterError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Tester {
            config,
            pool,
            dispatcher,
            outbound,
        } = self;
        info!(
            slots = pool.capacity(),
            mtu = config.mtu(),
            "serving tester protocol"
        );

        let shutdown = CancellationToken::new();
        let (queue_tx, queue_rx) = dispatch_queue(pool.capacity());
        dispatcher.announce_ready();

        let writer_task = tokio::spawn(write_frames(
            writer,
            outbound,
            FrameCodec::new(config.max_payload()),
            shutdown.clone(),
        ));
        let dispatcher_task = tokio::spawn(dispatcher.run(queue_rx));

        let read_result = read_frames(reader, FrameDecoder::new(pool), queue_tx).await;
        let dispatch_result = dispatcher_task.await;
        shutdown.cancel();
        let write_result = writer_task.await;

        joined("dispatcher", dispatch_result)?;
        read_result?;
        joined("writer", write_result)??;
        info!("tester stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Tester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tester")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

fn joined<T>(task: &'static str, result: Result<T, JoinError>) -> Result<T, TesterError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => Err(TesterError::Cancelled(task)),
    }
}

async fn read_frames<R>(
    reader: R,
    decoder: FrameDecoder,
    queue: QueueSender,
) -> Result<(), TesterError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, decoder);
    while let Some(slot) = frames.next().await {
        match queue.submit(slot?) {
            Ok(()) => {}
            Err(SubmitError::Closed) => {
                warn!("dispatcher gone; stopping reader");
                break;
            }
            Err(err) => warn!(error = %err, "dropping decoded frame"),
        }
    }
    debug!("transport reached end of stream");
    Ok(())
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn write_frames<W>(
    writer: W,
    mut outbound: OutboundReceiver,
    codec: FrameCodec,
    shutdown: CancellationToken,
) -> Result<(), TesterError>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, codec);
    loop {
        select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => sink.send(frame).await?,
                None => break,
            },
            () = shutdown.cancelled() => break,
        }
    }
    while let Ok(frame) = outbound.try_recv() {
        sink.feed(frame).await?;
    }
    sink.flush().await?;
    debug!("transport writer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::ExpectedLength,
        registry::RegistryError,
        status::Status,
    };

    fn entry(opcode: u8) -> HandlerEntry {
        HandlerEntry::new(opcode, ExpectedLength::Empty, |_| Status::Success.into())
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let err = Tester::builder()
            .register(0x02, [entry(0x01)])
            .and_then(|b| b.register(0x02, [entry(0x02)]))
            .expect_err("second registration must fail");
        assert!(matches!(
            err,
            TesterError::Registry(RegistryError::AlreadyRegistered(0x02))
        ));
    }

    #[test]
    fn core_service_id_is_reserved() {
        let err = Tester::builder()
            .register(0x00, [entry(0x01)])
            .map(TesterBuilder::build)
            .expect_err("core id is reserved");
        assert!(matches!(
            err,
            TesterError::Registry(RegistryError::OutOfRange(0x00))
        ));
    }

    #[test]
    fn pool_follows_config() {
        let config = TesterConfig::new(3, 64).expect("valid config");
        let tester = Tester::builder().config(config).build();
        assert_eq!(tester.pool().capacity(), 3);
        assert_eq!(tester.pool().max_payload(), 59);
    }
}
