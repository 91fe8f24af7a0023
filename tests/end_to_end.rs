//! End-to-end tests serving a tester over an in-memory duplex stream.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use btpwire::{
    BufferPool,
    ClientConfig,
    Completer,
    ExpectedLength,
    Frame,
    FrameCodec,
    HandlerEntry,
    INDEX_NONE,
    Outcome,
    Status,
    Tester,
    TesterClient,
    TesterConfig,
    TesterError,
    dispatcher::{
        CORE_SERVICE_ID,
        EV_IUT_READY,
        OP_READ_SUPPORTED_SERVICES,
        OP_REGISTER_SERVICE,
        OP_UNREGISTER_SERVICE,
    },
    echo::{self, ECHO_SERVICE_ID, EV_ECHOED, EchoService},
    frame::STATUS_OPCODE,
};
use futures::{SinkExt, StreamExt};
use rstest::{fixture, rstest};
use tokio::{
    io::{DuplexStream, duplex},
    runtime::Handle,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::Framed;

const TEST_SERVICE: u8 = 0x02;

fn serve(tester: Tester) -> (DuplexStream, JoinHandle<Result<(), TesterError>>) {
    let (controller, iut) = duplex(4096);
    let (reader, writer) = tokio::io::split(iut);
    (controller, tokio::spawn(tester.serve(reader, writer)))
}

async fn stopped(server: JoinHandle<Result<(), TesterError>>) {
    server
        .await
        .expect("tester task panicked")
        .expect("tester failed");
}

async fn wait_until_idle(pool: &BufferPool) {
    timeout(Duration::from_secs(1), async {
        while pool.available() != pool.capacity() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("all slots released");
}

#[fixture]
fn calls() -> Arc<AtomicUsize> { Arc::new(AtomicUsize::new(0)) }

fn counting_tester(calls: &Arc<AtomicUsize>) -> Tester {
    let calls = Arc::clone(calls);
    Tester::builder()
        .register(
            0x01,
            [HandlerEntry::new(0x01, ExpectedLength::Empty, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Status::Success.into()
            })],
        )
        .expect("register service")
        .build()
}

#[rstest]
#[tokio::test]
async fn empty_command_gets_empty_success_reply(calls: Arc<AtomicUsize>) {
    let (io, server) = serve(counting_tester(&calls));
    let mut client = TesterClient::new(io, ClientConfig::default());

    let ready = client.recv_event().await.expect("ready event");
    assert_eq!(ready, Frame::event(CORE_SERVICE_ID, EV_IUT_READY, Vec::new()));

    let response = client.send(0x01, 0x01, 0x00, &[]).await.expect("response");
    assert_eq!(
        (response.service, response.opcode, response.index),
        (0x01, 0x01, 0x00)
    );
    assert_eq!(response.status, Status::Success);
    assert!(response.payload.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(client);
    stopped(server).await;
}

#[rstest]
#[tokio::test]
async fn wrong_length_is_rejected_without_invoking_handler(calls: Arc<AtomicUsize>) {
    let (io, server) = serve(counting_tester(&calls));
    let mut client = TesterClient::new(io, ClientConfig::default());

    let response = client.send(0x01, 0x01, 0x00, &[0x42]).await.expect("response");
    assert_eq!(
        (response.service, response.opcode, response.index),
        (0x01, STATUS_OPCODE, 0x00)
    );
    assert_eq!(response.status, Status::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let response = client.send(0x07, 0x01, 0x00, &[]).await.expect("response");
    assert_eq!(response.status, Status::UnknownCommand);

    drop(client);
    stopped(server).await;
}

fn deferring_tester(config: TesterConfig) -> Tester {
    Tester::builder()
        .config(config)
        .register(
            TEST_SERVICE,
            [
                HandlerEntry::new(0x01, ExpectedLength::Fixed(1), |_| Outcome::Deferred),
                HandlerEntry::new(0x02, ExpectedLength::Empty, |_| Status::Success.into()),
            ],
        )
        .expect("register service")
        .register_service(EchoService::new(Handle::current()))
        .expect("register echo")
        .build()
}

async fn next_frame(peer: &mut Framed<DuplexStream, FrameCodec>) -> Frame {
    timeout(Duration::from_secs(1), peer.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("valid frame")
}

async fn nothing_within(peer: &mut Framed<DuplexStream, FrameCodec>, wait: Duration) {
    assert!(
        timeout(wait, peer.next()).await.is_err(),
        "no frame expected yet"
    );
}

#[tokio::test]
async fn deferred_reply_arrives_on_completion() {
    let tester = deferring_tester(TesterConfig::default());
    let completer: Completer = tester.completer();
    let pool = tester.pool().clone();
    let (io, server) = serve(tester);
    let mut peer = Framed::new(io, FrameCodec::default());
    assert_eq!(next_frame(&mut peer).await.opcode, EV_IUT_READY);

    peer.send(Frame::new(TEST_SERVICE, 0x01, 0x00, vec![9]))
        .await
        .expect("send deferred command");
    nothing_within(&mut peer, Duration::from_millis(50)).await;
    assert!(completer.is_pending());
    assert_eq!(pool.available(), pool.capacity() - 1);

    // The dispatcher keeps serving while the reply is outstanding.
    peer.send(Frame::new(TEST_SERVICE, 0x02, 0x00, Vec::new()))
        .await
        .expect("send command");
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::new(TEST_SERVICE, 0x02, 0x00, Vec::new())
    );

    completer.complete(Status::Success, &[0xab]);
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::new(TEST_SERVICE, 0x01, 0x00, vec![0xab])
    );
    wait_until_idle(&pool).await;

    drop(peer);
    stopped(server).await;
}

#[tokio::test]
async fn exhausted_pool_drops_frames_then_recovers() {
    let config = TesterConfig::default()
        .with_pool_slots(1)
        .expect("valid config");
    let tester = deferring_tester(config);
    let completer = tester.completer();
    let (io, server) = serve(tester);
    let mut peer = Framed::new(io, FrameCodec::default());
    assert_eq!(next_frame(&mut peer).await.opcode, EV_IUT_READY);

    peer.send(Frame::new(TEST_SERVICE, 0x01, 0x00, vec![1]))
        .await
        .expect("send deferred command");
    timeout(Duration::from_secs(1), async {
        while !completer.is_pending() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("command deferred");

    peer.send(Frame::new(TEST_SERVICE, 0x02, 0x00, Vec::new()))
        .await
        .expect("send dropped command");
    nothing_within(&mut peer, Duration::from_millis(50)).await;

    completer.complete(Status::NotReady, &[]);
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::status(TEST_SERVICE, 0x00, Status::NotReady)
    );

    peer.send(Frame::new(TEST_SERVICE, 0x02, 0x00, Vec::new()))
        .await
        .expect("send command");
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::new(TEST_SERVICE, 0x02, 0x00, Vec::new())
    );

    drop(peer);
    stopped(server).await;
}

#[tokio::test]
async fn deferred_echo_emits_event_before_reply() {
    let tester = deferring_tester(TesterConfig::default());
    let pool = tester.pool().clone();
    let (io, server) = serve(tester);
    let mut client = TesterClient::new(io, ClientConfig::default());

    let response = client
        .send(ECHO_SERVICE_ID, echo::OP_DEFERRED_ECHO, 0x00, b"later")
        .await
        .expect("deferred echo");
    assert_eq!(response.status, Status::Success);
    assert_eq!(response.payload.as_ref(), b"later");

    let event = client
        .wait_for_event(ECHO_SERVICE_ID, EV_ECHOED)
        .await
        .expect("echoed event");
    assert_eq!(event.index, INDEX_NONE);
    assert_eq!(event.payload.as_ref(), b"later");
    wait_until_idle(&pool).await;

    drop(client);
    stopped(server).await;
}

#[tokio::test]
async fn deferred_echo_is_refused_while_another_command_is_deferred() {
    let tester = deferring_tester(TesterConfig::default());
    let completer = tester.completer();
    let (io, server) = serve(tester);
    let mut peer = Framed::new(io, FrameCodec::default());
    assert_eq!(next_frame(&mut peer).await.opcode, EV_IUT_READY);

    peer.send(Frame::new(TEST_SERVICE, 0x01, 0x00, vec![1]))
        .await
        .expect("send deferred command");
    peer.send(Frame::new(ECHO_SERVICE_ID, echo::OP_DEFERRED_ECHO, 0x00, b"busy".to_vec()))
        .await
        .expect("send deferred echo");
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::status(ECHO_SERVICE_ID, 0x00, Status::NotReady)
    );
    assert!(completer.is_pending());

    completer.complete(Status::Success, &[]);
    assert_eq!(
        next_frame(&mut peer).await,
        Frame::new(TEST_SERVICE, 0x01, 0x00, Vec::new())
    );

    drop(peer);
    stopped(server).await;
}

#[tokio::test]
async fn core_service_manages_the_catalogue() {
    let tester = Tester::builder()
        .service(EchoService::new(Handle::current()))
        .build();
    let (io, server) = serve(tester);
    let mut client = TesterClient::new(io, ClientConfig::default());

    let services = client
        .send(CORE_SERVICE_ID, OP_READ_SUPPORTED_SERVICES, INDEX_NONE, &[])
        .await
        .expect("supported services");
    assert_eq!(services.payload.as_ref(), &[0b0000_0011]);

    let echo_call = client
        .send(ECHO_SERVICE_ID, echo::OP_ECHO, 0x00, b"hi")
        .await
        .expect("echo before registration");
    assert_eq!(echo_call.status, Status::UnknownCommand);

    let registered = client
        .send(CORE_SERVICE_ID, OP_REGISTER_SERVICE, INDEX_NONE, &[ECHO_SERVICE_ID])
        .await
        .expect("register echo");
    assert!(registered.is_success());

    let commands = client
        .send(ECHO_SERVICE_ID, echo::OP_READ_SUPPORTED_COMMANDS, 0x00, &[])
        .await
        .expect("echo commands");
    assert_eq!(commands.payload.as_ref(), &[0b0000_1110]);

    let echoed = client
        .send(ECHO_SERVICE_ID, echo::OP_ECHO, 0x00, b"hi")
        .await
        .expect("echo");
    assert_eq!(echoed.payload.as_ref(), b"hi");

    let unregistered = client
        .send(CORE_SERVICE_ID, OP_UNREGISTER_SERVICE, INDEX_NONE, &[ECHO_SERVICE_ID])
        .await
        .expect("unregister echo");
    assert!(unregistered.is_success());

    let echo_call = client
        .send(ECHO_SERVICE_ID, echo::OP_ECHO, 0x00, b"hi")
        .await
        .expect("echo after unregistration");
    assert_eq!(echo_call.status, Status::UnknownCommand);

    drop(client);
    stopped(server).await;
}

#[tokio::test]
async fn events_raised_outside_handlers_reach_the_controller() {
    let tester = Tester::builder().build();
    let events = tester.events();
    let (io, server) = serve(tester);
    let mut client = TesterClient::new(io, ClientConfig::default());

    events.emit(0x03, 0x81, &[1, 2, 3]);
    let event = client.wait_for_event(0x03, 0x81).await.expect("event");
    assert_eq!(event, Frame::event(0x03, 0x81, vec![1, 2, 3]));

    drop(client);
    stopped(server).await;
}
