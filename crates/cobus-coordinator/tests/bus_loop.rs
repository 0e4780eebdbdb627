//! ---
//! cobus_section: "15-testing-qa-runbook"
//! cobus_subsection: "module"
//! cobus_type: "source"
//! cobus_scope: "code"
//! cobus_description: "Bus run-loop integration tests over the loopback transport."
//! cobus_version: "v0.0.0-prealpha"
//! cobus_owner: "tbd"
//! ---
use std::time::Duration;

use cobus_common::config::{BusOptions, BusTopology, ChannelTopology, SignalKind, BUS_MODEL_UID};
use cobus_coordinator::{Bus, BusError, BusSummary};
use cobus_transport::loopback::LoopbackEndpoint;
use cobus_transport::{
    BinaryWrite, ChannelWrites, Destination, Endpoint, Frame, Incoming, SignalLookup,
};
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CHANNEL: &str = "binary_channel";

fn topology(expected: u32) -> BusTopology {
    let mut signals = IndexMap::new();
    signals.insert("raw".to_owned(), SignalKind::Binary);
    signals.insert("counter".to_owned(), SignalKind::Scalar);
    let mut channels = IndexMap::new();
    channels.insert(
        CHANNEL.to_owned(),
        ChannelTopology {
            expected_model_count: expected,
            signals,
        },
    );
    BusTopology { channels }
}

fn spawn_bus(
    hub: &str,
    expected: u32,
    timeout: Duration,
) -> (
    JoinHandle<Result<BusSummary, BusError>>,
    broadcast::Sender<()>,
) {
    let endpoint = LoopbackEndpoint::create(&format!("loopback://{hub}"), BUS_MODEL_UID, true)
        .expect("bus endpoint");
    let mut options = BusOptions::bus("simbus");
    options.uri = format!("loopback://{hub}");
    options.timeout = timeout;
    let bus = Bus::new(Box::new(endpoint), &topology(expected), options, None).expect("bus");
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    (tokio::spawn(bus.run(shutdown_rx)), shutdown_tx)
}

async fn model(hub: &str, uid: u32) -> LoopbackEndpoint {
    let endpoint =
        LoopbackEndpoint::create(&format!("loopback://{hub}"), uid, false).expect("model endpoint");
    endpoint.start().await.expect("start");
    endpoint
}

async fn register(endpoint: &LoopbackEndpoint, uid: u32, token: u32) {
    endpoint
        .send(
            Destination::Bus,
            Frame::ModelRegister {
                channel: CHANNEL.into(),
                model_uid: uid,
                model_name: format!("model-{uid}"),
                step_size: 0.005,
                token,
            },
        )
        .await
        .expect("send register");
    if token != 0 {
        let incoming = endpoint
            .recv(Duration::from_secs(1))
            .await
            .expect("register ack");
        assert!(matches!(
            incoming,
            Incoming::Frame(Frame::ModelRegisterAck { .. })
        ));
    }
}

async fn resolve_raw_uid(endpoint: &LoopbackEndpoint, uid: u32) -> u32 {
    endpoint
        .send(
            Destination::Bus,
            Frame::SignalIndex {
                channel: CHANNEL.into(),
                model_uid: uid,
                token: 7,
                lookups: vec![SignalLookup {
                    name: "raw".into(),
                    uid: 0,
                }],
            },
        )
        .await
        .expect("send index");
    match endpoint.recv(Duration::from_secs(1)).await.expect("ack") {
        Incoming::Frame(Frame::SignalIndexAck { lookups, .. }) => {
            assert_eq!(lookups.len(), 1);
            assert_ne!(lookups[0].uid, 0);
            lookups[0].uid
        }
        other => panic!("unexpected incoming: {other:?}"),
    }
}

async fn send_binary_ready(endpoint: &LoopbackEndpoint, uid: u32, signal_uid: u32, data: &[u8]) {
    endpoint
        .send(
            Destination::Bus,
            Frame::ModelReady {
                model_uid: uid,
                model_time: 0.0,
                writes: vec![ChannelWrites {
                    channel: CHANNEL.into(),
                    scalars: Vec::new(),
                    binaries: vec![BinaryWrite {
                        uid: signal_uid,
                        data: data.to_vec(),
                    }],
                }],
            },
        )
        .await
        .expect("send ready");
}

async fn expect_start(endpoint: &LoopbackEndpoint) -> (f64, f64, Vec<ChannelWrites>) {
    match endpoint
        .recv(Duration::from_secs(2))
        .await
        .expect("model start")
    {
        Incoming::Frame(Frame::ModelStart {
            model_time,
            schedule_time,
            channels,
        }) => (model_time, schedule_time, channels),
        other => panic!("unexpected incoming: {other:?}"),
    }
}

#[tokio::test]
async fn startup_timeout_exits_with_timeout_error() {
    let (bus_task, _shutdown) = spawn_bus("timeout-run", 2, Duration::from_millis(150));
    let err = bus_task
        .await
        .expect("join")
        .expect_err("bus must fail without models");
    assert!(matches!(err, BusError::StartupTimeout { .. }));
    assert!(err.to_string().starts_with("TimeoutError"));
}

#[tokio::test]
async fn binary_writes_concatenate_in_admission_order() {
    let (bus_task, _shutdown) = spawn_bus("binary-run", 2, Duration::from_secs(1));

    let first = model("binary-run", 1).await;
    let second = model("binary-run", 2).await;
    register(&first, 1, 1).await;
    register(&second, 2, 2).await;
    let raw_uid = resolve_raw_uid(&first, 1).await;

    // The later-admitted session's write arrives first; admission order must
    // still decide the concatenation.
    send_binary_ready(&second, 2, raw_uid, b"one\0").await;
    send_binary_ready(&first, 1, raw_uid, b"one\0").await;

    let (model_time, schedule_time, channels) = expect_start(&first).await;
    assert_eq!(model_time, 0.0);
    assert!((schedule_time - 0.005).abs() < 1e-12);
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].binaries.len(), 1);
    assert_eq!(channels[0].binaries[0].data, b"one\0one\0".to_vec());
    // Both subscribers receive the full combined buffer.
    let (_, _, channels) = expect_start(&second).await;
    assert_eq!(channels[0].binaries[0].data, b"one\0one\0".to_vec());

    // Second cycle.
    send_binary_ready(&first, 1, raw_uid, b"two\0").await;
    send_binary_ready(&second, 2, raw_uid, b"two\0").await;
    let (model_time, _, channels) = expect_start(&first).await;
    assert!((model_time - 0.005).abs() < 1e-12);
    assert_eq!(channels[0].binaries[0].data, b"two\0two\0".to_vec());
    let _ = expect_start(&second).await;

    for (endpoint, uid) in [(&first, 1u32), (&second, 2u32)] {
        endpoint
            .send(Destination::Bus, Frame::ModelExit { model_uid: uid })
            .await
            .expect("exit");
    }
    let summary = bus_task.await.expect("join").expect("bus result");
    assert_eq!(summary.cycles, 2);
}

#[tokio::test]
async fn crashed_session_does_not_deadlock_quorum() {
    let (bus_task, _shutdown) = spawn_bus("crash-run", 2, Duration::from_secs(1));

    let survivor = model("crash-run", 1).await;
    let crasher = model("crash-run", 2).await;
    register(&survivor, 1, 1).await;
    register(&crasher, 2, 2).await;
    let raw_uid = resolve_raw_uid(&survivor, 1).await;

    // Survivor writes; the other session dies before writing anything.
    send_binary_ready(&survivor, 1, raw_uid, b"solo\0").await;
    crasher.close().await.expect("simulated crash");

    // Quorum must close with the remaining session alone.
    let (_, _, channels) = expect_start(&survivor).await;
    assert_eq!(channels[0].binaries[0].data, b"solo\0".to_vec());

    survivor
        .send(Destination::Bus, Frame::ModelExit { model_uid: 1 })
        .await
        .expect("exit");
    let summary = bus_task.await.expect("join").expect("bus result");
    assert_eq!(summary.cycles, 1);
}

#[tokio::test]
async fn scalar_single_writer_is_idempotent_across_cycles() {
    let (bus_task, _shutdown) = spawn_bus("scalar-run", 1, Duration::from_secs(1));
    let writer = model("scalar-run", 9).await;
    register(&writer, 9, 1).await;

    // Resolve the declared scalar uid.
    writer
        .send(
            Destination::Bus,
            Frame::SignalIndex {
                channel: CHANNEL.into(),
                model_uid: 9,
                token: 3,
                lookups: vec![SignalLookup {
                    name: "counter".into(),
                    uid: 0,
                }],
            },
        )
        .await
        .expect("send index");
    let counter_uid = match writer.recv(Duration::from_secs(1)).await.expect("ack") {
        Incoming::Frame(Frame::SignalIndexAck { lookups, .. }) => lookups[0].uid,
        other => panic!("unexpected incoming: {other:?}"),
    };

    for cycle in 1..=3u32 {
        writer
            .send(
                Destination::Bus,
                Frame::ModelReady {
                    model_uid: 9,
                    model_time: 0.0,
                    writes: vec![ChannelWrites {
                        channel: CHANNEL.into(),
                        scalars: vec![cobus_transport::ScalarWrite {
                            uid: counter_uid,
                            value: f64::from(cycle),
                        }],
                        binaries: Vec::new(),
                    }],
                },
            )
            .await
            .expect("ready");
        let (_, _, channels) = expect_start(&writer).await;
        assert_eq!(channels[0].scalars.len(), 1);
        assert_eq!(channels[0].scalars[0].value, f64::from(cycle));
    }

    writer
        .send(Destination::Bus, Frame::ModelExit { model_uid: 9 })
        .await
        .expect("exit");
    let summary = bus_task.await.expect("join").expect("bus result");
    assert_eq!(summary.cycles, 3);
}

#[tokio::test]
async fn external_shutdown_force_flushes_partial_cycles() {
    let (bus_task, shutdown) = spawn_bus("flush-run", 2, Duration::from_secs(1));
    let first = model("flush-run", 1).await;
    let second = model("flush-run", 2).await;
    register(&first, 1, 1).await;
    register(&second, 2, 2).await;
    let raw_uid = resolve_raw_uid(&first, 1).await;

    // Only one of two expected writes arrives: channel stays awaiting quorum.
    send_binary_ready(&first, 1, raw_uid, b"partial\0").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.send(()).expect("signal shutdown");

    // The partial cycle is flushed, then the shutdown frame follows.
    let (_, _, channels) = expect_start(&second).await;
    assert_eq!(channels[0].binaries[0].data, b"partial\0".to_vec());
    let incoming = second.recv(Duration::from_secs(1)).await.expect("shutdown");
    assert!(matches!(incoming, Incoming::Frame(Frame::Shutdown { .. })));

    let summary = bus_task.await.expect("join").expect("bus result");
    assert_eq!(summary.cycles, 1);
}
