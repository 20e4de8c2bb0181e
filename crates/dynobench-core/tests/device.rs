// Integration tests for the bench device state machine
// Runs the device against the in-memory fake bench

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    config, eventually, telemetry_frame, text_frame, Bench, BenchOptions, Recorder, BENCH_ID,
};
use dynobench_core::prelude::*;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

async fn connected(options: BenchOptions) -> (Device, Bench, Arc<Recorder>, CancelSignal) {
    let (connector, bench) = Bench::spawn(options);
    let recorder = Recorder::new();
    let device = Device::with_connector(config(), connector, recorder.clone());
    let session = CancelSignal::new();
    device
        .startup(&session)
        .await
        .expect("startup failed");
    (device, bench, recorder, session)
}

#[tokio::test]
async fn test_startup_identifies_and_connects() {
    let (device, mut bench, recorder, _session) = connected(BenchOptions::default()).await;

    assert_eq!(device.status(), DeviceStatus::Connected);
    assert_eq!(device.id().as_deref(), Some(BENCH_ID));
    assert_eq!(recorder.connects(), 1);
    assert_eq!(bench.next_command().await.as_deref(), Some("/id"));

    device.teardown().await;
    assert_eq!(device.status(), DeviceStatus::Disconnected);
    assert_eq!(recorder.disconnects(), 1);
}

#[tokio::test]
async fn test_control_writes_command_line() {
    let (device, mut bench, _recorder, _session) = connected(BenchOptions::default()).await;
    assert_eq!(bench.next_command().await.as_deref(), Some("/id"));

    let reply = device
        .control("brake", &[10.into(), "20".into()])
        .await
        .expect("brake failed");
    assert_eq!(reply.as_deref(), Some("OK"));
    assert_eq!(bench.next_command().await.as_deref(), Some("/brake=10,20"));

    // cached, no second round trip
    let id = device.control("id", &[]).await.expect("id failed");
    assert_eq!(id.as_deref(), Some(BENCH_ID));

    let none = device
        .control_with_deadline("tare", &[], Duration::ZERO)
        .await
        .expect("tare failed");
    assert_eq!(none, None);
    assert_eq!(bench.next_command().await.as_deref(), Some("/tare"));

    device.teardown().await;
}

#[tokio::test]
async fn test_control_rejects_bad_calls() {
    let (device, _bench, _recorder, _session) = connected(BenchOptions::default()).await;

    assert!(matches!(
        device.control("warp", &[]).await,
        Err(DeviceError::UnknownCommand(_))
    ));
    assert!(matches!(
        device.control("brake", &[1.into()]).await,
        Err(DeviceError::Arity { expected: 2, got: 1, .. })
    ));
    assert!(matches!(
        device.control("throttle", &["full".into()]).await,
        Err(DeviceError::InvalidArgument { .. })
    ));

    device.teardown().await;
}

#[tokio::test]
async fn test_control_times_out_without_response() {
    let (device, _bench, _recorder, _session) = connected(BenchOptions {
        identify: true,
        ack: false,
    })
    .await;

    let started = Instant::now();
    let err = device
        .control("brake", &[10.into(), 20.into()])
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, DeviceError::ControlTimeout { command: "brake", .. }));
    assert!(elapsed >= Duration::from_millis(200), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "returned late: {:?}", elapsed);

    device.teardown().await;
}

#[tokio::test]
async fn test_telemetry_delivered_in_order() {
    let (device, bench, recorder, _session) = connected(BenchOptions::default()).await;

    bench.send(telemetry_frame(&[(0x1000, 1), (0x1009, 1000)]));
    // corrupt trailer: dropped, the session goes on
    let mut corrupt = telemetry_frame(&[(0x1000, 99)]);
    let crc = corrupt.len() - 5;
    corrupt[crc] ^= 0x01;
    bench.send(corrupt);
    bench.send(b"line noise".to_vec());
    bench.send(telemetry_frame(&[(0x1000, 2), (0x1008, 250)]));
    bench.send(telemetry_frame(&[(0x1000, 3), (0x4242, 7)]));

    assert!(eventually(|| recorder.samples().len() >= 3).await);

    let samples = recorder.samples();
    let ts: Vec<i32> = samples.iter().map(|t| t.ts).collect();
    assert_eq!(ts, vec![1, 2, 3]);
    assert_eq!(samples[0].motor_u, 1.6);
    assert_eq!(samples[1].motor_i, 2.5);
    assert_eq!(device.status(), DeviceStatus::Connected);

    device.teardown().await;
}

#[tokio::test]
async fn test_empty_text_frame_does_not_answer() {
    let (device, bench, _recorder, _session) = connected(BenchOptions {
        identify: true,
        ack: false,
    })
    .await;

    let feeder = bench.feeder();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = feeder.send(text_frame(""));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = feeder.send(text_frame("late"));
    });

    let reply = device.control("tare", &[]).await.expect("tare failed");
    assert_eq!(reply.as_deref(), Some("late"));

    device.teardown().await;
}

#[tokio::test]
async fn test_unplug_disconnects_once() {
    let (device, bench, recorder, session) = connected(BenchOptions::default()).await;

    bench.unplug();

    assert!(eventually(|| device.status() == DeviceStatus::Disconnected).await);
    assert_eq!(recorder.disconnects(), 1);
    assert!(!session.is_cancelled());

    device.teardown().await;
    assert_eq!(recorder.disconnects(), 1);
    assert!(matches!(
        device.control("tare", &[]).await,
        Err(DeviceError::NotOpen) | Err(DeviceError::Cancelled)
    ));
}

#[tokio::test]
async fn test_teardown_during_identification() {
    let (connector, _bench) = Bench::spawn(BenchOptions {
        identify: false,
        ack: false,
    });
    let recorder = Recorder::new();
    let device = Device::with_connector(config(), connector, recorder.clone());

    let starting = device.clone();
    let startup = tokio::spawn(async move { starting.startup(&CancelSignal::new()).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(device.status(), DeviceStatus::Identifying);
    device.teardown().await;

    let result = startup.await.expect("startup task panicked");
    assert!(result.is_err());
    assert_eq!(device.status(), DeviceStatus::Disconnected);
    assert_eq!(recorder.connects(), 0);
    assert_eq!(recorder.disconnects(), 0);
}

#[tokio::test]
async fn test_identification_timeout() {
    let (connector, _bench) = Bench::spawn(BenchOptions {
        identify: false,
        ack: true,
    });
    let recorder = Recorder::new();
    let device = Device::with_connector(config(), connector, recorder.clone());

    let started = Instant::now();
    let err = device.startup(&CancelSignal::new()).await.unwrap_err();

    assert!(matches!(err, DeviceError::ControlTimeout { command: "id", .. }));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(device.id().is_none());
    assert_eq!(recorder.connects(), 0);
    assert_eq!(device.status(), DeviceStatus::Disconnected);
}

#[tokio::test]
async fn test_open_failure_is_reported() {
    let (connector, _bench) = Bench::spawn(BenchOptions::default());
    let device = Device::with_connector(config(), connector, Recorder::new());

    device
        .startup(&CancelSignal::new())
        .await
        .expect("first startup failed");
    device.teardown().await;

    // the stream connector hands out its pipe only once
    let err = device.startup(&CancelSignal::new()).await.unwrap_err();
    assert!(matches!(err, DeviceError::Open { .. }));
}

#[tokio::test]
async fn test_keepalive_pings_on_schedule() {
    let (device, mut bench, _recorder, _session) = connected(BenchOptions {
        identify: true,
        ack: false,
    })
    .await;
    assert_eq!(bench.next_command().await.as_deref(), Some("/id"));

    let since = Instant::now();
    tokio::time::sleep(Duration::from_millis(350)).await;
    let pings = bench.pings_since(since);
    assert!(pings >= 3, "only {} pings in 350ms", pings);

    // the bench never answers pings; a pending command still gets its reply
    let feeder = bench.feeder();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = feeder.send(text_frame("OK"));
    });
    let reply = device.control("tare", &[]).await.expect("tare failed");
    assert_eq!(reply.as_deref(), Some("OK"));
    assert_eq!(bench.next_command().await.as_deref(), Some("/tare"));

    let after = Instant::now();
    assert!(eventually(|| bench.pings_since(after) >= 2).await);

    device.teardown().await;
}

#[tokio::test]
async fn test_stalled_bench_does_not_block_control_or_teardown() {
    let (host, peer) = tokio::io::duplex(64);
    let (release, held) = tokio::sync::oneshot::channel::<()>();

    // answers `/id` once, then never reads again
    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(peer);
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line == "/id" {
                let _ = writer.write_all(&text_frame(BENCH_ID)).await;
                break;
            }
        }
        let _ = held.await;
        drop((lines, writer));
    });

    let mut settings = config();
    settings.keepalive_interval_ms = 10;
    let recorder = Recorder::new();
    let device = Device::with_connector(settings, StreamConnector::new(host), recorder.clone());
    device
        .startup(&CancelSignal::new())
        .await
        .expect("startup failed");

    // keepalive fills the pipe
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let result = device.control("tare", &[]).await;
    let elapsed = started.elapsed();
    assert!(
        matches!(result, Err(DeviceError::ControlTimeout { command: "tare", .. })),
        "unexpected result: {:?}",
        result
    );
    assert!(elapsed < Duration::from_millis(600), "returned late: {:?}", elapsed);

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), device.teardown())
        .await
        .expect("teardown blocked");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(device.status(), DeviceStatus::Disconnected);
    assert_eq!(recorder.disconnects(), 1);

    drop(release);
}
