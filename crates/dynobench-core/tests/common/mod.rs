//! In-memory fake bench
//!
//! Speaks the bench side of the protocol over a `tokio::io::duplex` pipe:
//! answers `/id`, optionally acknowledges every other command, records
//! keepalive pings, and lets the test push raw frames or unplug the cable.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use dynobench_core::prelude::*;
use dynobench_core::protocol::{Channel, TokenCodec};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

pub const BENCH_ID: &str = "DMS-TEST-01";

#[derive(Debug, Clone, Copy)]
pub struct BenchOptions {
    /// Answer `/id`
    pub identify: bool,
    /// Answer every other command with `OK`
    pub ack: bool,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            identify: true,
            ack: true,
        }
    }
}

pub struct Bench {
    commands: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    pings: Arc<Mutex<Vec<Instant>>>,
}

impl Bench {
    pub fn spawn(options: BenchOptions) -> (StreamConnector, Bench) {
        let (host, bench) = tokio::io::duplex(4096);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let pings = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(bench, options, commands_tx, frames_rx, pings.clone()));
        let bench = Bench {
            commands,
            frames,
            pings,
        };
        (StreamConnector::new(host), bench)
    }

    /// Pings received at or after `since`
    pub fn pings_since(&self, since: Instant) -> usize {
        self.pings
            .lock()
            .unwrap()
            .iter()
            .filter(|at| **at >= since)
            .count()
    }

    /// Raw bytes towards the host
    pub fn send(&self, bytes: Vec<u8>) {
        let _ = self.frames.send(bytes);
    }

    /// Sender usable from other tasks
    pub fn feeder(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.frames.clone()
    }

    /// Next command line the host sent, pings excluded
    pub async fn next_command(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
            .await
            .ok()
            .flatten()
    }

    /// Every command received so far
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.commands.try_recv() {
            lines.push(line);
        }
        lines
    }

    /// Drop the link
    pub fn unplug(self) {}
}

async fn serve(
    stream: DuplexStream,
    options: BenchOptions,
    commands: mpsc::UnboundedSender<String>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    pings: Arc<Mutex<Vec<Instant>>>,
) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line == "/ping" {
                        pings.lock().unwrap().push(Instant::now());
                        continue;
                    }
                    let reply = if line == "/id" {
                        options.identify.then_some(BENCH_ID)
                    } else {
                        options.ack.then_some("OK")
                    };
                    if let Some(reply) = reply {
                        if writer.write_all(&text_frame(reply)).await.is_err() {
                            break;
                        }
                    }
                    let _ = commands.send(line);
                }
                _ => break,
            },
            bytes = frames.recv() => match bytes {
                Some(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

pub fn text_frame(text: &str) -> Vec<u8> {
    Frame::new(Channel::Text, text.as_bytes()).encode()
}

fn decodes(bytes: &[u8]) -> bool {
    let mut buf = BytesMut::from(bytes);
    match TokenCodec::new().decode(&mut buf) {
        Ok(Some(token)) => Frame::parse(&token, ChecksumPolicy::Crc32).is_ok(),
        _ => false,
    }
}

/// Telemetry frame with the version entry first
///
/// Frames are unescaped, so a trailer ending in end-marker bytes would cut
/// the token short; an ignored padding entry is varied until it decodes.
pub fn telemetry_frame(entries: &[(u32, u32)]) -> Vec<u8> {
    for pad in 0u32..1024 {
        let mut payload = Vec::new();
        let version = [(0x1000, 0x1000)];
        for (idx, value) in version.iter().chain(entries).chain(&[(0x7FFF, pad)]) {
            payload.extend_from_slice(&idx.to_le_bytes());
            payload.extend_from_slice(&value.to_le_bytes());
        }
        let bytes = Frame::new(Channel::Data, payload).encode();
        if decodes(&bytes) {
            return bytes;
        }
    }
    panic!("no decodable padding for telemetry frame");
}

/// Route `tracing` output through the test harness (`RUST_LOG` to see it)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> DeviceConfig {
    init_logging();
    let mut config = DeviceConfig::new("fake-bench");
    config.timeout_ms = 200;
    config.identify_timeout_ms = 500;
    config
}

/// Callbacks that count lifecycle events and keep telemetry
#[derive(Default)]
pub struct Recorder {
    pub connects: Mutex<usize>,
    pub disconnects: Mutex<usize>,
    pub telemetry: Mutex<Vec<Telemetry>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }

    pub fn disconnects(&self) -> usize {
        *self.disconnects.lock().unwrap()
    }

    pub fn samples(&self) -> Vec<Telemetry> {
        self.telemetry.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DeviceCallbacks for Recorder {
    async fn on_connect(&self, _device: &Device) -> anyhow::Result<()> {
        *self.connects.lock().unwrap() += 1;
        Ok(())
    }

    async fn on_telemetry(&self, _device: &Device, telemetry: &Telemetry) -> anyhow::Result<()> {
        self.telemetry.lock().unwrap().push(telemetry.clone());
        Ok(())
    }

    async fn on_disconnect(&self, _device: &Device) -> anyhow::Result<()> {
        *self.disconnects.lock().unwrap() += 1;
        Ok(())
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
