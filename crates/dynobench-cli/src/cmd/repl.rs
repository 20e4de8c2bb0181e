use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use clap::Args;
use dynobench_core::device::{Device, DeviceCallbacks};
use dynobench_core::protocol::Telemetry;
use dynobench_core::signal::{Cause, CancelSignal};
use dynobench_core::value::Value;
use tokio::sync::mpsc;
use tracing::warn;

use super::{outcome, DeviceArgs};

#[derive(Args, Debug)]
pub struct ReplArgs {
    /// File receiving one telemetry line per sample
    #[arg(long, default_value = "telemetry.txt")]
    tele: PathBuf,

    #[command(flatten)]
    device: DeviceArgs,
}

struct Recorder {
    file: Mutex<LineWriter<File>>,
    session: CancelSignal,
}

#[async_trait]
impl DeviceCallbacks for Recorder {
    async fn on_telemetry(&self, _device: &Device, telemetry: &Telemetry) -> anyhow::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{}", telemetry)?;
        Ok(())
    }

    async fn on_disconnect(&self, _device: &Device) -> anyhow::Result<()> {
        self.session
            .cancel_with(anyhow::anyhow!("device disconnected"));
        Ok(())
    }
}

/// Stdin lines, read on a plain thread so a pending read never holds up exit
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn prompt(device: &Device) {
    print!("[{}]> ", device.id().unwrap_or_default());
    let _ = std::io::stdout().flush();
}

pub async fn run(args: ReplArgs, session: CancelSignal) -> anyhow::Result<()> {
    let file = File::create(&args.tele)
        .with_context(|| format!("failed to create {}", args.tele.display()))?;
    let recorder = Recorder {
        file: Mutex::new(LineWriter::new(file)),
        session: session.clone(),
    };
    let device = Device::new(args.device.config()?, Arc::new(recorder));
    device.startup(&session).await?;

    println!("commands: {} (/quit to leave)", device.methods().join(", "));
    let mut lines = stdin_lines();
    loop {
        prompt(&device);
        let line = tokio::select! {
            _ = session.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let line = line.trim();
        if line == "/quit" || line == "/exit" {
            break;
        }
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            continue;
        };
        let args: Vec<Value> = words.map(Value::from).collect();

        match device.control(name, &args).await {
            Ok(Some(reply)) => println!("{}", reply),
            Ok(None) => println!("ok"),
            Err(err) => {
                warn!(command = name, %err, "command failed");
                println!("{}", err);
            }
        }
    }

    session.cancel();
    device.teardown().await;
    outcome(session.cause().unwrap_or(Cause::Cancelled))
}
