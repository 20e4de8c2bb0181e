use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use dynobench_core::device::{Device, DeviceCallbacks};
use dynobench_core::protocol::Telemetry;
use dynobench_core::signal::{Cause, CancelSignal};

use super::{outcome, DeviceArgs};

#[derive(Args, Debug)]
pub struct TeleArgs {
    /// Sample period, ms
    #[arg(long, default_value_t = 10)]
    rate: i64,

    /// Print JSON lines instead of text
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    device: DeviceArgs,
}

struct Printer {
    rate: i64,
    json: bool,
    session: CancelSignal,
}

#[async_trait]
impl DeviceCallbacks for Printer {
    async fn on_connect(&self, device: &Device) -> anyhow::Result<()> {
        device.control("sample", &[self.rate.into()]).await?;
        Ok(())
    }

    async fn on_telemetry(&self, _device: &Device, telemetry: &Telemetry) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(telemetry)?);
        } else {
            println!("{}", telemetry);
        }
        Ok(())
    }

    async fn on_disconnect(&self, _device: &Device) -> anyhow::Result<()> {
        self.session
            .cancel_with(anyhow::anyhow!("device disconnected"));
        Ok(())
    }
}

pub async fn run(args: TeleArgs, session: CancelSignal) -> anyhow::Result<()> {
    let printer = Printer {
        rate: args.rate,
        json: args.json,
        session: session.clone(),
    };
    let device = Device::new(args.device.config()?, Arc::new(printer));

    device.startup(&session).await?;
    session.cancelled().await;
    device.teardown().await;

    outcome(session.cause().unwrap_or(Cause::Cancelled))
}
