//! Subcommands

pub mod ports;
pub mod repl;
pub mod tele;

use anyhow::{anyhow, bail};
use clap::Args;
use dynobench_core::device::{list_ports, DeviceConfig};
use dynobench_core::protocol::{ChecksumPolicy, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};
use dynobench_core::signal::Cause;

/// Connection flags shared by every bench subcommand
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Serial port; defaults to the first bench-like port found
    #[arg(long)]
    pub port: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud: u32,

    /// Command response deadline
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Accept frames without validating their CRC32 trailer
    #[arg(long)]
    pub no_checksum: bool,
}

impl DeviceArgs {
    pub fn config(&self) -> anyhow::Result<DeviceConfig> {
        let dsn = match &self.port {
            Some(port) => port.clone(),
            None => match list_ports().into_iter().next() {
                Some(port) => port.name,
                None => bail!("no serial port found, pass --port"),
            },
        };

        let mut config = DeviceConfig::new(dsn);
        config.baud_rate = self.baud;
        config.timeout_ms = self.timeout_ms;
        if self.no_checksum {
            config.checksum = ChecksumPolicy::Ignore;
        }
        Ok(config)
    }
}

/// Map a session cause to the command result
pub fn outcome(cause: Cause) -> anyhow::Result<()> {
    match cause {
        Cause::Cancelled => Ok(()),
        Cause::Failed(err) => Err(anyhow!("{err:#}")),
    }
}
