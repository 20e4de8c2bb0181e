//! Bench commands
//!
//! Commands go out as ASCII lines: `/name\n` or `/name=arg1,arg2\n`.

use serde::{Deserialize, Serialize};

use crate::device::DeviceError;
use crate::value::Value;

/// Command names a bench publishes to the host and to scripts
pub const COMMANDS: [&str; 6] = ["id", "tare", "brake", "sample", "chiller", "throttle"];

/// Commands understood by the bench controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Query the bench identifier
    Id,
    /// Zero the load cells
    Tare,
    /// Set brake position
    Brake(i64, i64),
    /// Set the telemetry sample period (ms)
    Sample(i64),
    /// Set chiller state
    Chiller(i64, i64),
    /// Set the motor throttle
    Throttle(i64),
    /// Keepalive, internal only
    Ping,
}

impl Command {
    /// Build a command from its published name and positional arguments
    pub fn parse(name: &str, args: &[Value]) -> Result<Self, DeviceError> {
        let (command, arity): (&'static str, usize) = match name {
            "id" => ("id", 0),
            "tare" => ("tare", 0),
            "brake" => ("brake", 2),
            "sample" => ("sample", 1),
            "chiller" => ("chiller", 2),
            "throttle" => ("throttle", 1),
            other => return Err(DeviceError::UnknownCommand(other.to_string())),
        };

        if args.len() != arity {
            return Err(DeviceError::Arity {
                command,
                expected: arity,
                got: args.len(),
            });
        }

        let int = |i: usize| -> Result<i64, DeviceError> {
            args[i].as_int().ok_or_else(|| DeviceError::InvalidArgument {
                command,
                value: args[i].to_string(),
            })
        };

        Ok(match command {
            "id" => Command::Id,
            "tare" => Command::Tare,
            "brake" => Command::Brake(int(0)?, int(1)?),
            "sample" => Command::Sample(int(0)?),
            "chiller" => Command::Chiller(int(0)?, int(1)?),
            _ => Command::Throttle(int(0)?),
        })
    }

    /// Wire name
    pub fn name(&self) -> &'static str {
        match self {
            Command::Id => "id",
            Command::Tare => "tare",
            Command::Brake(..) => "brake",
            Command::Sample(_) => "sample",
            Command::Chiller(..) => "chiller",
            Command::Throttle(_) => "throttle",
            Command::Ping => "ping",
        }
    }

    /// Format the command line sent to the bench
    pub fn to_line(&self) -> String {
        match self {
            Command::Brake(a, b) | Command::Chiller(a, b) => {
                format!("/{}={},{}\n", self.name(), a, b)
            }
            Command::Sample(n) | Command::Throttle(n) => format!("/{}={}\n", self.name(), n),
            Command::Id | Command::Tare | Command::Ping => format!("/{}\n", self.name()),
        }
    }
}
