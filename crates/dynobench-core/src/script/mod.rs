//! Script Execution Engine
//!
//! Test procedures are Lua scripts evaluating to a table of entry points:
//!
//! ```lua
//! local samples = 0
//! return {
//!     OnTelemetry = function(t) samples = samples + 1 end,
//!     Test = function()
//!         throttle(intParam("throttle", 1100))
//!         sleep(5000)
//!         stop("done after " .. samples .. " samples")
//!     end,
//! }
//! ```
//!
//! A bound device's commands appear as global functions, next to `stop`,
//! `sleep`, `intParam` and `strParam`.

mod error;
mod lua;

pub use error::ScriptError;
pub use lua::{Binding, LuaScript};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::device::{Device, DeviceError};
use crate::value::Value;

/// Script parameters, from `key=value` tokens
pub type Params = HashMap<String, String>;

/// Parse `key=value` tokens; a token without `=` maps to an empty value
pub fn parse_params<I, S>(tokens: I) -> Params
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|token| {
            let token = token.as_ref();
            match token.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (token.to_string(), String::new()),
            }
        })
        .collect()
}

/// Something scripts can drive by command name
#[async_trait]
pub trait Scriptable: Send + Sync {
    /// Published command names
    fn methods(&self) -> Vec<&'static str>;

    /// Issue a command by name
    async fn control(&self, name: &str, args: &[Value]) -> Result<Option<String>, DeviceError>;
}

#[async_trait]
impl Scriptable for Device {
    fn methods(&self) -> Vec<&'static str> {
        Device::methods(self).to_vec()
    }

    async fn control(&self, name: &str, args: &[Value]) -> Result<Option<String>, DeviceError> {
        Device::control(self, name, args).await
    }
}

/// Named script entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    /// Main test body, run once per session
    Test,
    /// Bench identified
    OnConnect,
    /// Every telemetry sample
    OnTelemetry,
    /// After `Test` finished
    OnDisconnect,
}

impl EntryPoint {
    /// Every entry point, in lookup order
    pub const ALL: [EntryPoint; 4] = [
        EntryPoint::Test,
        EntryPoint::OnConnect,
        EntryPoint::OnTelemetry,
        EntryPoint::OnDisconnect,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            EntryPoint::Test => "Test",
            EntryPoint::OnConnect => "OnConnect",
            EntryPoint::OnTelemetry => "OnTelemetry",
            EntryPoint::OnDisconnect => "OnDisconnect",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntryPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryPoint::ALL
            .into_iter()
            .find(|entry| entry.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown entry point: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_entry_point_names() {
        assert_eq!("test".parse::<EntryPoint>(), Ok(EntryPoint::Test));
        assert_eq!("ONTELEMETRY".parse::<EntryPoint>(), Ok(EntryPoint::OnTelemetry));
        assert_eq!("onDisconnect".parse::<EntryPoint>(), Ok(EntryPoint::OnDisconnect));
        assert!("OnIdle".parse::<EntryPoint>().is_err());
    }

    #[test]
    fn test_parse_params() {
        let params = parse_params(["rpm=4000", "label=a=b", "dry"]);
        assert_eq!(params.get("rpm").map(String::as_str), Some("4000"));
        assert_eq!(params.get("label").map(String::as_str), Some("a=b"));
        assert_eq!(params.get("dry").map(String::as_str), Some(""));
    }
}
