//! # DynoBench Core Library
//!
//! Host side of the DynoBench motor/propeller test bench.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Bench protocol framing and telemetry decoding
//! - The bench device state machine (identify, keepalive, commands)
//! - Sandboxed Lua test scripts driven by device events
//! - Telemetry logging and CSV export
//!
//! ## Example
//!
//! ```rust,ignore
//! use dynobench_core::prelude::*;
//!
//! let script = LuaScript::load(&std::fs::read_to_string("default.lua")?, Params::new())?;
//! let session = CancelSignal::new();
//! let log = Arc::new(Mutex::new(TelemetryLog::new()));
//!
//! let runner = Arc::new(TestRunner::new(script, session, log.clone()));
//! let cause = runner
//!     .run(DeviceConfig::new("/dev/ttyACM0"), SerialConnector::default())
//!     .await?;
//! if cause.is_normal() {
//!     log.lock().unwrap().save("telemetry.csv")?;
//! }
//! ```

pub mod datalog;
pub mod device;
pub mod protocol;
pub mod runner;
pub mod script;
pub mod signal;
pub mod value;

/// Common imports
pub mod prelude {
    pub use crate::datalog::TelemetryLog;
    pub use crate::device::{
        Connector, Device, DeviceCallbacks, DeviceConfig, DeviceError, DeviceStatus,
        NoCallbacks, SerialConnector, StreamConnector,
    };
    pub use crate::protocol::{ChecksumPolicy, Frame, Telemetry};
    pub use crate::runner::TestRunner;
    pub use crate::script::{EntryPoint, LuaScript, Params, ScriptError, Scriptable};
    pub use crate::signal::{Cause, CancelSignal};
    pub use crate::value::Value;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
