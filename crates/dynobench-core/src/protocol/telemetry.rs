//! Telemetry codec
//!
//! Data-channel payloads are a sequence of 8-byte entries, each an
//! `(index: u32 LE, value: u32 LE)` pair. The first entry is the schema
//! version tag; the rest are dispatched by index into [`Telemetry`] fields.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// The only recognized telemetry schema version
pub const TELEMETRY_VERSION: u32 = 0x1000;

const ENTRY_LEN: usize = 8;

/// Field indices of schema `0x1000`
pub mod index {
    /// Bench timestamp, ms
    pub const TS: u32 = 0x1000;
    /// Load cell 1, raw counts
    pub const LOAD1: u32 = 0x1001;
    /// Load cell 2, raw counts
    pub const LOAD2: u32 = 0x1002;
    /// Load cell 3, raw counts
    pub const LOAD3: u32 = 0x1003;
    /// Thermocouple 1, quarter degrees
    pub const TEMP1: u32 = 0x1004;
    /// Thermocouple 2, quarter degrees
    pub const TEMP2: u32 = 0x1005;
    /// Thermocouple 3, quarter degrees
    pub const TEMP3: u32 = 0x1006;
    /// Brake setting
    pub const BRAKE: u32 = 0x1007;
    /// Motor current, power monitor LSBs
    pub const MOTOR_I: u32 = 0x1008;
    /// Motor voltage, power monitor LSBs
    pub const MOTOR_U: u32 = 0x1009;
    /// Motor power, power monitor LSBs
    pub const MOTOR_P: u32 = 0x100A;
    /// Motor speed
    pub const MOTOR_RPM: u32 = 0x100B;
    /// Throttle setting
    pub const THROTTLE: u32 = 0x100C;
    /// Gyro X rate
    pub const GYRO_X: u32 = 0x100D;
    /// Gyro Y rate
    pub const GYRO_Y: u32 = 0x100E;
    /// Gyro Z rate
    pub const GYRO_Z: u32 = 0x100F;
}

/// Export column names, in export order
pub const TELEMETRY_COLUMNS: [&str; 16] = [
    "ts", "load1", "load2", "load3", "temp1", "temp2", "temp3", "motorI", "motorU", "motorP",
    "motorRPM", "throttle", "gyroX", "gyroY", "gyroZ", "tag",
];

/// Power monitor current LSB in amps
const CURRENT_LSB: f64 = 0.01;

/// Power monitor bus voltage LSB in volts
const VOLTAGE_LSB: f64 = 0.0016;

/// One decoded, unit-converted telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Host wall-clock time the frame was decoded
    pub captured_at: DateTime<Utc>,

    /// Bench timestamp, ms
    pub ts: i32,
    /// Load cell 1, raw counts
    pub load1: i32,
    /// Load cell 2, raw counts
    pub load2: i32,
    /// Load cell 3, raw counts
    pub load3: i32,
    /// Thermocouple temperatures, °C
    pub temp1: f64,
    /// Second thermocouple, °C
    pub temp2: f64,
    /// Third thermocouple, °C
    pub temp3: f64,
    /// Brake setting as commanded
    pub brake: i32,
    /// Motor current, A
    #[serde(rename = "motorI")]
    pub motor_i: f64,
    /// Motor voltage, V
    #[serde(rename = "motorU")]
    pub motor_u: f64,
    /// Motor power, W
    #[serde(rename = "motorP")]
    pub motor_p: f64,
    /// Motor speed, rpm
    #[serde(rename = "motorRPM")]
    pub motor_rpm: i32,
    /// Throttle setting as commanded
    pub throttle: i32,
    /// Gyro X rate, raw
    pub gyro_x: i32,
    /// Gyro Y rate, raw
    pub gyro_y: i32,
    /// Gyro Z rate, raw
    pub gyro_z: i32,

    /// Free-form operator tag
    pub tag: String,
}

impl Telemetry {
    /// Decode a Data-channel payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < ENTRY_LEN {
            return Err(ProtocolError::PayloadTooShort(payload.len()));
        }
        if payload.len() % ENTRY_LEN != 0 {
            return Err(ProtocolError::PayloadMisaligned(payload.len()));
        }

        let mut entries = payload.chunks_exact(ENTRY_LEN).map(|entry| {
            (
                LittleEndian::read_u32(&entry[..4]),
                LittleEndian::read_u32(&entry[4..]),
            )
        });

        match entries.next() {
            Some((TELEMETRY_VERSION, TELEMETRY_VERSION)) => {}
            Some((TELEMETRY_VERSION, value)) => return Err(ProtocolError::UnsupportedVersion(value)),
            Some((idx, _)) => return Err(ProtocolError::UnsupportedVersion(idx)),
            None => return Err(ProtocolError::PayloadTooShort(0)),
        }

        let mut raw = RawTelemetry::default();
        for (idx, value) in entries {
            raw.apply(idx, value);
        }

        Ok(raw.convert(Utc::now()))
    }

    /// Values in [`TELEMETRY_COLUMNS`] order, formatted for export
    pub fn values(&self) -> Vec<String> {
        vec![
            self.ts.to_string(),
            self.load1.to_string(),
            self.load2.to_string(),
            self.load3.to_string(),
            format!("{:.2}", self.temp1),
            format!("{:.2}", self.temp2),
            format!("{:.2}", self.temp3),
            format!("{:.2}", self.motor_i),
            format!("{:.2}", self.motor_u),
            format!("{:.2}", self.motor_p),
            self.motor_rpm.to_string(),
            self.throttle.to_string(),
            self.gyro_x.to_string(),
            self.gyro_y.to_string(),
            self.gyro_z.to_string(),
            self.tag.clone(),
        ]
    }

    /// Compare every sensor field, ignoring capture time
    pub fn same_reading(&self, other: &Telemetry) -> bool {
        Telemetry {
            captured_at: other.captured_at,
            ..self.clone()
        } == *other
    }
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}µs r/min {} b/pos {} | {:.2}A x {:.2}V = {:.2}W | {:.2}°C {:.2}°C {:.2}°C | {} {} {} | {} {} {}",
            self.throttle,
            self.motor_rpm,
            self.brake,
            self.motor_i,
            self.motor_u,
            self.motor_p,
            self.temp1,
            self.temp2,
            self.temp3,
            self.load1,
            self.load2,
            self.load3,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
        )
    }
}

/// Register values as they come off the wire
#[derive(Debug, Default)]
struct RawTelemetry {
    ts: u32,
    load: [u32; 3],
    temp: [u32; 3],
    brake: u32,
    motor_i: u32,
    motor_u: u32,
    motor_p: u32,
    motor_rpm: u32,
    throttle: u32,
    gyro: [u32; 3],
}

impl RawTelemetry {
    fn apply(&mut self, idx: u32, value: u32) {
        match idx {
            index::TS => self.ts = value,
            index::LOAD1 => self.load[0] = value,
            index::LOAD2 => self.load[1] = value,
            index::LOAD3 => self.load[2] = value,
            index::TEMP1 => self.temp[0] = value,
            index::TEMP2 => self.temp[1] = value,
            index::TEMP3 => self.temp[2] = value,
            index::BRAKE => self.brake = value,
            index::MOTOR_I => self.motor_i = value,
            index::MOTOR_U => self.motor_u = value,
            index::MOTOR_P => self.motor_p = value,
            index::MOTOR_RPM => self.motor_rpm = value,
            index::THROTTLE => self.throttle = value,
            index::GYRO_X => self.gyro[0] = value,
            index::GYRO_Y => self.gyro[1] = value,
            index::GYRO_Z => self.gyro[2] = value,
            _ => {}
        }
    }

    fn convert(&self, captured_at: DateTime<Utc>) -> Telemetry {
        Telemetry {
            captured_at,
            ts: self.ts as i32,
            load1: self.load[0] as i32,
            load2: self.load[1] as i32,
            load3: self.load[2] as i32,
            temp1: quarter_degrees(self.temp[0]),
            temp2: quarter_degrees(self.temp[1]),
            temp3: quarter_degrees(self.temp[2]),
            brake: self.brake as i32,
            motor_i: round2(self.motor_i as i32 as f64 * CURRENT_LSB),
            motor_u: round2(self.motor_u as i32 as f64 * VOLTAGE_LSB),
            motor_p: round2(self.motor_p as i32 as f64 * (32.0 * CURRENT_LSB)),
            motor_rpm: self.motor_rpm as i32,
            throttle: self.throttle as i32,
            gyro_x: self.gyro[0] as i32,
            gyro_y: self.gyro[1] as i32,
            gyro_z: self.gyro[2] as i32,
            tag: String::new(),
        }
    }
}

/// Thermocouple converter reports in 0.25 °C steps; whole degrees are kept
fn quarter_degrees(raw: u32) -> f64 {
    f64::from((raw >> 2) as i32)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
