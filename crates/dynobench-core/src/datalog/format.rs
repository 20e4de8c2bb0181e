//! CSV export

use std::borrow::Cow;
use std::io::{self, Write};

use crate::protocol::{Telemetry, TELEMETRY_COLUMNS};

fn escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Write records as CSV: `idx` column, then [`TELEMETRY_COLUMNS`]
///
/// Nothing is written for an empty slice.
pub fn write_csv<W: Write>(mut writer: W, entries: &[Telemetry]) -> io::Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    writeln!(writer, "idx,{}", TELEMETRY_COLUMNS.join(","))?;

    for (idx, entry) in entries.iter().enumerate() {
        write!(writer, "{}", idx)?;
        for value in entry.values() {
            write!(writer, ",{}", escape(&value))?;
        }
        writeln!(writer)?;
    }

    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn sample(ts: i32, tag: &str) -> Telemetry {
        Telemetry {
            captured_at: Utc::now(),
            ts,
            load1: 1,
            load2: 2,
            load3: 3,
            temp1: 21.0,
            temp2: 22.5,
            temp3: 23.25,
            brake: 40,
            motor_i: 2.5,
            motor_u: 1.6,
            motor_p: 320.0,
            motor_rpm: 4000,
            throttle: 1200,
            gyro_x: -1,
            gyro_y: 0,
            gyro_z: 1,
            tag: tag.to_string(),
        }
    }

    #[test]
    fn test_csv_layout() {
        let mut out = Vec::new();
        write_csv(&mut out, &[sample(10, ""), sample(20, "spin-up")]).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "idx,ts,load1,load2,load3,temp1,temp2,temp3,motorI,motorU,motorP,motorRPM,throttle,gyroX,gyroY,gyroZ,tag",
                "0,10,1,2,3,21.00,22.50,23.25,2.50,1.60,320.00,4000,1200,-1,0,1,",
                "1,20,1,2,3,21.00,22.50,23.25,2.50,1.60,320.00,4000,1200,-1,0,1,spin-up",
            ]
        );
    }

    #[test]
    fn test_empty_writes_nothing() {
        let mut out = Vec::new();
        write_csv(&mut out, &[]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_tag_is_quoted() {
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("plain"), "plain");
    }
}
