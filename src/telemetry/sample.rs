//! Samples and row layout
//!
//! A [`Sample`] is one projected row of the output columns. The leading
//! timestamp (or date + time pair) is what the durable log uses to age rows.

use crate::config::{ColumnSource, OutputColumn};
use crate::codec::round_to;
use crate::value::Value;
use chrono::NaiveDateTime;
use std::path::Path;

/// Timestamp layout of the leading log column
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// One telemetry row
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Local wall-clock time of the cycle
    pub timestamp: NaiveDateTime,
    pub titles: Vec<String>,
    pub values: Vec<Value>,
    /// Deliver regardless of the sink's minimum interval
    pub force_delivery: bool,
}

impl Sample {
    /// Build a row from the output columns. `lookup` returns the current
    /// value of `(node, attribute)`; anything it cannot find is null.
    pub fn project<F>(
        columns: &[OutputColumn],
        timestamp: NaiveDateTime,
        force_delivery: bool,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str, &str) -> Option<Value>,
    {
        let mut cpu_temperature = None;
        let values = columns
            .iter()
            .map(|column| match &column.source {
                ColumnSource::Timestamp => {
                    Value::Text(timestamp.format(TIMESTAMP_FORMAT).to_string())
                }
                ColumnSource::Date => Value::Text(timestamp.format(DATE_FORMAT).to_string()),
                ColumnSource::Time => Value::Text(timestamp.format(TIME_FORMAT).to_string()),
                ColumnSource::Attribute {
                    node,
                    attribute,
                    multiplier,
                } => lookup(node, attribute)
                    .map(|v| {
                        if *multiplier == 1.0 {
                            v
                        } else {
                            v.scaled(*multiplier)
                        }
                    })
                    .unwrap_or(Value::Null),
                ColumnSource::Constant { value } => value.clone(),
                ColumnSource::CpuTemperature => {
                    let temp = *cpu_temperature.get_or_insert_with(read_cpu_temperature);
                    Value::from(temp)
                }
            })
            .collect();

        Self {
            timestamp,
            titles: columns.iter().map(|c| c.title.clone()).collect(),
            values,
            force_delivery,
        }
    }

    /// Fields as written to the durable log
    pub fn csv_row(&self) -> Vec<String> {
        self.values.iter().map(Value::to_field).collect()
    }
}

/// SoC temperature in degrees Celsius, if the platform exposes one
pub fn read_cpu_temperature() -> Option<f64> {
    read_cpu_temperature_from(Path::new(THERMAL_ZONE))
}

/// Parse a sysfs thermal file (millidegrees)
pub fn read_cpu_temperature_from(path: &Path) -> Option<f64> {
    let text = std::fs::read_to_string(path).ok()?;
    let millidegrees: f64 = text.trim().parse().ok()?;
    Some(round_to(millidegrees / 1000.0, 1))
}

/// Timestamp of a logged row: either one `timestamp` field or `date` + `time`
/// in the first two fields. Unparseable rows give `None`.
pub fn row_timestamp(row: &[String]) -> Option<NaiveDateTime> {
    let first = row.first()?;
    if let Ok(ts) = NaiveDateTime::parse_from_str(first, TIMESTAMP_FORMAT) {
        return Some(ts);
    }
    let second = row.get(1)?;
    NaiveDateTime::parse_from_str(
        &format!("{} {}", first, second),
        &format!("{} {}", DATE_FORMAT, TIME_FORMAT),
    )
    .ok()
}
