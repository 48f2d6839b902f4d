//! Configuration management for Fieldgate
//!
//! This module handles loading, validation, and management of the agent
//! configuration from YAML files. Device register tables live in separate
//! model files (see [`crate::registers`]); this file only wires ports, nodes,
//! output columns and sinks together.

use crate::batch::RequestItem;
use crate::error::{FieldgateError, Result};
use crate::node::WriteValue;
use crate::registers::{ReadCapability, WriteCapability};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn default_one() -> f64 {
    1.0
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_delay_ms() -> u64 {
    50
}

fn default_retention_days() -> u32 {
    31
}

fn default_queue_capacity() -> usize {
    64
}

fn default_sink_timeout_secs() -> u64 {
    10
}

fn default_ftp_port() -> u16 {
    21
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// IANA timezone used for sample timestamps
    pub timezone: String,

    /// Sleep between poll cycles in milliseconds
    pub poll_interval_ms: u64,

    /// Directory holding device-model YAML files
    pub models_dir: PathBuf,

    /// Model files to load from `models_dir`; empty loads every `*.yaml` there
    pub models: Vec<String>,

    /// Fieldbus ports and the devices behind them
    pub ports: Vec<PortConfig>,

    /// Telemetry row layout, in column order
    pub output: Vec<OutputColumn>,

    /// Durable log and remote sinks
    pub telemetry: TelemetryConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARNING, ERROR)
    pub level: String,

    /// Path to log file (its directory receives the rolling files)
    pub file: String,

    /// Number of daily files to keep
    pub backup_count: u32,

    /// Whether to log to console as well
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// One fieldbus port (a serial line or a TCP endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,

    pub transport: TransportConfig,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    pub nodes: Vec<NodeConfig>,
}

/// Physical link parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Tcp {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    Rtu {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default)]
        parity: SerialParity,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerialParity {
    None,
    #[default]
    Even,
    Odd,
}

/// One addressable device on a port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique device name, used in logs and output columns
    pub name: String,

    /// Name of the device model (the `name` inside a model file)
    pub model: String,

    pub slave_id: u8,

    /// Pause after every bus transaction in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Attribute names or documented addresses polled every cycle
    #[serde(default)]
    pub requests: Vec<RequestItem>,

    /// Force one read capability for every block of this node
    #[serde(default)]
    pub read_capability: Option<ReadCapability>,

    /// Writes issued once, on the first poll cycle
    #[serde(default)]
    pub startup_writes: Vec<StartupWrite>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartupWrite {
    pub target: RequestItem,

    /// Engineering value, scaled by the attribute's scale
    #[serde(default)]
    pub value: Option<f64>,

    /// Raw register value, written as-is
    #[serde(default)]
    pub raw: Option<i64>,

    #[serde(default)]
    pub capability: Option<WriteCapability>,
}

impl StartupWrite {
    /// Value to hand to the node; `None` selects the attribute default
    pub fn write_value(&self) -> Option<WriteValue> {
        match (self.raw, self.value) {
            (Some(raw), _) => Some(WriteValue::Raw(raw)),
            (None, Some(v)) => Some(WriteValue::Engineering(v)),
            (None, None) => None,
        }
    }
}

/// One column of the telemetry row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputColumn {
    pub title: String,

    #[serde(flatten)]
    pub source: ColumnSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ColumnSource {
    /// `%Y-%m-%d %H:%M:%S`
    Timestamp,
    /// `%Y-%m-%d`
    Date,
    /// `%H:%M:%S`
    Time,
    Attribute {
        node: String,
        attribute: String,
        #[serde(default = "default_one")]
        multiplier: f64,
    },
    Constant {
        value: Value,
    },
    CpuTemperature,
}

/// Durable log and sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Directory holding the per-sink durable logs
    pub log_directory: PathBuf,

    /// Rows older than this many days are pruned from the durable logs
    pub retention_days: u32,

    /// Pending samples between the poll loop and the pipeline worker
    pub queue_capacity: usize,

    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub name: String,

    /// Durable log file name, relative to `telemetry.log_directory`
    pub log_file: String,

    /// Minimum seconds between flush attempts
    #[serde(default)]
    pub min_interval_secs: u64,

    /// Bound on a single remote operation
    #[serde(default = "default_sink_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(flatten)]
    pub kind: SinkKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkKind {
    /// Relational store reached through an sqlx connection URL
    Sql {
        url: String,
        table: String,
        #[serde(default)]
        row_limit: Option<u64>,
    },
    /// File server mounted as a directory
    Directory { remote_dir: PathBuf },
    /// FTP server, passive mode
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        user: String,
        password: String,
        /// Remote directory the uploads land in; empty for the login directory
        #[serde(default)]
        remote_dir: String,
    },
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/var/log/fieldgate/fieldgate.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_directory: PathBuf::from("/var/lib/fieldgate"),
            retention_days: default_retention_days(),
            queue_capacity: default_queue_capacity(),
            sinks: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            timezone: "UTC".to_string(),
            poll_interval_ms: 1000,
            models_dir: PathBuf::from("/usr/share/fieldgate/models"),
            models: Vec::new(),
            ports: vec![PortConfig {
                name: "meter-bus".to_string(),
                transport: TransportConfig::Tcp {
                    host: "192.168.1.100".to_string(),
                    port: default_modbus_port(),
                },
                timeout_ms: default_timeout_ms(),
                nodes: vec![NodeConfig {
                    name: "KMN1".to_string(),
                    model: "omron_kmn1".to_string(),
                    slave_id: 1,
                    delay_ms: default_delay_ms(),
                    requests: vec![RequestItem::from("Voltage_1"), RequestItem::from("Current_1")],
                    read_capability: None,
                    startup_writes: Vec::new(),
                }],
            }],
            output: vec![
                OutputColumn {
                    title: "Timestamp".to_string(),
                    source: ColumnSource::Timestamp,
                },
                OutputColumn {
                    title: "Voltage".to_string(),
                    source: ColumnSource::Attribute {
                        node: "KMN1".to_string(),
                        attribute: "Voltage_1".to_string(),
                        multiplier: 1.0,
                    },
                },
                OutputColumn {
                    title: "Current".to_string(),
                    source: ColumnSource::Attribute {
                        node: "KMN1".to_string(),
                        attribute: "Current_1".to_string(),
                        multiplier: 1.0,
                    },
                },
            ],
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first location that exists
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os("FIELDGATE_CONFIG") {
            return Self::from_file(path);
        }

        let default_paths = ["fieldgate.yaml", "/etc/fieldgate/config.yaml"];
        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parsed timezone
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            FieldgateError::validation("timezone", &format!("unknown timezone '{}'", self.timezone))
        })
    }

    /// Look up a node by name across all ports
    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.ports
            .iter()
            .flat_map(|p| p.nodes.iter())
            .find(|n| n.name == name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(FieldgateError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        self.tz()?;

        if self.ports.is_empty() {
            return Err(FieldgateError::validation(
                "ports",
                "At least one port must be configured",
            ));
        }

        let mut node_names = HashSet::new();
        for port in &self.ports {
            self.validate_port(port, &mut node_names)?;
        }

        self.validate_output()?;
        self.validate_telemetry()?;

        Ok(())
    }

    fn validate_port(&self, port: &PortConfig, node_names: &mut HashSet<String>) -> Result<()> {
        let field = format!("ports.{}", port.name);
        if port.nodes.is_empty() {
            return Err(FieldgateError::validation(
                field.as_str(),
                "Port has no nodes",
            ));
        }
        if port.timeout_ms == 0 {
            return Err(FieldgateError::validation(
                format!("{}.timeout_ms", field).as_str(),
                "Must be greater than 0",
            ));
        }
        match &port.transport {
            TransportConfig::Tcp { host, port: p } => {
                if host.is_empty() {
                    return Err(FieldgateError::validation(
                        format!("{}.transport.host", field).as_str(),
                        "Host cannot be empty",
                    ));
                }
                if *p == 0 {
                    return Err(FieldgateError::validation(
                        format!("{}.transport.port", field).as_str(),
                        "Port must be greater than 0",
                    ));
                }
            }
            TransportConfig::Rtu {
                path,
                baud_rate,
                data_bits,
                stop_bits,
                ..
            } => {
                if path.is_empty() || *baud_rate == 0 {
                    return Err(FieldgateError::validation(
                        format!("{}.transport", field).as_str(),
                        "Serial path and baud rate are required",
                    ));
                }
                if !(5..=8).contains(data_bits) || !(1..=2).contains(stop_bits) {
                    return Err(FieldgateError::validation(
                        format!("{}.transport", field).as_str(),
                        "Unsupported serial framing",
                    ));
                }
            }
        }

        for node in &port.nodes {
            if node.name.is_empty() {
                return Err(FieldgateError::validation(
                    format!("{}.nodes", field).as_str(),
                    "Node name cannot be empty",
                ));
            }
            if !node_names.insert(node.name.clone()) {
                return Err(FieldgateError::validation(
                    "ports.nodes",
                    &format!("Duplicate node name '{}'", node.name),
                ));
            }
            for write in &node.startup_writes {
                if write.raw.is_some() && write.value.is_some() {
                    return Err(FieldgateError::validation(
                        format!("nodes.{}.startup_writes", node.name).as_str(),
                        "Give either value or raw, not both",
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_output(&self) -> Result<()> {
        let leading_ok = match self.output.first().map(|c| &c.source) {
            Some(ColumnSource::Timestamp) => true,
            Some(ColumnSource::Date) => {
                matches!(self.output.get(1).map(|c| &c.source), Some(ColumnSource::Time))
            }
            _ => false,
        };
        if !leading_ok {
            return Err(FieldgateError::validation(
                "output",
                "First column must be a timestamp, or date followed by time",
            ));
        }

        let mut titles = HashSet::new();
        for column in &self.output {
            if !titles.insert(column.title.as_str()) {
                return Err(FieldgateError::validation(
                    "output",
                    &format!("Duplicate column title '{}'", column.title),
                ));
            }
            if let ColumnSource::Attribute { node, .. } = &column.source
                && self.node(node).is_none()
            {
                return Err(FieldgateError::validation(
                    "output",
                    &format!(
                        "Column '{}' references unknown node '{}'",
                        column.title, node
                    ),
                ));
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let telemetry = &self.telemetry;
        if telemetry.retention_days == 0 {
            return Err(FieldgateError::validation(
                "telemetry.retention_days",
                "Must be greater than 0",
            ));
        }
        if telemetry.queue_capacity == 0 {
            return Err(FieldgateError::validation(
                "telemetry.queue_capacity",
                "Must be greater than 0",
            ));
        }

        let mut log_files = HashSet::new();
        for sink in &telemetry.sinks {
            if !log_files.insert(sink.log_file.as_str()) {
                return Err(FieldgateError::validation(
                    "telemetry.sinks",
                    &format!("Log file '{}' is shared by two sinks", sink.log_file),
                ));
            }
            if sink.timeout_secs == 0 {
                return Err(FieldgateError::validation(
                    format!("telemetry.sinks.{}.timeout_secs", sink.name).as_str(),
                    "Must be greater than 0",
                ));
            }
            if let SinkKind::Sql { table, .. } = &sink.kind
                && table.is_empty()
            {
                return Err(FieldgateError::validation(
                    format!("telemetry.sinks.{}.table", sink.name).as_str(),
                    "Table cannot be empty",
                ));
            }
            if let SinkKind::Ftp { host, user, .. } = &sink.kind {
                if host.is_empty() {
                    return Err(FieldgateError::validation(
                        format!("telemetry.sinks.{}.host", sink.name).as_str(),
                        "Host cannot be empty",
                    ));
                }
                if user.is_empty() {
                    return Err(FieldgateError::validation(
                        format!("telemetry.sinks.{}.user", sink.name).as_str(),
                        "User cannot be empty",
                    ));
                }
            }
        }
        Ok(())
    }
}
