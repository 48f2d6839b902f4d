//! Telemetry pipeline
//!
//! Every poll cycle produces one [`Sample`]. The pipeline appends it to a
//! durable CSV log per sink before any remote delivery is attempted, then
//! replays the log into the sink when the sink is due. A remote outage only
//! grows the log; rows leave it once the remote side has accepted them.

pub mod durable_log;
pub mod pipeline;
pub mod sample;
pub mod sinks;

pub use durable_log::{DurableLog, LogContents, SharedLog};
pub use pipeline::{Journal, PipelineHandle, SinkChannel, SinkTarget, TelemetryPipeline};
pub use sample::{Sample, read_cpu_temperature};
pub use sinks::{DirectorySink, FileServerSink, FtpSink, RelationalSink, SqlSink};
