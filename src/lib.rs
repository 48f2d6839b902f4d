//! # Fieldgate - Field-Gateway Telemetry Agent
//!
//! Polls energy devices (battery management systems, inverters, meters) over
//! Modbus TCP and RTU, turns raw register words into engineering values and
//! ships one sample per cycle to local CSV logs and remote stores.
//!
//! ## Architecture
//!
//! - `registers`: device models, attribute specs and the model library
//! - `codec`: multi-word signed decoding, scaling and write encoding
//! - `batch`: requested names/addresses to contiguous read blocks
//! - `derived`: attributes computed from other attributes
//! - `modbus`: the transport seam and its Modbus implementation
//! - `node`: one slave device, its values and its read/write cycle
//! - `telemetry`: samples, durable logs, sinks and the delivery worker
//! - `poll`: the fixed-interval poll loop
//! - `agent`: wiring everything together from configuration
//! - `config`, `logging`, `error`: the ambient stack

pub mod agent;
pub mod batch;
pub mod codec;
pub mod config;
pub mod derived;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod node;
pub mod poll;
pub mod registers;
pub mod telemetry;
pub mod value;

// Re-export commonly used types
pub use agent::TelemetryAgent;
pub use batch::RequestItem;
pub use config::Config;
pub use error::{FieldgateError, Result};
pub use node::DeviceNode;
pub use registers::{DeviceProfile, ModelLibrary, ReadCapability, WriteCapability};
pub use value::Value;
