//! Device Node
//!
//! A node is one addressable device on a port: a device profile, a slave id,
//! a shared transport and the current attribute values. Reads are split into
//! blocks by the batcher; a failed block only nulls its own attributes.
//! Writes resolve one attribute and encode its value for the bus. Neither
//! operation returns a transport error to the caller.

use crate::batch::{self, ReadBlock, RequestItem};
use crate::codec::{apply_scale, decode_signed, encode_for_write};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::SharedTransport;
use crate::registers::{AttributeSpec, DeviceProfile, ReadCapability, WriteCapability};
use crate::value::{AttributeValues, Value};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;


/// Position in the read cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Idle,
    ReadIssued,
    Decoded,
    Degraded,
    DerivedApplied,
}

/// Value carried by a write
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum WriteValue {
    /// Engineering units, multiplied by the attribute's scale
    Engineering(f64),
    /// Register value, written as-is
    Raw(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WriteOutcome {
    Written { address: u16, words: Vec<u16> },
    /// Nothing was sent
    Rejected { reason: String },
    /// Sent, but the bus reported a failure
    Failed { reason: String },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

/// Summary of one read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadReport {
    pub blocks: usize,
    pub degraded_blocks: usize,
}

pub struct DeviceNode {
    name: String,
    slave_id: u8,
    profile: Arc<DeviceProfile>,
    transport: SharedTransport,
    inter_command_delay: Duration,
    values: AttributeValues,
    last_plan: Vec<ReadBlock>,
    state: NodeState,
    logger: StructuredLogger,
}

impl DeviceNode {
    pub fn new(
        name: &str,
        slave_id: u8,
        profile: Arc<DeviceProfile>,
        transport: SharedTransport,
        inter_command_delay: Duration,
    ) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("node")
                .with_device(name)
                .with_field("model", profile.name().to_string()),
        );
        let mut node = Self {
            name: name.to_string(),
            slave_id,
            profile,
            transport,
            inter_command_delay,
            values: AttributeValues::new(),
            last_plan: Vec::new(),
            state: NodeState::Idle,
            logger,
        };
        node.reset_values();
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Blocks issued by the most recent read
    pub fn last_plan(&self) -> &[ReadBlock] {
        &self.last_plan
    }

    pub fn values(&self) -> &AttributeValues {
        &self.values
    }

    /// Current value of an attribute; names match case-insensitively
    pub fn value(&self, name: &str) -> Option<&Value> {
        if let Some(v) = self.values.get(name) {
            return Some(v);
        }
        let canonical = self
            .profile
            .model
            .lookup_name(name)
            .map(|s| s.name.as_str())
            .or_else(|| self.profile.derived.get(name).map(|d| d.name.as_str()))?;
        self.values.get(canonical)
    }

    /// Put every register attribute back to zero
    pub fn reset_values(&mut self) {
        self.values.clear();
        for spec in self.profile.model.attributes() {
            self.values.insert(spec.name.clone(), Value::Number(0.0));
        }
    }

    fn transition(&mut self, next: NodeState) {
        self.logger
            .trace(&format!("state {:?} -> {:?}", self.state, next));
        self.state = next;
    }

    /// Read the requested attributes and refresh derived values.
    ///
    /// Derived names are expanded into the raw attributes they need. Every
    /// block is one transaction; a failed block sets its attributes to null
    /// and the remaining blocks are still read.
    pub async fn read(
        &mut self,
        requested: &[RequestItem],
        capability_override: Option<ReadCapability>,
    ) -> ReadReport {
        let expanded = self.profile.derived.expand_read_items(requested);
        let plan = batch::resolve(&self.profile.model, &expanded, capability_override);

        for name in &plan.unresolved {
            self.logger.warn(&format!(
                "Attribute '{}' is not readable on this model; dropped",
                name
            ));
        }
        for address in &plan.raw_addresses {
            self.logger.debug(&format!(
                "Address 0x{:04X} is not in the register table; reading raw",
                address
            ));
        }

        self.transition(NodeState::ReadIssued);
        let inc = self.profile.model.word_increment();
        let mut report = ReadReport {
            blocks: plan.blocks.len(),
            degraded_blocks: 0,
        };

        for block in &plan.blocks {
            let count = block.word_count(inc);
            let response = {
                let mut transport = self.transport.lock().await;
                let res = transport
                    .read_block(self.slave_id, block.capability, block.start, count)
                    .await;
                sleep(self.inter_command_delay).await;
                res
            };

            let words: Vec<Option<u16>> = match response {
                Ok(words) if words.len() >= usize::from(count) => {
                    words.into_iter().take(usize::from(count)).map(Some).collect()
                }
                Ok(words) => {
                    self.logger.warn(&format!(
                        "Short read at 0x{:04X} ({}): {} of {} words",
                        block.start,
                        block.capability,
                        words.len(),
                        count
                    ));
                    report.degraded_blocks += 1;
                    vec![None; usize::from(count)]
                }
                Err(e) => {
                    self.logger.warn(&format!(
                        "Read failed at 0x{:04X} ({}, {} words): {}",
                        block.start, block.capability, count, e
                    ));
                    report.degraded_blocks += 1;
                    vec![None; usize::from(count)]
                }
            };
            self.store_block(block, words);
        }

        self.transition(if report.degraded_blocks > 0 {
            NodeState::Degraded
        } else {
            NodeState::Decoded
        });

        self.profile.derived.evaluate(&mut self.values);
        self.transition(NodeState::DerivedApplied);
        self.last_plan = plan.blocks;

        if let Ok(dump) = serde_json::to_string(&self.values) {
            self.logger.debug(&format!("values {}", dump));
        }
        self.transition(NodeState::Idle);
        report
    }

    fn store_block(&mut self, block: &ReadBlock, mut words: Vec<Option<u16>>) {
        let increment = block.increment(self.profile.model.word_increment());
        let inc = usize::from(increment);
        let padded = words.len().div_ceil(inc) * inc;
        words.resize(padded, None);
        let decoded = decode_signed(&words, increment);

        for slot in &block.slots {
            let offset = usize::from(slot.address - block.start);
            let raw = decoded.get(offset).copied().flatten();
            for name in &slot.names {
                let value = match self.profile.model.lookup_name(name) {
                    Some(spec) => apply_scale(raw, spec.scale, spec.bias, spec.precision),
                    None => raw.map(|r| r as f64),
                };
                self.values.insert(name.clone(), Value::from(value));
            }
        }
    }

    /// Write one attribute.
    ///
    /// `value` of `None` writes the attribute's configured default. An
    /// address with no table entry is written raw when a capability override
    /// and a value are given.
    pub async fn write(
        &mut self,
        target: &RequestItem,
        value: Option<WriteValue>,
        capability_override: Option<WriteCapability>,
    ) -> WriteOutcome {
        let outcome = self.prepare_write(target, value, capability_override);
        let (capability, address, words) = match outcome {
            Ok(prepared) => prepared,
            Err(reason) => {
                self.logger
                    .warn(&format!("Write to {} rejected: {}", target, reason));
                return WriteOutcome::Rejected { reason };
            }
        };

        let result = {
            let mut transport = self.transport.lock().await;
            let res = match capability {
                WriteCapability::SingleRegister => {
                    transport.write_single(self.slave_id, address, words[0]).await
                }
                WriteCapability::MultipleRegisters => {
                    transport.write_multiple(self.slave_id, address, &words).await
                }
            };
            sleep(self.inter_command_delay).await;
            res
        };

        match result {
            Ok(()) => {
                self.logger.info(&format!(
                    "Wrote {:04X?} to {} at 0x{:04X} ({})",
                    words, target, address, capability
                ));
                WriteOutcome::Written { address, words }
            }
            Err(e) => {
                self.logger.warn(&format!(
                    "Write to {} at 0x{:04X} ({}) failed: {}",
                    target, address, capability, e
                ));
                WriteOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn prepare_write(
        &self,
        target: &RequestItem,
        value: Option<WriteValue>,
        capability_override: Option<WriteCapability>,
    ) -> std::result::Result<(WriteCapability, u16, Vec<u16>), String> {
        let model = &self.profile.model;
        let spec: Option<&AttributeSpec> = match target {
            RequestItem::Name(name) => Some(
                model
                    .lookup_name(name)
                    .ok_or_else(|| format!("unknown attribute '{}'", name))?,
            ),
            RequestItem::Address(documented) => {
                let wire = model
                    .wire_address(*documented)
                    .ok_or_else(|| format!("address 0x{:04X} is out of range", documented))?;
                model
                    .lookup_address(wire)
                    .find(|s| capability_override.or(s.write).is_some())
            }
        };

        let (capability, address, raw) = match spec {
            Some(spec) => {
                let capability = capability_override
                    .or(spec.write)
                    .ok_or_else(|| format!("'{}' is read-only", spec.name))?;
                let raw = match value {
                    Some(WriteValue::Engineering(v)) => {
                        let scaled = (v * spec.scale).round();
                        if !scaled.is_finite() || scaled.abs() > i64::MAX as f64 {
                            return Err(format!("value {} cannot be encoded", v));
                        }
                        scaled as i64
                    }
                    Some(WriteValue::Raw(r)) => r,
                    None => spec
                        .default_write
                        .ok_or_else(|| format!("'{}' has no default value", spec.name))?,
                };
                (capability, spec.address, raw)
            }
            None => {
                // Undocumented address: only with an explicit capability and value
                let RequestItem::Address(documented) = target else {
                    return Err(format!("'{}' is not writable", target));
                };
                let capability = capability_override
                    .ok_or_else(|| format!("address 0x{:04X} has no write capability", documented))?;
                let raw = match value {
                    Some(WriteValue::Raw(r)) => r,
                    Some(WriteValue::Engineering(v)) if v.fract() == 0.0 && v.is_finite() => {
                        v as i64
                    }
                    _ => return Err(format!("address 0x{:04X} needs a raw value", documented)),
                };
                let wire = model
                    .wire_address(*documented)
                    .ok_or_else(|| format!("address 0x{:04X} is out of range", documented))?;
                (capability, wire, raw)
            }
        };

        let width = match capability {
            WriteCapability::SingleRegister => 1,
            WriteCapability::MultipleRegisters => model.word_increment(),
        };
        let words = encode_for_write(raw, width).map_err(|e| e.to_string())?;
        Ok((capability, address, words))
    }
}
