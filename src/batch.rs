//! Address Resolver / Batcher
//!
//! Turns a mixed list of attribute names and raw addresses into the fewest
//! read transactions that honor the device's maximum block span. Blocks never
//! mix read capabilities, and aliases (several names on one address) share a
//! single slot so the register is read once.

use crate::registers::{DeviceModel, ReadCapability};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// A requested attribute: by name or by documented register address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestItem {
    Address(u16),
    Name(String),
}

impl From<&str> for RequestItem {
    fn from(name: &str) -> Self {
        RequestItem::Name(name.to_string())
    }
}

impl From<String> for RequestItem {
    fn from(name: String) -> Self {
        RequestItem::Name(name)
    }
}

impl From<u16> for RequestItem {
    fn from(address: u16) -> Self {
        RequestItem::Address(address)
    }
}

impl fmt::Display for RequestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestItem::Address(a) => write!(f, "0x{:04X}", a),
            RequestItem::Name(n) => write!(f, "{}", n),
        }
    }
}

/// Label given to a raw address that is not in the register table
pub fn raw_label(address: u16) -> String {
    format!("Hx{:04X}", address)
}

/// One register address inside a block and the names bound to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSlot {
    pub address: u16,
    pub names: Vec<String>,
}

/// One read transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadBlock {
    pub capability: ReadCapability,
    pub start: u16,
    /// Address of the last member (not the last word read)
    pub end: u16,
    pub slots: Vec<BlockSlot>,
}

impl ReadBlock {
    /// Addresses per value: coils and discrete inputs hold one bit per
    /// address whatever the model's register width
    pub fn increment(&self, word_increment: u16) -> u16 {
        if self.capability.is_bit_access() {
            1
        } else {
            word_increment
        }
    }

    /// Words to request so the last member's full value is covered
    pub fn word_count(&self, word_increment: u16) -> u16 {
        self.end - self.start + self.increment(word_increment)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots
            .iter()
            .flat_map(|s| s.names.iter().map(String::as_str))
    }
}

/// Result of resolving one request list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPlan {
    pub blocks: Vec<ReadBlock>,
    /// Names that matched nothing readable; they are dropped
    pub unresolved: Vec<String>,
    /// Wire addresses read without a table entry
    pub raw_addresses: Vec<u16>,
}

struct Member {
    address: u16,
    name: String,
}

/// Resolve requested items against the model and group them into blocks.
///
/// Names resolve case-insensitively. Addresses are documented addresses: the
/// model's shift is added before matching. An address with no table entry is
/// read under a synthetic `HxNNNN` label using the override capability or the
/// model's default. `capability_override` forces every block onto one function
/// code.
pub fn resolve(
    model: &DeviceModel,
    requested: &[RequestItem],
    capability_override: Option<ReadCapability>,
) -> BlockPlan {
    let mut plan = BlockPlan::default();
    let mut seen_names = HashSet::new();
    let mut groups: BTreeMap<ReadCapability, Vec<Member>> = BTreeMap::new();

    for item in requested {
        let resolved = match item {
            RequestItem::Name(name) => match model.lookup_name(name) {
                Some(spec) => match capability_override.or(spec.read) {
                    Some(cap) => Some((cap, spec.address, spec.name.clone())),
                    None => {
                        plan.unresolved.push(name.clone());
                        None
                    }
                },
                None => {
                    plan.unresolved.push(name.clone());
                    None
                }
            },
            RequestItem::Address(documented) => match model.wire_address(*documented) {
                Some(wire) => {
                    let spec = model
                        .lookup_address(wire)
                        .find(|s| capability_override.or(s.read).is_some());
                    match spec {
                        Some(spec) => capability_override
                            .or(spec.read)
                            .map(|cap| (cap, wire, spec.name.clone())),
                        None => {
                            plan.raw_addresses.push(wire);
                            let cap = capability_override.unwrap_or(model.default_read());
                            Some((cap, wire, raw_label(wire)))
                        }
                    }
                }
                None => {
                    plan.unresolved.push(item.to_string());
                    None
                }
            },
        };

        if let Some((cap, address, name)) = resolved
            && seen_names.insert(name.to_ascii_lowercase())
        {
            groups.entry(cap).or_default().push(Member { address, name });
        }
    }

    for (cap, mut members) in groups {
        // Stable: aliases keep request order inside their slot
        members.sort_by_key(|m| m.address);
        plan.blocks
            .extend(group_members(cap, members, model.max_block_span()));
    }
    plan.blocks.sort_by_key(|b| (b.start, b.capability));
    plan
}

/// Greedy grouping of address-sorted members
fn group_members(capability: ReadCapability, members: Vec<Member>, span: u16) -> Vec<ReadBlock> {
    let mut blocks: Vec<ReadBlock> = Vec::new();
    for member in members {
        let fits = blocks.last().is_some_and(|b| {
            u32::from(member.address) - u32::from(b.start) + 1 <= u32::from(span)
        });
        if !fits {
            blocks.push(ReadBlock {
                capability,
                start: member.address,
                end: member.address,
                slots: Vec::new(),
            });
        }
        let Some(block) = blocks.last_mut() else {
            continue;
        };
        block.end = member.address;
        match block.slots.last_mut() {
            Some(slot) if slot.address == member.address => slot.names.push(member.name),
            _ => block.slots.push(BlockSlot {
                address: member.address,
                names: vec![member.name],
            }),
        }
    }
    blocks
}
