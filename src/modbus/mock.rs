//! Scripted in-memory transport
//!
//! Serves reads from a register image and records every call. Individual
//! addresses can be made to fail, which is how tests exercise degraded blocks
//! without a bus.

use super::Transport;
use crate::error::{FieldgateError, Result};
use crate::registers::ReadCapability;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Read {
        slave_id: u8,
        capability: ReadCapability,
        start: u16,
        count: u16,
    },
    WriteSingle {
        slave_id: u8,
        address: u16,
        word: u16,
    },
    WriteMultiple {
        slave_id: u8,
        start: u16,
        words: Vec<u16>,
    },
}

#[derive(Debug, Default)]
struct MockState {
    registers: HashMap<(u8, u16), u16>,
    failing: HashSet<u16>,
    offline: bool,
    calls: Vec<MockCall>,
}

/// Transport backed by a register image. Clones share state, so a test can
/// keep one handle while a node owns another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Set consecutive registers starting at `start`
    pub fn set_registers(&self, slave_id: u8, start: u16, words: &[u16]) {
        self.with_state(|s| {
            for (offset, word) in words.iter().enumerate() {
                s.registers.insert((slave_id, start + offset as u16), *word);
            }
        });
    }

    pub fn register(&self, slave_id: u8, address: u16) -> Option<u16> {
        self.with_state(|s| s.registers.get(&(slave_id, address)).copied())
    }

    /// Any request touching `address` fails
    pub fn fail_address(&self, address: u16) {
        self.with_state(|s| {
            s.failing.insert(address);
        });
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| s.failing.clear());
    }

    /// Every request fails as if the link were down
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn read_count(&self) -> usize {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| matches!(c, MockCall::Read { .. }))
                .count()
        })
    }

    fn check(state: &MockState, start: u16, count: u16) -> Result<()> {
        if state.offline {
            return Err(FieldgateError::transport("connection error: link down"));
        }
        let end = u32::from(start) + u32::from(count);
        if (u32::from(start)..end).any(|a| state.failing.contains(&(a as u16))) {
            return Err(FieldgateError::transport(format!(
                "exception response: no reply at 0x{:04X}",
                start
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_block(
        &mut self,
        slave_id: u8,
        capability: ReadCapability,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.with_state(|s| {
            s.calls.push(MockCall::Read {
                slave_id,
                capability,
                start,
                count,
            });
            Self::check(s, start, count)?;
            let words = (0..count)
                .map(|i| {
                    let word = s
                        .registers
                        .get(&(slave_id, start.wrapping_add(i)))
                        .copied()
                        .unwrap_or(0);
                    if capability.is_bit_access() {
                        u16::from(word != 0)
                    } else {
                        word
                    }
                })
                .collect();
            Ok(words)
        })
    }

    async fn write_single(&mut self, slave_id: u8, address: u16, word: u16) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(MockCall::WriteSingle {
                slave_id,
                address,
                word,
            });
            Self::check(s, address, 1)?;
            s.registers.insert((slave_id, address), word);
            Ok(())
        })
    }

    async fn write_multiple(&mut self, slave_id: u8, start: u16, words: &[u16]) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(MockCall::WriteMultiple {
                slave_id,
                start,
                words: words.to_vec(),
            });
            Self::check(s, start, words.len() as u16)?;
            for (offset, word) in words.iter().enumerate() {
                s.registers
                    .insert((slave_id, start.wrapping_add(offset as u16)), *word);
            }
            Ok(())
        })
    }

    fn connection_status(&self) -> Option<bool> {
        Some(self.with_state(|s| !s.offline))
    }
}
