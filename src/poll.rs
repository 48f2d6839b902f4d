//! Poll Loop
//!
//! Each cycle reads every node, projects the output columns into one sample
//! and hands it to the telemetry pipeline. Ports are polled concurrently;
//! nodes on the same port are polled one after another because they share
//! a half-duplex link. Shutdown is only observed between cycles.

use crate::batch::RequestItem;
use crate::config::{OutputColumn, StartupWrite};
use crate::logging::{StructuredLogger, get_logger};
use crate::node::DeviceNode;
use crate::registers::ReadCapability;
use crate::telemetry::{PipelineHandle, Sample};
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};

/// A node plus what to do with it every cycle
pub struct PolledNode {
    pub node: DeviceNode,
    pub requests: Vec<RequestItem>,
    pub read_capability: Option<ReadCapability>,
    pub startup_writes: Vec<StartupWrite>,
}

impl PolledNode {
    pub fn new(node: DeviceNode, requests: Vec<RequestItem>) -> Self {
        Self {
            node,
            requests,
            read_capability: None,
            startup_writes: Vec::new(),
        }
    }
}

/// Per-port outcome of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortReport {
    pub nodes: usize,
    pub degraded_blocks: usize,
    pub failed_writes: usize,
}

/// Nodes sharing one port
pub struct PortGroup {
    name: String,
    nodes: Vec<PolledNode>,
    logger: StructuredLogger,
}

impl PortGroup {
    pub fn new(name: &str, nodes: Vec<PolledNode>) -> Self {
        Self {
            name: name.to_string(),
            nodes,
            logger: get_logger("poll"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, name: &str) -> Option<&DeviceNode> {
        self.nodes
            .iter()
            .map(|p| &p.node)
            .find(|n| n.name() == name)
    }

    /// Poll every node in order. Startup writes go out on the first cycle,
    /// before the node's first read.
    pub async fn poll(&mut self, first_cycle: bool) -> PortReport {
        let mut report = PortReport::default();
        for polled in &mut self.nodes {
            if first_cycle {
                for write in &polled.startup_writes {
                    let outcome = polled
                        .node
                        .write(&write.target, write.write_value(), write.capability)
                        .await;
                    if !outcome.is_written() {
                        report.failed_writes += 1;
                    }
                }
            }
            let read = polled
                .node
                .read(&polled.requests, polled.read_capability)
                .await;
            report.nodes += 1;
            report.degraded_blocks += read.degraded_blocks;
        }
        if report.degraded_blocks > 0 {
            self.logger.debug(&format!(
                "Port {}: {} degraded blocks this cycle",
                self.name, report.degraded_blocks
            ));
        }
        report
    }
}

/// Loop bookkeeping, owned by the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub first_cycle: bool,
    pub cycles: u64,
    pub last_cycle_at: Option<NaiveDateTime>,
    /// Cycles that took longer than the poll interval
    pub overruns: u64,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            first_cycle: true,
            cycles: 0,
            last_cycle_at: None,
            overruns: 0,
        }
    }
}

pub struct PollLoop {
    groups: Vec<Arc<Mutex<PortGroup>>>,
    columns: Vec<OutputColumn>,
    interval: Duration,
    timezone: Tz,
    pipeline: PipelineHandle,
    state: LoopState,
    logger: StructuredLogger,
}

impl PollLoop {
    pub fn new(
        groups: Vec<PortGroup>,
        columns: Vec<OutputColumn>,
        interval: Duration,
        timezone: Tz,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            groups: groups
                .into_iter()
                .map(|g| Arc::new(Mutex::new(g)))
                .collect(),
            columns,
            interval,
            timezone,
            pipeline,
            state: LoopState::default(),
            logger: get_logger("poll"),
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Current wall-clock time in the configured zone
    fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.timezone).naive_local()
    }

    /// Poll all ports once and build the sample. The sample is not queued.
    pub async fn run_cycle(&mut self) -> Sample {
        let first_cycle = self.state.first_cycle;
        let mut tasks = JoinSet::new();
        for group in &self.groups {
            let group = Arc::clone(group);
            tasks.spawn(async move {
                let mut group = group.lock().await;
                group.poll(first_cycle).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                // A panicking port must not take the others down
                self.logger.error(&format!("Port task failed: {}", e));
            }
        }

        let timestamp = self.local_now();
        let mut guards = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            guards.push(group.lock().await);
        }
        let sample = Sample::project(&self.columns, timestamp, first_cycle, |node, attribute| {
            guards
                .iter()
                .find_map(|g| g.node(node))
                .and_then(|n| n.value(attribute).cloned())
        });
        drop(guards);

        self.state.first_cycle = false;
        self.state.cycles += 1;
        self.state.last_cycle_at = Some(timestamp);
        sample
    }

    /// Poll until `shutdown` turns true or its sender goes away
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.logger.info(&format!(
            "Poll loop started: {} ports, interval {:?}",
            self.groups.len(),
            self.interval
        ));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let sample = self.run_cycle().await;
            if let Err(e) = self.pipeline.submit(sample).await {
                self.logger.error(&format!("Cannot queue sample: {}", e));
                break;
            }

            let elapsed = started.elapsed();
            if elapsed > self.interval {
                self.state.overruns += 1;
                self.logger.warn(&format!(
                    "Cycle {} took {:?}, longer than the {:?} interval",
                    self.state.cycles, elapsed, self.interval
                ));
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.logger.info(&format!(
            "Poll loop stopped after {} cycles",
            self.state.cycles
        ));
    }
}
