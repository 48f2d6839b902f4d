//! Process orchestration
//!
//! Builds the whole agent from a validated configuration: device profiles,
//! one transport per port, device nodes, sinks, the telemetry worker and the
//! poll loop. [`TelemetryAgent::run`] polls until shutdown is signalled and
//! then lets the telemetry worker drain its queue into the durable logs.

use crate::config::{Config, PortConfig, SinkKind};
use crate::error::{FieldgateError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::modbus::{ModbusTransport, SharedTransport, shared};
use crate::node::DeviceNode;
use crate::poll::{LoopState, PollLoop, PolledNode, PortGroup};
use crate::registers::ModelLibrary;
use crate::telemetry::{
    DirectorySink, DurableLog, FtpSink, SinkChannel, SinkTarget, SqlSink, TelemetryPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

pub struct TelemetryAgent {
    poll_loop: PollLoop,
    pipeline: TelemetryPipeline,
    shutdown_tx: Arc<watch::Sender<bool>>,
    drain_timeout: Duration,
    logger: StructuredLogger,
}

impl TelemetryAgent {
    /// Build from configuration, loading models from `config.models_dir` and
    /// opening Modbus transports for every port
    pub fn new(config: &Config) -> Result<Self> {
        let library = ModelLibrary::load(&config.models_dir, &config.models)?;
        Self::build(config, &library, |port| {
            shared(ModbusTransport::new(
                &port.name,
                &port.transport,
                Duration::from_millis(port.timeout_ms),
            ))
        })
    }

    /// Build with an explicit model library and transport factory
    pub fn build<F>(config: &Config, library: &ModelLibrary, make_transport: F) -> Result<Self>
    where
        F: Fn(&PortConfig) -> SharedTransport,
    {
        let logger = get_logger("agent");
        config.validate()?;
        let timezone = config.tz()?;

        let mut groups = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            let transport = make_transport(port);
            let mut nodes = Vec::with_capacity(port.nodes.len());
            for node_cfg in &port.nodes {
                let profile = library.get(&node_cfg.model).ok_or_else(|| {
                    FieldgateError::validation(
                        format!("nodes.{}.model", node_cfg.name),
                        format!("Unknown device model '{}'", node_cfg.model),
                    )
                })?;
                let node = DeviceNode::new(
                    &node_cfg.name,
                    node_cfg.slave_id,
                    profile,
                    Arc::clone(&transport),
                    Duration::from_millis(node_cfg.delay_ms),
                );
                nodes.push(PolledNode {
                    node,
                    requests: node_cfg.requests.clone(),
                    read_capability: node_cfg.read_capability,
                    startup_writes: node_cfg.startup_writes.clone(),
                });
            }
            logger.info(&format!(
                "Port {}: {} nodes",
                port.name,
                nodes.len()
            ));
            groups.push(PortGroup::new(&port.name, nodes));
        }

        let telemetry = &config.telemetry;
        let mut sinks = Vec::with_capacity(telemetry.sinks.len());
        let mut longest_timeout = Duration::ZERO;
        for sink_cfg in &telemetry.sinks {
            let op_timeout = Duration::from_secs(sink_cfg.timeout_secs);
            longest_timeout = longest_timeout.max(op_timeout);
            let target = match &sink_cfg.kind {
                SinkKind::Sql {
                    url,
                    table,
                    row_limit,
                } => SinkTarget::Relational {
                    sink: Arc::new(SqlSink::connect_lazy(url, table, op_timeout)?),
                    row_limit: *row_limit,
                },
                SinkKind::Directory { remote_dir } => SinkTarget::FileServer {
                    sink: Arc::new(DirectorySink::new(remote_dir.clone())),
                },
                SinkKind::Ftp {
                    host,
                    port,
                    user,
                    password,
                    remote_dir,
                } => SinkTarget::FileServer {
                    sink: Arc::new(FtpSink::new(host, *port, user, password, remote_dir)),
                },
            };
            let log = DurableLog::new(
                telemetry.log_directory.join(&sink_cfg.log_file),
                telemetry.retention_days,
            );
            sinks.push(SinkChannel::new(
                &sink_cfg.name,
                log,
                target,
                Duration::from_secs(sink_cfg.min_interval_secs),
                op_timeout,
            ));
        }
        if sinks.is_empty() {
            logger.warn("No telemetry sinks configured; samples are not stored");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, pipeline) =
            TelemetryPipeline::new(sinks, telemetry.queue_capacity, shutdown_rx);
        let poll_loop = PollLoop::new(
            groups,
            config.output.clone(),
            Duration::from_millis(config.poll_interval_ms),
            timezone,
            handle,
        );

        Ok(Self {
            poll_loop,
            pipeline,
            shutdown_tx: Arc::new(shutdown_tx),
            drain_timeout: longest_timeout * 2 + Duration::from_secs(5),
            logger,
        })
    }

    /// Bound on the wait for in-flight remote deliveries at shutdown
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Sender that stops the agent when `true` is sent
    pub fn shutdown_sender(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown_tx)
    }

    /// Poll until shutdown, then drain the telemetry queue. Returns the
    /// final loop state.
    pub async fn run(self) -> Result<LoopState> {
        let Self {
            mut poll_loop,
            pipeline,
            shutdown_tx,
            drain_timeout,
            logger,
        } = self;

        let worker = tokio::spawn(pipeline.run());
        poll_loop.run(shutdown_tx.subscribe()).await;
        let state = poll_loop.state().clone();

        // The loop may also stop on its own; make sure the worker skips remote work
        let _ = shutdown_tx.send(true);
        drop(poll_loop);

        match timeout(drain_timeout, worker).await {
            Ok(Ok(())) => {
                logger.info(&format!("Stopped cleanly after {} cycles", state.cycles));
                Ok(state)
            }
            Ok(Err(e)) => Err(FieldgateError::generic(format!(
                "Telemetry worker failed: {}",
                e
            ))),
            Err(_) => {
                // Every sample is already in the durable logs
                logger.warn("Telemetry worker did not drain in time; abandoning it");
                Ok(state)
            }
        }
    }
}
