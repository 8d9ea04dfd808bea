//! Source adapters feeding the backlog.
//!
//! A harvester converts a stream of external events (file tail lines, socket
//! lines, queue messages) into record ingests. The supervisor builds
//! harvesters from the typed configs declared in the configuration file and
//! drives their lifecycle.

pub mod file;
pub mod queue;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backlog::Backlog;
use crate::error::Result;
use crate::store::LogRecord;

pub use file::{FileHarvester, FileHarvesterConfig};
pub use queue::{QueueHarvester, QueueHarvesterConfig, QueueMode};
pub use socket::{SocketHarvester, SocketHarvesterConfig};

/// Handle through which harvesters push accepted records. Injects the
/// configured timestamp column (current UTC, ISO-8601) when absent, then
/// enqueues with backpressure.
#[derive(Clone)]
pub struct Sink {
    backlog: Arc<Backlog>,
    timestamp_field: String,
}

impl Sink {
    pub fn new(backlog: Arc<Backlog>, timestamp_field: impl Into<String>) -> Self {
        Self { backlog, timestamp_field: timestamp_field.into() }
    }

    pub async fn ingest(&self, mut record: LogRecord) {
        if !record.contains_key(&self.timestamp_field) {
            record.insert(
                self.timestamp_field.clone(),
                Value::String(Utc::now().to_rfc3339()),
            );
        }
        self.backlog.add(record).await;
    }
}

/// A running source adapter. `run` owns the harvester's main loop and must
/// return promptly once `cancel` fires, releasing sockets and descriptors on
/// the way out. Errors are handled inside the loop; a harvester never aborts
/// the process.
#[async_trait]
pub trait Harvester: Send + 'static {
    fn name(&self) -> &str;

    async fn run(&mut self, sink: Sink, cancel: CancellationToken);
}

/// Typed harvester configuration, dispatched on the `type` field. Decoding
/// an unknown type fails the entry, which the supervisor logs and skips.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarvesterKind {
    File(FileHarvesterConfig),
    Socket(SocketHarvesterConfig),
    Queue(QueueHarvesterConfig),
}

impl HarvesterKind {
    fn type_name(&self) -> &'static str {
        match self {
            HarvesterKind::File(_) => "file",
            HarvesterKind::Socket(_) => "socket",
            HarvesterKind::Queue(_) => "queue",
        }
    }
}

#[derive(Debug, Deserialize)]
struct HarvesterEntry {
    name: Option<String>,
    #[serde(flatten)]
    kind: HarvesterKind,
}

fn build(entry: HarvesterEntry) -> Result<Box<dyn Harvester>> {
    let name = entry
        .name
        .unwrap_or_else(|| entry.kind.type_name().to_string());
    Ok(match entry.kind {
        HarvesterKind::File(config) => Box::new(FileHarvester::new(name, config)?),
        HarvesterKind::Socket(config) => Box::new(SocketHarvester::new(name, config)?),
        HarvesterKind::Queue(config) => Box::new(QueueHarvester::new(name, config)?),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvesterState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct Slot {
    name: String,
    state: HarvesterState,
    harvester: Option<Box<dyn Harvester>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Builds harvesters from raw config mappings and fans their lifecycle out.
pub struct Supervisor {
    sink: Sink,
    slots: Vec<Slot>,
}

impl Supervisor {
    pub fn new(sink: Sink) -> Self {
        Self { sink, slots: Vec::new() }
    }

    /// Decode and construct each configured harvester. Entries with unknown
    /// types or invalid fields are logged and skipped; they never abort
    /// startup.
    pub fn load(&mut self, configs: &[serde_yaml::Value]) {
        for raw in configs {
            let entry: HarvesterEntry = match serde_yaml::from_value(raw.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping harvester with invalid config: {e}");
                    continue;
                }
            };
            match build(entry) {
                Ok(harvester) => self.add(harvester),
                Err(e) => tracing::warn!("skipping harvester: {e}"),
            }
        }
    }

    /// Register an already-built harvester in the Idle state.
    pub fn add(&mut self, harvester: Box<dyn Harvester>) {
        self.slots.push(Slot {
            name: harvester.name().to_string(),
            state: HarvesterState::Idle,
            harvester: Some(harvester),
            cancel: None,
            task: None,
        });
    }

    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn state_of(&self, name: &str) -> Option<HarvesterState> {
        self.slots.iter().find(|s| s.name == name).map(|s| s.state)
    }

    /// Launch every idle harvester. Double-start is a no-op.
    pub fn start_all(&mut self) {
        for slot in &mut self.slots {
            if slot.state != HarvesterState::Idle {
                continue;
            }
            let Some(mut harvester) = slot.harvester.take() else {
                continue;
            };
            tracing::info!("starting harvester: {}", slot.name);
            let cancel = CancellationToken::new();
            let sink = self.sink.clone();
            let child = cancel.clone();
            slot.task = Some(tokio::spawn(async move {
                harvester.run(sink, child).await;
            }));
            slot.cancel = Some(cancel);
            slot.state = HarvesterState::Running;
        }
    }

    /// Cancel every running harvester, then await their exits.
    pub async fn stop_all(&mut self) {
        for slot in &mut self.slots {
            if slot.state == HarvesterState::Running {
                tracing::info!("stopping harvester: {}", slot.name);
                slot.state = HarvesterState::Stopping;
                if let Some(cancel) = &slot.cancel {
                    cancel.cancel();
                }
            }
        }
        for slot in &mut self.slots {
            if slot.state != HarvesterState::Stopping {
                continue;
            }
            if let Some(task) = slot.task.take() {
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        tracing::error!("harvester {} exited abnormally: {e}", slot.name);
                    }
                }
            }
            slot.cancel = None;
            slot.state = HarvesterState::Stopped;
        }
    }
}

/// Sleep that wakes early on cancellation; returns true when cancelled.
pub(crate) async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MockHarvester {
        name: String,
    }

    #[async_trait]
    impl Harvester for MockHarvester {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&mut self, _sink: Sink, cancel: CancellationToken) {
            cancel.cancelled().await;
        }
    }

    fn sink() -> Sink {
        Sink::new(Arc::new(Backlog::new(16)), "timestamp")
    }

    fn yaml(raw: &str) -> serde_yaml::Value {
        serde_yaml::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn sink_injects_missing_timestamp() {
        let backlog = Arc::new(Backlog::new(16));
        let sink = Sink::new(backlog.clone(), "timestamp");
        sink.ingest(json!({"message": "hi"}).as_object().cloned().unwrap())
            .await;
        sink.ingest(
            json!({"message": "ho", "timestamp": "2024-01-01T00:00:00+00:00"})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .await;

        let drained = backlog.drain(10);
        assert!(drained[0]["timestamp"].is_string());
        assert_eq!(drained[1]["timestamp"], json!("2024-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn load_skips_unknown_types_and_bad_configs() {
        let mut supervisor = Supervisor::new(sink());
        supervisor.load(&[
            yaml("{type: nothing_here, name: bad}"),
            yaml("{type: file, name: no_path_given}"),
            yaml("{type: socket, name: no_port_or_path}"),
            yaml("{type: file, name: good, path: /tmp/a.log}"),
        ]);
        assert_eq!(supervisor.names(), vec!["good"]);
    }

    #[tokio::test]
    async fn name_defaults_to_type() {
        let mut supervisor = Supervisor::new(sink());
        supervisor.load(&[yaml("{type: file, path: /tmp/a.log}")]);
        assert_eq!(supervisor.names(), vec!["file"]);
    }

    #[tokio::test]
    async fn lifecycle_runs_idle_to_stopped() {
        let mut supervisor = Supervisor::new(sink());
        supervisor.add(Box::new(MockHarvester { name: "mock".to_string() }));
        assert_eq!(supervisor.state_of("mock"), Some(HarvesterState::Idle));

        supervisor.start_all();
        assert_eq!(supervisor.state_of("mock"), Some(HarvesterState::Running));

        // Double start must not disturb the running harvester.
        supervisor.start_all();
        assert_eq!(supervisor.state_of("mock"), Some(HarvesterState::Running));

        supervisor.stop_all().await;
        assert_eq!(supervisor.state_of("mock"), Some(HarvesterState::Stopped));
    }
}
