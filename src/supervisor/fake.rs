//! Deterministic in-memory supervisor for tests
//!
//! Tracks specs and statuses without touching the OS. Tests script the
//! interesting transitions: flipping a process to errored, emitting exit
//! events, or injecting log lines.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{
    belongs_to_run, LifecycleEvent, ProcessSnapshot, ProcessSpec, ProcessStatus,
    ProcessSupervisor, StreamKind, SupervisorError, SupervisorEvent, SupervisorResult,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct FakeEntry {
    spec: ProcessSpec,
    status: parking_lot::Mutex<ProcessStatus>,
    pid: u32,
}

/// In-memory supervisor with scripted behaviour
pub struct FakeSupervisor {
    entries: DashMap<String, Arc<FakeEntry>>,
    events: broadcast::Sender<SupervisorEvent>,
    _receiver: broadcast::Receiver<SupervisorEvent>,
    /// Names that fail to start
    fail_to_start: parking_lot::Mutex<HashSet<String>>,
    /// Names that start in `launching` and only go online after this delay
    launch_delay: parking_lot::Mutex<Option<Duration>>,
    next_pid: std::sync::atomic::AtomicU32,
}

impl FakeSupervisor {
    /// Create a fake where every start succeeds and is online immediately
    pub fn new() -> Self {
        let (events, _receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
            _receiver,
            fail_to_start: parking_lot::Mutex::new(HashSet::new()),
            launch_delay: parking_lot::Mutex::new(None),
            next_pid: std::sync::atomic::AtomicU32::new(1000),
        }
    }

    /// Make starts of `name` fail with a spawn error
    pub fn fail_start_of(&self, name: &str) {
        self.fail_to_start.lock().insert(name.to_string());
    }

    /// Make every start linger in `launching` for `delay` before online
    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock() = Some(delay);
    }

    /// Directly set a process status
    pub fn set_status(&self, name: &str, status: ProcessStatus) {
        if let Some(entry) = self.entries.get(name) {
            *entry.status.lock() = status;
        }
    }

    /// Simulate a process exit: status flips and an exit event is emitted
    pub fn emit_exit(&self, name: &str, code: i32) {
        if let Some(entry) = self.entries.get(name) {
            *entry.status.lock() = if code == 0 {
                ProcessStatus::Stopped
            } else {
                ProcessStatus::Errored
            };
        }
        let _ = self.events.send(SupervisorEvent::Lifecycle {
            name: name.to_string(),
            event: LifecycleEvent::Exit { code: Some(code) },
        });
    }

    /// Inject a stdout log line for a process
    pub fn emit_log(&self, name: &str, line: &str) {
        let _ = self.events.send(SupervisorEvent::Log {
            name: name.to_string(),
            stream: StreamKind::Stdout,
            line: line.to_string(),
        });
    }

    /// Names of processes whose status counts as alive
    pub fn alive_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    *e.value().status.lock(),
                    ProcessStatus::Online | ProcessStatus::Launching
                )
            })
            .map(|e| e.key().clone())
            .collect()
    }

    /// Count of alive processes carrying the run-id suffix
    pub fn alive_with_suffix(&self, run_id: &str) -> usize {
        self.alive_names()
            .iter()
            .filter(|n| belongs_to_run(n, run_id))
            .count()
    }

    fn snapshot(entry: &FakeEntry) -> ProcessSnapshot {
        let status = *entry.status.lock();
        ProcessSnapshot {
            name: entry.spec.name.clone(),
            status,
            pid: matches!(status, ProcessStatus::Online | ProcessStatus::Launching)
                .then_some(entry.pid),
            cpu_percent: 0.0,
            memory_bytes: 0,
            instances: entry.spec.instances,
        }
    }
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn start(&self, spec: ProcessSpec) -> SupervisorResult<ProcessSnapshot> {
        if self.fail_to_start.lock().contains(&spec.name) {
            return Err(SupervisorError::Spawn {
                name: spec.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
            });
        }

        let name = spec.name.clone();
        let delay = *self.launch_delay.lock();
        let pid = self
            .next_pid
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let entry = Arc::new(FakeEntry {
            spec,
            status: parking_lot::Mutex::new(match delay {
                Some(_) => ProcessStatus::Launching,
                None => ProcessStatus::Online,
            }),
            pid,
        });
        self.entries.insert(name.clone(), entry.clone());

        if let Some(delay) = delay {
            let entry = entry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut status = entry.status.lock();
                if *status == ProcessStatus::Launching {
                    *status = ProcessStatus::Online;
                }
            });
        }

        let _ = self.events.send(SupervisorEvent::Lifecycle {
            name,
            event: LifecycleEvent::Start,
        });

        Ok(Self::snapshot(&entry))
    }

    async fn stop(&self, name: &str) -> SupervisorResult<()> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        *entry.status.lock() = ProcessStatus::Stopped;
        Ok(())
    }

    async fn delete(&self, name: &str) -> SupervisorResult<()> {
        self.entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    async fn list(&self) -> SupervisorResult<Vec<ProcessSnapshot>> {
        Ok(self.entries.iter().map(|e| Self::snapshot(e.value())).collect())
    }

    async fn describe(&self, name: &str) -> SupervisorResult<Option<ProcessSnapshot>> {
        Ok(self.entries.get(name).map(|e| Self::snapshot(e.value())))
    }

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_is_online_immediately() {
        let fake = FakeSupervisor::new();
        let snapshot = fake
            .start(ProcessSpec::new("svc_run-1", "svc.js"))
            .await
            .unwrap();
        assert_eq!(snapshot.status, ProcessStatus::Online);
        assert_eq!(fake.alive_with_suffix("run-1"), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let fake = FakeSupervisor::new();
        fake.fail_start_of("svc_run-1");
        let result = fake.start(ProcessSpec::new("svc_run-1", "svc.js")).await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_exit_event() {
        let fake = FakeSupervisor::new();
        let mut events = fake.subscribe();

        fake.start(ProcessSpec::new("svc_run-1", "svc.js")).await.unwrap();
        let _ = events.recv().await; // start event

        fake.emit_exit("svc_run-1", 3);
        match events.recv().await.unwrap() {
            SupervisorEvent::Lifecycle {
                event: LifecycleEvent::Exit { code },
                ..
            } => assert_eq!(code, Some(3)),
            other => panic!("unexpected event: {:?}", other),
        }

        let snapshot = fake.describe("svc_run-1").await.unwrap().unwrap();
        assert_eq!(snapshot.status, ProcessStatus::Errored);
    }

    #[tokio::test]
    async fn test_launch_delay() {
        let fake = FakeSupervisor::new();
        fake.set_launch_delay(Duration::from_millis(50));

        let snapshot = fake
            .start(ProcessSpec::new("svc_run-1", "svc.js"))
            .await
            .unwrap();
        assert_eq!(snapshot.status, ProcessStatus::Launching);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = fake.describe("svc_run-1").await.unwrap().unwrap();
        assert_eq!(snapshot.status, ProcessStatus::Online);
    }
}
