//! Node-local supervisor backend
//!
//! Spawns and tracks OS processes with tokio, multiplexing their output
//! into the shared event stream and per-process log files. Implements the
//! restart policies the service specs declare: crash auto-restart for
//! stateless services, memory-ceiling recycling, and staggered periodic
//! restarts.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use dashmap::DashMap;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    LifecycleEvent, ProcessSnapshot, ProcessSpec, ProcessStatus, ProcessSupervisor, StreamKind,
    SupervisorError, SupervisorEvent, SupervisorResult,
};

/// Event channel capacity; sized for console bursts from many services
const EVENT_CHANNEL_CAPACITY: usize = 8192;

/// Delay before a crashed auto-restart instance is respawned
const CRASH_RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Gap between instance recycles during a periodic restart
const RECYCLE_STAGGER: Duration = Duration::from_secs(5);

/// Memory watchdog polling interval
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Marker prefix for structured child messages on stdout
const MESSAGE_PREFIX: &str = "@msg ";

struct InstanceCtl {
    pid: u32,
    recycle: CancellationToken,
}

struct Entry {
    spec: ProcessSpec,
    status: parking_lot::Mutex<ProcessStatus>,
    instances: parking_lot::Mutex<HashMap<u16, InstanceCtl>>,
    stopping: AtomicBool,
    cancel: CancellationToken,
}

impl Entry {
    fn set_status(&self, status: ProcessStatus) {
        *self.status.lock() = status;
    }

    fn status(&self) -> ProcessStatus {
        *self.status.lock()
    }

    fn pids(&self) -> Vec<u32> {
        self.instances.lock().values().map(|i| i.pid).collect()
    }
}

struct Inner {
    weak: std::sync::Weak<Inner>,
    entries: DashMap<String, Arc<Entry>>,
    events: broadcast::Sender<SupervisorEvent>,
    op_lock: tokio::sync::Mutex<()>,
    system: parking_lot::Mutex<System>,
    kill_grace: Duration,
}

/// Supervisor backed by local OS processes
pub struct LocalSupervisor {
    inner: Arc<Inner>,
    // Keep a receiver so the channel never closes
    _receiver: broadcast::Receiver<SupervisorEvent>,
}

impl LocalSupervisor {
    /// Create a supervisor with the default 10 s kill-grace
    pub fn new() -> Self {
        Self::with_kill_grace(Duration::from_secs(10))
    }

    /// Create a supervisor with a custom kill-grace
    pub fn with_kill_grace(kill_grace: Duration) -> Self {
        let (events, _receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new_cyclic(|weak| Inner {
                weak: weak.clone(),
                entries: DashMap::new(),
                events,
                op_lock: tokio::sync::Mutex::new(()),
                system: parking_lot::Mutex::new(System::new()),
                kill_grace,
            }),
            _receiver,
        }
    }
}

impl Default for LocalSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn handle(&self) -> Arc<Inner> {
        self.weak.upgrade().expect("supervisor dropped")
    }

    fn emit(&self, event: SupervisorEvent) {
        // Ignore send errors (no receivers)
        let _ = self.events.send(event);
    }

    /// Spawn one instance and register its output pumps and exit watcher.
    fn spawn_instance(&self, entry: &Arc<Entry>, index: u16) -> SupervisorResult<u32> {
        let spec = &entry.spec;

        let mut cmd = match &spec.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&spec.script);
                c
            }
            None => Command::new(&spec.script),
        };
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&spec.env);
        if let Some(port) = spec.port {
            // Replicas listen on contiguous ports starting at the base
            cmd.env("PORT", (port + index).to_string());
        }
        cmd.env("INSTANCE_ID", index.to_string());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            name: spec.name.clone(),
            source: e,
        })?;
        let pid = child.id().unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            self.pump(entry, StreamKind::Stdout, stdout, spec.out_log.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump(entry, StreamKind::Stderr, stderr, spec.err_log.clone());
        }

        let recycle = CancellationToken::new();
        entry
            .instances
            .lock()
            .insert(index, InstanceCtl { pid, recycle: recycle.clone() });

        self.watch_instance(entry.clone(), index, child, recycle);
        debug!("Spawned {} instance {} (pid {})", spec.name, index, pid);
        Ok(pid)
    }

    /// Forward one output stream to the event bus and its log file.
    fn pump(
        &self,
        entry: &Arc<Entry>,
        stream: StreamKind,
        reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        log_path: Option<std::path::PathBuf>,
    ) {
        let inner = self.handle();
        let name = entry.spec.name.clone();
        tokio::spawn(async move {
            let mut log_file = match &log_path {
                Some(path) => tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| warn!("Cannot open log file {}: {}", path.display(), e))
                    .ok(),
                None => None,
            };

            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(file) = log_file.as_mut() {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }

                // Structured child messages ride stdout behind a marker
                if stream == StreamKind::Stdout {
                    if let Some(rest) = line.strip_prefix(MESSAGE_PREFIX) {
                        if let Ok(payload) = serde_json::from_str(rest) {
                            inner.emit(SupervisorEvent::Message {
                                name: name.clone(),
                                payload,
                            });
                            continue;
                        }
                    }
                }

                inner.emit(SupervisorEvent::Log {
                    name: name.clone(),
                    stream,
                    line,
                });
            }
        });
    }

    /// Watch one instance until it exits, handling stop, recycle, crash
    /// auto-restart, and final status accounting.
    fn watch_instance(
        &self,
        entry: Arc<Entry>,
        index: u16,
        mut child: Child,
        recycle: CancellationToken,
    ) {
        let inner = self.handle();
        tokio::spawn(async move {
            enum Outcome {
                Exited(Option<i32>),
                Recycled,
                Stopped(Option<i32>),
            }

            let outcome = tokio::select! {
                status = child.wait() => {
                    Outcome::Exited(status.ok().and_then(|s| s.code()))
                }
                _ = recycle.cancelled() => {
                    let _ = graceful_kill(&mut child, inner.kill_grace).await;
                    Outcome::Recycled
                }
                _ = entry.cancel.cancelled() => {
                    let code = graceful_kill(&mut child, inner.kill_grace).await;
                    Outcome::Stopped(code)
                }
            };

            entry.instances.lock().remove(&index);
            let name = entry.spec.name.clone();

            match outcome {
                Outcome::Recycled => {
                    if inner.spawn_instance(&entry, index).is_ok() {
                        inner.emit(SupervisorEvent::Lifecycle {
                            name,
                            event: LifecycleEvent::Restart,
                        });
                    }
                }
                Outcome::Stopped(code) => {
                    if entry.instances.lock().is_empty() {
                        entry.set_status(ProcessStatus::Stopped);
                    }
                    inner.emit(SupervisorEvent::Lifecycle {
                        name,
                        event: LifecycleEvent::Exit { code },
                    });
                }
                Outcome::Exited(code) => {
                    let stopping = entry.stopping.load(Ordering::SeqCst);
                    inner.emit(SupervisorEvent::Lifecycle {
                        name: name.clone(),
                        event: LifecycleEvent::Exit { code },
                    });

                    if stopping {
                        if entry.instances.lock().is_empty() {
                            entry.set_status(ProcessStatus::Stopped);
                        }
                    } else if entry.spec.autorestart {
                        info!("{} instance {} exited ({:?}), restarting", name, index, code);
                        tokio::time::sleep(CRASH_RESPAWN_DELAY).await;
                        if entry.stopping.load(Ordering::SeqCst) {
                            return;
                        }
                        if inner.spawn_instance(&entry, index).is_ok() {
                            inner.emit(SupervisorEvent::Lifecycle {
                                name,
                                event: LifecycleEvent::Restart,
                            });
                        } else {
                            entry.set_status(ProcessStatus::Errored);
                        }
                    } else if entry.instances.lock().is_empty() {
                        entry.set_status(if code == Some(0) {
                            ProcessStatus::Stopped
                        } else {
                            ProcessStatus::Errored
                        });
                    }
                }
            }
        });
    }

    /// Poll instance memory and recycle any instance over its ceiling.
    fn start_memory_watchdog(&self, entry: Arc<Entry>, limit_mb: u64) {
        let inner = self.handle();
        tokio::spawn(async move {
            let limit_bytes = limit_mb * 1024 * 1024;
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let pids: Vec<(u16, u32)> = entry
                    .instances
                    .lock()
                    .iter()
                    .map(|(i, ctl)| (*i, ctl.pid))
                    .collect();

                let over: Vec<u16> = {
                    let mut system = inner.system.lock();
                    system.refresh_processes(ProcessesToUpdate::All, true);
                    pids.into_iter()
                        .filter(|(_, pid)| {
                            system
                                .process(Pid::from_u32(*pid))
                                .map(|p| p.memory() > limit_bytes)
                                .unwrap_or(false)
                        })
                        .map(|(i, _)| i)
                        .collect()
                };

                for index in over {
                    warn!(
                        "{} instance {} over memory ceiling ({} MB), recycling",
                        entry.spec.name, index, limit_mb
                    );
                    if let Some(ctl) = entry.instances.lock().get(&index) {
                        ctl.recycle.cancel();
                    }
                }
            }
        });
    }

    /// Restart instances one at a time on the staggered schedule.
    fn start_periodic_restart(&self, entry: Arc<Entry>) {
        let Some(schedule) = entry.spec.periodic_restart else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let wait = until_next_slot(schedule.minute_offset, schedule.every_hours);
                tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }

                let indices: Vec<u16> = entry.instances.lock().keys().copied().collect();
                info!(
                    "Periodic restart of {} ({} instances)",
                    entry.spec.name,
                    indices.len()
                );
                for index in indices {
                    if entry.cancel.is_cancelled() {
                        return;
                    }
                    if let Some(ctl) = entry.instances.lock().get(&index) {
                        ctl.recycle.cancel();
                    }
                    tokio::time::sleep(RECYCLE_STAGGER).await;
                }
            }
        });
    }

    fn snapshot(&self, entry: &Entry) -> ProcessSnapshot {
        let pids = entry.pids();
        let (cpu, memory) = {
            let mut system = self.system.lock();
            system.refresh_processes(ProcessesToUpdate::All, true);
            pids.iter().fold((0.0f32, 0u64), |(cpu, mem), pid| {
                match system.process(Pid::from_u32(*pid)) {
                    Some(p) => (cpu + p.cpu_usage(), mem + p.memory()),
                    None => (cpu, mem),
                }
            })
        };

        ProcessSnapshot {
            name: entry.spec.name.clone(),
            status: entry.status(),
            pid: pids.first().copied(),
            cpu_percent: cpu,
            memory_bytes: memory,
            instances: entry.spec.instances,
        }
    }

    async fn stop_entry(&self, entry: &Arc<Entry>) {
        entry.stopping.store(true, Ordering::SeqCst);
        entry.set_status(ProcessStatus::Stopping);
        entry.cancel.cancel();

        // Wait for the watchers to reap every instance
        let deadline = tokio::time::Instant::now() + self.kill_grace + Duration::from_secs(5);
        while !entry.instances.lock().is_empty() {
            if tokio::time::Instant::now() > deadline {
                warn!("Timed out waiting for {} instances to die", entry.spec.name);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        entry.set_status(ProcessStatus::Stopped);
    }
}

/// Send SIGTERM, wait out the grace period, then force kill.
async fn graceful_kill(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        _ => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    }
}

/// Duration until the next wall-clock minute matching the schedule
fn until_next_slot(minute_offset: u8, every_hours: u8) -> Duration {
    let now = chrono::Utc::now();
    let every = every_hours.max(1) as u32;
    let mut candidate_minutes = 1u64;

    loop {
        let t = now + chrono::Duration::minutes(candidate_minutes as i64);
        if t.minute() == minute_offset as u32 && t.hour() % every == 0 {
            return Duration::from_secs(candidate_minutes * 60);
        }
        candidate_minutes += 1;
        if candidate_minutes > 60 * 24 {
            // Unsatisfiable schedule; retry in an hour
            return Duration::from_secs(3600);
        }
    }
}

#[async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn start(&self, spec: ProcessSpec) -> SupervisorResult<ProcessSnapshot> {
        let _guard = self.inner.op_lock.lock().await;

        if let Some(existing) = self.inner.entries.get(&spec.name) {
            match existing.status() {
                ProcessStatus::Stopped | ProcessStatus::Errored => {
                    drop(existing);
                    self.inner.entries.remove(&spec.name);
                }
                _ => return Err(SupervisorError::AlreadyExists(spec.name.clone())),
            }
        }

        let name = spec.name.clone();
        let instances = spec.instances.max(1);
        let max_memory = spec.max_memory_restart_mb;

        let entry = Arc::new(Entry {
            spec,
            status: parking_lot::Mutex::new(ProcessStatus::Launching),
            instances: parking_lot::Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        for index in 0..instances {
            if let Err(e) = self.inner.spawn_instance(&entry, index) {
                // Unwind anything already spawned
                self.inner.stop_entry(&entry).await;
                return Err(e);
            }
        }

        entry.set_status(ProcessStatus::Online);
        self.inner.entries.insert(name.clone(), entry.clone());

        if let Some(limit) = max_memory {
            self.inner.start_memory_watchdog(entry.clone(), limit);
        }
        self.inner.start_periodic_restart(entry.clone());

        self.inner.emit(SupervisorEvent::Lifecycle {
            name: name.clone(),
            event: LifecycleEvent::Start,
        });
        info!("Started {} ({} instances)", name, instances);

        Ok(self.inner.snapshot(&entry))
    }

    async fn stop(&self, name: &str) -> SupervisorResult<()> {
        let _guard = self.inner.op_lock.lock().await;
        let entry = self
            .inner
            .entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        self.inner.stop_entry(&entry).await;
        info!("Stopped {}", name);
        Ok(())
    }

    async fn delete(&self, name: &str) -> SupervisorResult<()> {
        let _guard = self.inner.op_lock.lock().await;
        let Some((_, entry)) = self.inner.entries.remove(name) else {
            return Err(SupervisorError::NotFound(name.to_string()));
        };

        if entry.status() != ProcessStatus::Stopped {
            self.inner.stop_entry(&entry).await;
        }
        info!("Deleted {}", name);
        Ok(())
    }

    async fn list(&self) -> SupervisorResult<Vec<ProcessSnapshot>> {
        Ok(self
            .inner
            .entries
            .iter()
            .map(|e| self.inner.snapshot(e.value()))
            .collect())
    }

    async fn describe(&self, name: &str) -> SupervisorResult<Option<ProcessSnapshot>> {
        Ok(self
            .inner
            .entries
            .get(name)
            .map(|e| self.inner.snapshot(e.value())))
    }

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }
}
