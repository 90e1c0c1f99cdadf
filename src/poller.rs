use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PollerConfig, Privilege};
use crate::error::SourceError;
use crate::parse::{parse_arp_table, parse_neigh_output};
use crate::source::{probe_privilege, run_privileged, SourceReader};
use crate::types::{DeviceSet, DeviceSetBuilder, ErrorKind, PollerState, SourceKind};

/// Callback receiving each published snapshot. Runs on the poller's task.
///
/// A panicking subscriber ends the task and leaves the poller stopped.
pub type Subscriber = Arc<dyn Fn(Arc<DeviceSet>) + Send + Sync>;

/// Periodically reads the neighbor table and publishes the attached devices.
///
/// Cloning yields another handle to the same poller.
#[derive(Clone)]
pub struct NeighborPoller {
    inner: Arc<Inner>,
}

struct Task {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: PollerConfig,
    privileged: bool,
    reader: Arc<dyn SourceReader>,
    running: AtomicBool,
    interval_ms: AtomicU64,
    last_error: Mutex<Option<ErrorKind>>,
    subscribers: Mutex<Vec<Subscriber>>,
    // Held while checking `running` and invoking subscribers; `stop()` takes it too, so
    // once `stop()` returns no publish can be in progress. Reentrant so a subscriber may
    // call `stop()` itself.
    publish_gate: ReentrantMutex<()>,
    task: Mutex<Option<Task>>,
}

impl NeighborPoller {
    /// Create a stopped poller. `privileged` is the already-resolved capability flag.
    pub fn new(config: PollerConfig, reader: Arc<dyn SourceReader>, privileged: bool) -> Self {
        let interval_ms = config.interval_ms;
        Self {
            inner: Arc::new(Inner {
                config,
                privileged,
                reader,
                running: AtomicBool::new(false),
                interval_ms: AtomicU64::new(interval_ms),
                last_error: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                publish_gate: ReentrantMutex::new(()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Create a stopped poller, resolving the privilege capability once from `config.privilege`.
    pub async fn build(config: PollerConfig, reader: Arc<dyn SourceReader>) -> Self {
        let privileged = match config.privilege {
            Privilege::Never => false,
            Privilege::Always => true,
            Privilege::Auto => {
                probe_privilege(reader.as_ref(), &config.escalate_command, config.source_timeout()).await
            }
        };
        Self::new(config, reader, privileged)
    }

    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    pub fn privileged(&self) -> bool {
        self.inner.privileged
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Arc<DeviceSet>) + Send + Sync + 'static,
    {
        self.inner.subscribers.lock().push(Arc::new(callback));
    }

    /// Start polling every `interval`, first cycle immediately. No-op if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, interval: Duration) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("start() ignored: poller already running");
            return;
        }
        let interval = interval.max(Duration::from_millis(1));
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.inner.interval_ms.store(interval_ms, Ordering::SeqCst);

        // Hold the slot across spawn so a concurrent stop() always finds this task's token.
        let mut slot = self.inner.task.lock();
        // A task from before the last stop() may still be finishing a cycle; the new task
        // waits for it so only one cycle is ever in flight.
        let previous = slot.take().map(|old| {
            old.cancel.cancel();
            old.handle
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.inner.clone(), cancel.clone(), interval, previous));
        *slot = Some(Task { cancel, handle });
        info!(interval_ms, privileged = self.inner.privileged, "poller started");
    }

    /// Stop polling. A cycle already in flight finishes its reads but publishes nothing.
    pub fn stop(&self) {
        let _gate = self.inner.publish_gate.lock();
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.task.lock().as_ref() {
            task.cancel.cancel();
        }
        info!("poller stopped");
    }

    /// Stop and wait for the background task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PollerState {
        PollerState {
            running: self.is_running(),
            interval_ms: self.inner.interval_ms.load(Ordering::SeqCst),
            last_error: *self.inner.last_error.lock(),
        }
    }

    /// Run one cycle without publishing. Updates `last_error`.
    pub async fn poll_once(&self) -> DeviceSet {
        let (set, err) = self.inner.acquire().await;
        *self.inner.last_error.lock() = err.as_ref().map(SourceError::kind);
        set
    }
}

/// Clears `running` if the loop unwinds without having been stopped (a panicking subscriber).
struct ExitGuard<'a> {
    inner: &'a Inner,
    cancel: &'a CancellationToken,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.inner.running.store(false, Ordering::SeqCst);
            warn!("poller task exited unexpectedly, marking stopped");
        }
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    interval: Duration,
    previous: Option<JoinHandle<()>>,
) {
    let _guard = ExitGuard {
        inner: &inner,
        cancel: &cancel,
    };
    if let Some(previous) = previous {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = previous => {}
        }
    }

    let mut failures: u32 = 0;
    loop {
        let (set, err) = inner.acquire().await;
        let kind = err.as_ref().map(SourceError::kind);
        match &err {
            Some(e) => warn!(error = %e, "all neighbor sources failed"),
            None => debug!(devices = set.len(), source = %set.source(), "cycle complete"),
        }

        if !inner.publish(&cancel, set, kind) {
            debug!("poller stopped mid-cycle, discarding result");
            break;
        }

        failures = if kind.is_some() { failures.saturating_add(1) } else { 0 };
        let delay = inner.config.backoff.next_delay(interval, failures);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(delay) => {}
        }
    }
}

impl Inner {
    /// Returns false if the poller was stopped; nothing is published in that case.
    fn publish(&self, cancel: &CancellationToken, set: DeviceSet, kind: Option<ErrorKind>) -> bool {
        let _gate = self.publish_gate.lock();
        if cancel.is_cancelled() || !self.running.load(Ordering::SeqCst) {
            return false;
        }
        *self.last_error.lock() = kind;
        let subscribers = self.subscribers.lock().clone();
        let set = Arc::new(set);
        for s in &subscribers {
            s(set.clone());
        }
        true
    }

    /// Walk the source chain once.
    ///
    /// Returns the error of the last failed source only when no source succeeded; sources
    /// that answer with zero matching rows yield an empty set and no error.
    async fn acquire(&self) -> (DeviceSet, Option<SourceError>) {
        let cfg = &self.config;
        let timeout = cfg.source_timeout();
        let reader = self.reader.as_ref();

        let mut builder = DeviceSetBuilder::new();
        let mut last_err: Option<SourceError> = None;
        let mut any_ok = false;
        let mut elevated_failed = false;

        let neigh = if self.privileged {
            run_privileged(reader, &cfg.escalate_command, &cfg.neigh_command, timeout).await
        } else {
            reader.run_command(&cfg.neigh_command, timeout).await
        };
        match neigh {
            Ok(out) => {
                any_ok = true;
                builder.extend_from(
                    SourceKind::NeighCommand,
                    parse_neigh_output(&out, &cfg.subnets, &cfg.state_filter),
                );
            }
            Err(e) => {
                debug!(error = %e, "neighbor command failed");
                elevated_failed |= self.privileged;
                last_err = Some(e);
            }
        }
        if !builder.is_empty() {
            return (builder.build(), None);
        }

        let arp = if self.privileged {
            let cat = vec!["cat".to_string(), cfg.arp_path.display().to_string()];
            run_privileged(reader, &cfg.escalate_command, &cat, timeout).await
        } else {
            reader.read_file(&cfg.arp_path, timeout).await
        };
        match arp {
            Ok(out) => {
                any_ok = true;
                builder.extend_from(SourceKind::ArpCache, parse_arp_table(&out, &cfg.subnets));
            }
            Err(e) => {
                debug!(error = %e, "neighbor cache read failed");
                elevated_failed |= self.privileged;
                last_err = Some(e);
            }
        }
        if !builder.is_empty() {
            return (builder.build(), None);
        }

        if elevated_failed {
            match reader.run_command(&cfg.neigh_command, timeout).await {
                Ok(out) => {
                    any_ok = true;
                    builder.extend_from(
                        SourceKind::UnprivilegedNeighCommand,
                        parse_neigh_output(&out, &cfg.subnets, &cfg.state_filter),
                    );
                }
                Err(e) => {
                    debug!(error = %e, "unprivileged neighbor command failed");
                    last_err = Some(e);
                }
            }
        }

        let err = if any_ok { None } else { last_err };
        (builder.build(), err)
    }
}
