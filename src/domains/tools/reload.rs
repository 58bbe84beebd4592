//! Hot-Reload Manager.
//!
//! Every tick re-scans the descriptor store, fingerprints each descriptor
//! together with the plugin code it points at, and walks each source
//! through `Unchanged -> ChangeDetected -> Validating -> Applied | Rejected`.
//! Validation builds the new instance off to the side; only a successful
//! build reaches the registry, as a single atomic swap. Sources are
//! independent: one failing tool never holds back another.
//!
//! The loop wakes on a fixed interval and, when enabled, early on
//! filesystem events from `notify`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::capability::SharedTool;
use super::descriptor::{DescriptorStore, ToolDescriptor};
use super::error::LoadError;
use super::loader::ToolLoader;
use super::registry::{RegistryEntry, ToolRegistry};

const EVENT_CAPACITY: usize = 256;
const DRAIN_POLL: Duration = Duration::from_millis(10);
/// Editors write files in bursts; wait this long after a filesystem event.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A change applied to the registry.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadEvent {
    pub tool_name: String,
    pub change_kind: ChangeKind,
    /// Generation now live, absent for removals.
    pub generation: Option<u64>,
    pub detected_at: DateTime<Utc>,
}

/// Where a watched source is in its reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPhase {
    Unchanged,
    ChangeDetected,
    Validating,
    Applied,
    Rejected,
}

/// Last known state of one descriptor file.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub path: PathBuf,
    /// Tool name this source currently has live in the registry.
    pub tool: Option<String>,
    pub phase: ReloadPhase,
    pub fingerprint: String,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A source that failed validation this tick.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub path: PathBuf,
    pub error: String,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub rejected: Vec<Rejection>,
    pub unchanged: usize,
}

impl TickReport {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }
}

/// Reload loop tuning.
#[derive(Debug, Clone)]
pub struct ReloadSettings {
    pub interval: Duration,
    pub watch: bool,
    pub drain_timeout: Duration,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            watch: true,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Result of reading and fingerprinting one descriptor file.
struct Probe {
    path: PathBuf,
    fingerprint: String,
    descriptor: Result<ToolDescriptor, LoadError>,
}

/// A changed source on its way to Applied or Rejected.
struct Candidate {
    path: PathBuf,
    fingerprint: String,
}

/// Drives registry updates from the descriptor store.
pub struct HotReloadManager {
    registry: Arc<ToolRegistry>,
    loader: ToolLoader,
    store: DescriptorStore,
    settings: ReloadSettings,
    sources: DashMap<PathBuf, SourceStatus>,
    events: broadcast::Sender<ReloadEvent>,
    draining: Arc<AtomicUsize>,
    watching: AtomicBool,
    tick_lock: Mutex<()>,
}

impl HotReloadManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        loader: ToolLoader,
        store: DescriptorStore,
        settings: ReloadSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            loader,
            store,
            settings,
            sources: DashMap::new(),
            events,
            draining: Arc::new(AtomicUsize::new(0)),
            watching: AtomicBool::new(false),
            tick_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &DescriptorStore {
        &self.store
    }

    pub fn settings(&self) -> &ReloadSettings {
        &self.settings
    }

    /// Receive every applied change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.events.subscribe()
    }

    /// Status of every tracked source, sorted by path.
    pub fn sources(&self) -> Vec<SourceStatus> {
        let mut sources: Vec<_> = self.sources.iter().map(|s| s.value().clone()).collect();
        sources.sort_by(|a, b| a.path.cmp(&b.path));
        sources
    }

    pub fn source(&self, path: &Path) -> Option<SourceStatus> {
        self.sources.get(path).map(|s| s.value().clone())
    }

    /// Detached instances still waiting for in-flight calls to finish.
    pub fn draining(&self) -> usize {
        self.draining.load(Ordering::Acquire)
    }

    /// Whether a filesystem watch is currently attached to the store root.
    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    /// Run one reload pass.
    ///
    /// Only a failure to scan the store itself is returned as an error; in
    /// that case the registry is left exactly as it was.
    #[instrument(skip(self), fields(root = %self.store.root().display()))]
    pub async fn tick(&self) -> Result<TickReport, LoadError> {
        let _guard = self.tick_lock.lock().await;

        let store = self.store.clone();
        let paths = tokio::task::spawn_blocking(move || store.scan())
            .await
            .map_err(|e| LoadError::io(self.store.root(), std::io::Error::other(e.to_string())))??;

        let mut report = TickReport::default();

        let probes = join_all(paths.iter().map(|path| self.probe(path))).await;

        // Sources whose file disappeared give up their names first, so a
        // descriptor moved to a new file can claim its name this tick.
        let present: HashSet<&PathBuf> = paths.iter().collect();
        let vanished: Vec<(PathBuf, Option<String>)> = self
            .sources
            .iter()
            .filter(|s| !present.contains(s.key()))
            .map(|s| (s.key().clone(), s.tool.clone()))
            .collect();
        for (path, _) in &vanished {
            self.sources.remove(path);
        }

        let mut candidates = Vec::new();
        for probe in probes {
            if self.needs_validation(&probe) {
                debug!(path = %probe.path.display(), "Change detected");
                self.set_phase(&probe.path, &probe.fingerprint, ReloadPhase::ChangeDetected);
                candidates.push(probe);
            } else {
                self.set_phase(&probe.path, &probe.fingerprint, ReloadPhase::Unchanged);
                report.unchanged += 1;
            }
        }

        let validated = join_all(candidates.into_iter().map(|probe| self.validate(probe))).await;

        let mut claimed: HashSet<String> = HashSet::new();
        for (candidate, result) in validated {
            match result.and_then(|instance| self.apply(&candidate, instance)) {
                Ok((name, kind, displaced)) => {
                    claimed.insert(name.clone());
                    match kind {
                        ChangeKind::Added => report.added.push(name),
                        _ => report.modified.push(name),
                    }
                    if let Some(old) = displaced {
                        if !claimed.contains(&old) && self.release(&old) {
                            report.removed.push(old);
                        }
                    }
                }
                Err(error) => report.rejected.push(self.reject(&candidate, error)),
            }
        }

        for (path, tool) in vanished {
            debug!(path = %path.display(), "Descriptor removed");
            if let Some(name) = tool {
                if !claimed.contains(&name) && self.release(&name) {
                    report.removed.push(name);
                }
            }
        }

        if report.has_changes() || !report.rejected.is_empty() {
            info!(
                added = report.added.len(),
                modified = report.modified.len(),
                removed = report.removed.len(),
                rejected = report.rejected.len(),
                "Reload tick applied"
            );
        }
        Ok(report)
    }

    /// Run ticks until `cancel` fires.
    ///
    /// The filesystem watch is retried after every tick until it attaches,
    /// so a store root created after startup still gets event-driven reloads.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let wake = Arc::new(Notify::new());
        let mut watcher: Option<RecommendedWatcher> = None;
        let mut watch_warned = false;

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Hot reload running every {:?} on {}",
            self.settings.interval,
            self.store.root().display()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = wake.notified() => {
                    tokio::time::sleep(WATCH_DEBOUNCE).await;
                }
            }
            if let Err(e) = self.tick().await {
                warn!("Reload tick skipped: {}", e);
            }

            if self.settings.watch && watcher.is_none() {
                match self.watch(wake.clone()) {
                    Ok(attached) => {
                        info!("Watching {} for changes", self.store.root().display());
                        watcher = Some(attached);
                        self.watching.store(true, Ordering::Release);
                    }
                    Err(e) if !watch_warned => {
                        warn!("Filesystem watch unavailable, polling until it attaches: {}", e);
                        watch_warned = true;
                    }
                    Err(e) => debug!("Watch still unavailable: {}", e),
                }
            }
        }
        self.watching.store(false, Ordering::Release);
        info!("Hot reload stopped");
    }

    /// Spawn [`run`](Self::run) as a background task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    fn watch(&self, wake: Arc<Notify>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if !event.kind.is_access() => wake.notify_one(),
                Ok(_) => {}
                Err(e) => debug!("Watch error: {}", e),
            }
        })?;
        watcher.watch(self.store.root(), RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    // ------------------------------------------------------------------------
    // Tick stages
    // ------------------------------------------------------------------------

    /// Read a descriptor and fingerprint it with its plugin sources.
    async fn probe(&self, path: &Path) -> Probe {
        let bytes = match self.store.read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Probe {
                    path: path.to_path_buf(),
                    fingerprint: String::new(),
                    descriptor: Err(e),
                };
            }
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(&bytes);
        let descriptor = self.store.parse(path, &bytes).await;
        if let Ok(descriptor) = &descriptor {
            for source in self.loader.source_paths(descriptor) {
                hasher.update(source.as_os_str().as_encoded_bytes());
                match tokio::fs::read(&source).await {
                    Ok(code) => hasher.update(&code),
                    Err(_) => hasher.update(b"\0missing"),
                };
            }
        }

        Probe {
            path: path.to_path_buf(),
            fingerprint: hasher.finalize().to_hex().to_string(),
            descriptor,
        }
    }

    fn needs_validation(&self, probe: &Probe) -> bool {
        match self.sources.get(&probe.path) {
            None => true,
            Some(status) => {
                status.fingerprint != probe.fingerprint || status.phase == ReloadPhase::Rejected
            }
        }
    }

    /// Build the new instance without touching the registry.
    async fn validate(&self, probe: Probe) -> (Candidate, Result<SharedTool, LoadError>) {
        let Probe {
            path,
            fingerprint,
            descriptor,
        } = probe;
        let candidate = Candidate { path, fingerprint };
        let descriptor = match descriptor {
            Ok(descriptor) => descriptor,
            Err(e) => return (candidate, Err(e)),
        };
        self.set_phase(&candidate.path, &candidate.fingerprint, ReloadPhase::Validating);

        let name = descriptor.name.clone();
        let loader = self.loader.clone();
        let result = tokio::task::spawn_blocking(move || loader.instantiate(descriptor))
            .await
            .unwrap_or_else(|e| Err(LoadError::instantiate(name, format!("loader task failed: {}", e))));
        (candidate, result)
    }

    /// Publish a validated instance. Returns its name, the change kind and
    /// the name this source previously owned if it differs.
    fn apply(
        &self,
        candidate: &Candidate,
        instance: SharedTool,
    ) -> Result<(String, ChangeKind, Option<String>), LoadError> {
        let descriptor = instance.describe();
        let name = descriptor.name.clone();

        if let Some(owner) = self.owner_of(&name) {
            if owner != candidate.path {
                return Err(LoadError::NameConflict { name, owner });
            }
        }

        let kind = if self.registry.get_any(&name).is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };

        let registration = self.registry.register(descriptor, instance)?;
        if let Some(previous) = registration.previous {
            self.drain(previous);
        }

        let displaced = self.sources.get(&candidate.path).and_then(|s| s.tool.clone());
        self.sources.insert(
            candidate.path.clone(),
            SourceStatus {
                path: candidate.path.clone(),
                tool: Some(name.clone()),
                phase: ReloadPhase::Applied,
                fingerprint: candidate.fingerprint.clone(),
                last_error: None,
                updated_at: Utc::now(),
            },
        );

        info!(
            tool = %name,
            generation = registration.generation,
            change = ?kind,
            "Applied {}",
            candidate.path.display()
        );
        self.emit(&name, kind, Some(registration.generation));
        Ok((name.clone(), kind, displaced.filter(|old| *old != name)))
    }

    fn reject(&self, candidate: &Candidate, error: LoadError) -> Rejection {
        let message = error.to_string();
        let mut status = self
            .sources
            .entry(candidate.path.clone())
            .or_insert_with(|| SourceStatus {
                path: candidate.path.clone(),
                tool: None,
                phase: ReloadPhase::Rejected,
                fingerprint: candidate.fingerprint.clone(),
                last_error: None,
                updated_at: Utc::now(),
            });
        if status.last_error.as_deref() != Some(message.as_str()) {
            warn!(path = %candidate.path.display(), "Rejected: {}", message);
        } else {
            debug!(path = %candidate.path.display(), "Still rejected: {}", message);
        }
        status.phase = ReloadPhase::Rejected;
        status.fingerprint = candidate.fingerprint.clone();
        status.last_error = Some(message.clone());
        status.updated_at = Utc::now();

        Rejection {
            path: candidate.path.clone(),
            error: message,
        }
    }

    /// Unregister `name`, draining the detached entry.
    fn release(&self, name: &str) -> bool {
        match self.registry.remove(name) {
            Some(entry) => {
                self.drain(entry);
                self.emit(name, ChangeKind::Removed, None);
                true
            }
            None => false,
        }
    }

    fn owner_of(&self, name: &str) -> Option<PathBuf> {
        self.sources
            .iter()
            .find(|s| s.tool.as_deref() == Some(name))
            .map(|s| s.key().clone())
    }

    fn set_phase(&self, path: &Path, fingerprint: &str, phase: ReloadPhase) {
        let mut status = self
            .sources
            .entry(path.to_path_buf())
            .or_insert_with(|| SourceStatus {
                path: path.to_path_buf(),
                tool: None,
                phase,
                fingerprint: fingerprint.to_string(),
                last_error: None,
                updated_at: Utc::now(),
            });
        // Keep the old fingerprint until the change is applied or rejected.
        if phase == ReloadPhase::Unchanged {
            status.fingerprint = fingerprint.to_string();
        }
        status.phase = phase;
        status.updated_at = Utc::now();
    }

    fn emit(&self, name: &str, change_kind: ChangeKind, generation: Option<u64>) {
        // No subscribers is fine.
        let _ = self.events.send(ReloadEvent {
            tool_name: name.to_string(),
            change_kind,
            generation,
            detected_at: Utc::now(),
        });
    }

    /// Let a detached entry finish its in-flight calls, bounded by the drain timeout.
    fn drain(&self, entry: Arc<RegistryEntry>) {
        if entry.in_flight() == 0 {
            debug!(tool = entry.name(), generation = entry.generation(), "Discarded idle instance");
            return;
        }

        let timeout = self.settings.drain_timeout;
        let draining = self.draining.clone();
        draining.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let deadline = Instant::now() + timeout;
            while entry.in_flight() > 0 && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL).await;
            }
            let remaining = entry.in_flight();
            if remaining > 0 {
                warn!(
                    tool = entry.name(),
                    generation = entry.generation(),
                    "Drain timed out with {} calls in flight; discarding",
                    remaining
                );
            } else {
                debug!(tool = entry.name(), generation = entry.generation(), "Drained");
            }
            draining.fetch_sub(1, Ordering::AcqRel);
        });
    }
}
