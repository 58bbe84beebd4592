//! Tools Registry - the authoritative map from tool name to live instance.
//!
//! Each name owns a slot holding the current entry (if any), the last
//! generation handed out, and the metrics shared by every generation of
//! that name. Entries are immutable and published as a whole `Arc`, so a
//! reader always sees a descriptor together with the instance built from
//! it. Writers hold a shard lock only for the pointer swap.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use super::capability::{SharedTool, ToolKind};
use super::descriptor::ToolDescriptor;
use super::error::LoadError;
use super::loader::ToolLoader;

// ============================================================================
// Metrics
// ============================================================================

/// Lock-free per-tool execution counters.
#[derive(Debug, Default)]
pub struct ToolMetrics {
    execution_count: AtomicU64,
    error_count: AtomicU64,
    total_latency_us: AtomicU64,
    /// Unix millis of the last execution; 0 means never.
    last_executed_at: AtomicI64,
}

/// Point-in-time copy of [`ToolMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub execution_count: u64,
    pub error_count: u64,
    pub total_latency_ms: f64,
    pub average_latency_ms: f64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl ToolMetrics {
    pub fn record(&self, duration: Duration, succeeded: bool) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        if !succeeded {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.last_executed_at
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.execution_count.fetch_add(1, Ordering::Release);
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let execution_count = self.execution_count();
        let total_latency_ms = self.total_latency_us.load(Ordering::Relaxed) as f64 / 1000.0;
        let average_latency_ms = if execution_count == 0 {
            0.0
        } else {
            total_latency_ms / execution_count as f64
        };
        let last = self.last_executed_at.load(Ordering::Relaxed);
        MetricsSnapshot {
            execution_count,
            error_count: self.error_count(),
            total_latency_ms,
            average_latency_ms,
            last_executed_at: (last > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last))
                .flatten(),
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One published (descriptor, instance) pair.
pub struct RegistryEntry {
    descriptor: Arc<ToolDescriptor>,
    instance: SharedTool,
    generation: u64,
    metrics: Arc<ToolMetrics>,
    in_flight: Arc<AtomicUsize>,
}

impl RegistryEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<ToolDescriptor> {
        &self.descriptor
    }

    pub fn instance(&self) -> &SharedTool {
        &self.instance
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> ToolKind {
        self.instance.kind()
    }

    pub fn metrics(&self) -> &ToolMetrics {
        &self.metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.descriptor.enabled
    }

    /// Calls currently executing against this generation's instance.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Mark a call as started; it ends when the guard drops.
    pub fn begin_call(&self) -> CallGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        CallGuard {
            in_flight: self.in_flight.clone(),
        }
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version)
            .field("kind", &self.instance.kind())
            .field("generation", &self.generation)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Keeps an entry's in-flight count raised while a call runs.
#[derive(Debug)]
pub struct CallGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of a successful [`ToolRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    pub generation: u64,
    /// The entry that was replaced, now detached and draining.
    pub previous: Option<Arc<RegistryEntry>>,
}

/// Selection criteria for [`ToolRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub include_disabled: bool,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub kind: Option<ToolKind>,
}

impl ListFilter {
    pub fn matches(&self, entry: &RegistryEntry) -> bool {
        let metadata = &entry.descriptor.metadata;
        (self.include_disabled || entry.is_enabled())
            && self
                .category
                .as_ref()
                .is_none_or(|c| metadata.category.as_ref() == Some(c))
            && self.tag.as_ref().is_none_or(|t| metadata.tags.contains(t))
            && self.kind.is_none_or(|k| entry.kind() == k)
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Slot {
    entry: Option<Arc<RegistryEntry>>,
    /// Last generation handed out for this name. Survives unregister.
    generation: u64,
    metrics: Arc<ToolMetrics>,
}

/// Thread-safe registry of live tools.
///
/// Constructed once at startup and shared by reference; tests build as
/// many isolated registries as they like.
#[derive(Default)]
pub struct ToolRegistry {
    slots: DashMap<String, Slot>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `instance` under `descriptor.name`, replacing any current entry.
    pub fn register(
        &self,
        descriptor: Arc<ToolDescriptor>,
        instance: SharedTool,
    ) -> Result<Registration, LoadError> {
        let bound = instance.describe();
        if bound.name != descriptor.name {
            return Err(LoadError::invalid(format!(
                "instance is bound to '{}' but was registered as '{}'",
                bound.name, descriptor.name
            )));
        }

        let mut slot = self.slots.entry(descriptor.name.clone()).or_default();
        slot.generation += 1;
        let generation = slot.generation;
        let entry = Arc::new(RegistryEntry {
            descriptor,
            instance,
            generation,
            metrics: slot.metrics.clone(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        });
        let previous = slot.entry.replace(entry);
        drop(slot);

        debug!(generation, replaced = previous.is_some(), "Registered tool");
        Ok(Registration {
            generation,
            previous,
        })
    }

    /// Build an instance off to the side, then publish it.
    ///
    /// On failure the current entry for the name is left untouched.
    pub fn load_and_register(
        &self,
        loader: &ToolLoader,
        descriptor: ToolDescriptor,
    ) -> Result<Registration, LoadError> {
        let instance = loader.instantiate(descriptor)?;
        self.register(instance.describe(), instance)
    }

    /// Current entry, if present and enabled.
    pub fn get(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.get_any(name).filter(|entry| entry.is_enabled())
    }

    /// Current entry, enabled or not.
    pub fn get_any(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        self.slots.get(name).and_then(|slot| slot.entry.clone())
    }

    /// Snapshot of matching entries, sorted by name.
    pub fn list(&self, filter: &ListFilter) -> Vec<Arc<RegistryEntry>> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| slot.entry.clone())
            .filter(|entry| filter.matches(entry))
            .collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    /// Remove the entry for `name`, returning it for draining.
    ///
    /// The generation counter is kept so a later re-add never regresses;
    /// metrics start over.
    pub fn remove(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        let mut slot = self.slots.get_mut(name)?;
        let removed = slot.entry.take();
        if removed.is_some() {
            slot.metrics = Arc::new(ToolMetrics::default());
            info!(tool = name, "Unregistered tool");
        }
        removed
    }

    /// Remove the entry for `name`. Returns false if there was none.
    pub fn unregister(&self, name: &str) -> bool {
        self.remove(name).is_some()
    }

    /// Record one execution against the current entry of `name`.
    pub fn record_execution(&self, name: &str, duration: Duration, succeeded: bool) -> bool {
        match self.slots.get(name) {
            Some(slot) if slot.entry.is_some() => {
                slot.metrics.record(duration, succeeded);
                true
            }
            _ => false,
        }
    }

    /// Last generation handed out for `name`, even if since unregistered.
    pub fn last_generation(&self, name: &str) -> Option<u64> {
        self.slots.get(name).map(|slot| slot.generation)
    }

    /// Number of registered entries, enabled or not.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .map(|slot| slot.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::tools::definitions::{EchoTool, NativeTool};
    use crate::domains::tools::schema::ToolSchema;
    use serde_json::json;
    use std::thread;

    fn descriptor(name: &str, version: &str) -> Arc<ToolDescriptor> {
        Arc::new(
            serde_json::from_value(json!({
                "name": name,
                "implementation_locator": "native:echo",
                "version": version,
                "metadata": { "category": "util", "tags": ["demo"] }
            }))
            .unwrap(),
        )
    }

    fn instance(descriptor: &Arc<ToolDescriptor>) -> SharedTool {
        let schema = ToolSchema::compile(json!({ "type": "object" }), json!({})).unwrap();
        Arc::new(NativeTool::new(
            descriptor.clone(),
            schema,
            EchoTool::spec().handler,
        ))
    }

    fn register(registry: &ToolRegistry, name: &str, version: &str) -> Registration {
        let d = descriptor(name, version);
        let i = instance(&d);
        registry.register(d, i).unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = ToolRegistry::new();
        let registration = register(&registry, "echo", "1.0.0");
        assert_eq!(registration.generation, 1);
        assert!(registration.previous.is_none());

        let entry = registry.get("echo").unwrap();
        assert_eq!(entry.descriptor().version, "1.0.0");
        assert_eq!(entry.generation(), 1);
        assert_eq!(entry.kind(), ToolKind::Native);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_replace_returns_previous_and_bumps_generation() {
        let registry = ToolRegistry::new();
        register(&registry, "echo", "1.0.0");
        let registration = register(&registry, "echo", "1.1.0");

        assert_eq!(registration.generation, 2);
        assert_eq!(registration.previous.unwrap().descriptor().version, "1.0.0");
        assert_eq!(registry.get("echo").unwrap().descriptor().version, "1.1.0");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_mismatched_instance() {
        let registry = ToolRegistry::new();
        let a = descriptor("a", "1.0.0");
        let b = descriptor("b", "1.0.0");
        let err = registry.register(a, instance(&b)).unwrap_err();
        assert!(matches!(err, LoadError::InvalidDescriptor(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disabled_entry_hidden_from_get() {
        let registry = ToolRegistry::new();
        let mut d = (*descriptor("echo", "1.0.0")).clone();
        d.enabled = false;
        let d = Arc::new(d);
        registry.register(d.clone(), instance(&d)).unwrap();

        assert!(registry.get("echo").is_none());
        assert!(registry.get_any("echo").is_some());
        assert!(registry.list(&ListFilter::default()).is_empty());
        let all = ListFilter {
            include_disabled: true,
            ..Default::default()
        };
        assert_eq!(registry.list(&all).len(), 1);
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let registry = ToolRegistry::new();
        register(&registry, "b_tool", "1.0.0");
        register(&registry, "a_tool", "1.0.0");

        let names: Vec<_> = registry
            .list(&ListFilter::default())
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["a_tool", "b_tool"]);

        let by_tag = ListFilter {
            tag: Some("other".into()),
            ..Default::default()
        };
        assert!(registry.list(&by_tag).is_empty());

        let by_kind = ListFilter {
            kind: Some(ToolKind::Native),
            category: Some("util".into()),
            ..Default::default()
        };
        assert_eq!(registry.list(&by_kind).len(), 2);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ToolRegistry::new();
        register(&registry, "echo", "1.0.0");
        register(&registry, "other", "1.0.0");
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["other".to_string()]);
        assert!(!registry.unregister("never_registered"));
    }

    #[test]
    fn test_generation_survives_unregister() {
        let registry = ToolRegistry::new();
        register(&registry, "echo", "1.0.0");
        register(&registry, "echo", "1.0.1");
        registry.unregister("echo");
        assert_eq!(registry.last_generation("echo"), Some(2));

        let registration = register(&registry, "echo", "2.0.0");
        assert_eq!(registration.generation, 3);
    }

    #[test]
    fn test_metrics_survive_reload_and_reset_on_unregister() {
        let registry = ToolRegistry::new();
        register(&registry, "echo", "1.0.0");
        assert!(registry.record_execution("echo", Duration::from_millis(10), true));
        assert!(registry.record_execution("echo", Duration::from_millis(30), false));

        register(&registry, "echo", "1.1.0");
        let snapshot = registry.get("echo").unwrap().metrics().snapshot();
        assert_eq!(snapshot.execution_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert!((snapshot.average_latency_ms - 20.0).abs() < 0.01);
        assert!(snapshot.last_executed_at.is_some());

        registry.unregister("echo");
        assert!(!registry.record_execution("echo", Duration::from_millis(1), true));
        register(&registry, "echo", "1.2.0");
        assert_eq!(registry.get("echo").unwrap().metrics().execution_count(), 0);
    }

    #[test]
    fn test_call_guard_tracks_in_flight() {
        let registry = ToolRegistry::new();
        register(&registry, "echo", "1.0.0");
        let entry = registry.get("echo").unwrap();

        let first = entry.begin_call();
        let second = entry.begin_call();
        assert_eq!(entry.in_flight(), 2);
        drop(first);
        assert_eq!(entry.in_flight(), 1);
        drop(second);
        assert_eq!(entry.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_swap_is_never_torn() {
        let registry = Arc::new(ToolRegistry::new());
        register(&registry, "echo", "1.0.0");

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        register(&registry, "echo", &format!("{}.{}.0", w + 1, i));
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut last_seen = 0;
                    for _ in 0..2000 {
                        let entry = registry.get("echo").unwrap();
                        assert_eq!(entry.descriptor().version, entry.instance().describe().version);
                        assert!(entry.generation() >= last_seen);
                        last_seen = entry.generation();
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(registry.get("echo").unwrap().generation(), 801);
    }
}
