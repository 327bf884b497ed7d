//! Action and metric registries shared between the host and the agent
//!
//! Both registries are explicit objects with their own lock. The host
//! registers into them at startup; the dispatcher and the status sampler
//! read from them through an `Arc`.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type ActionCallback = Arc<dyn Fn() -> String + Send + Sync>;

/// Remotely triggerable zero-argument operation
#[derive(Clone)]
pub struct Action {
    pub name: String,
    pub callback: Option<ActionCallback>,
}

impl Action {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Some(Arc::new(callback)),
        }
    }

    /// Action that is announced but does nothing when triggered
    pub fn noop(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callback: None,
        }
    }

    /// Run the callback; an absent callback yields no result
    pub fn invoke(&self) -> Option<String> {
        self.callback.as_ref().map(|callback| callback())
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action, replacing any previous one with the same name
    pub fn register(&self, action: Action) {
        self.actions.write().insert(action.name.clone(), action);
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.register(Action::new(name, callback));
    }

    pub fn register_noop(&self, name: impl Into<String>) {
        self.register(Action::noop(name));
    }

    pub fn lookup(&self, name: &str) -> Option<Action> {
        self.actions.read().get(name).cloned()
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }
}

/// Named numeric value updated by the host at arbitrary times
#[derive(Debug)]
pub struct Metric {
    name: String,
    unit: String,
    bits: AtomicU64,
}

impl Metric {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, delta: f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    pub fn inc(&self) {
        self.add(1.0);
    }

    pub fn sample(&self) -> MetricSample {
        MetricSample {
            value: self.get(),
            unit: self.unit.clone(),
        }
    }
}

/// Point-in-time value of a metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Default)]
pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, Arc<Metric>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a metric, returning the host's handle to it
    pub fn create(&self, name: impl Into<String>, unit: impl Into<String>) -> Arc<Metric> {
        let metric = Arc::new(Metric::new(name, unit));
        self.add(metric.clone());
        metric
    }

    pub fn add(&self, metric: Arc<Metric>) {
        self.metrics.write().insert(metric.name.clone(), metric);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
        self.metrics.read().get(name).cloned()
    }

    /// Sample every metric, keyed by name
    pub fn list(&self) -> BTreeMap<String, MetricSample> {
        self.metrics
            .read()
            .iter()
            .map(|(name, metric)| (name.clone(), metric.sample()))
            .collect()
    }
}
