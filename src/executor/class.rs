use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Executor class used when the configuration does not name one.
pub const DEFAULT_EXECUTOR_CLASS: &str = "spin_up-4min.gpu-24gb";

/// A named resource tier (CPU-only, a GPU tier, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorClass(String);

impl ExecutorClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutorClass {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTOR_CLASS)
    }
}

impl std::fmt::Display for ExecutorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutorClass {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Snapshot of capacity per executor class.
///
/// Backends report the capacity they can promise; the supervisor reports the
/// same map net of its active handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(BTreeMap<ExecutorClass, u32>);

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class: impl Into<ExecutorClass>, count: u32) -> Self {
        self.0.insert(class.into(), count);
        self
    }

    pub fn get(&self, class: &ExecutorClass) -> Option<u32> {
        self.0.get(class).copied()
    }

    /// Capacity for `class`, zero for classes the manifest does not mention.
    pub fn count(&self, class: &ExecutorClass) -> u32 {
        self.get(class).unwrap_or(0)
    }

    pub fn contains(&self, class: &ExecutorClass) -> bool {
        self.0.contains_key(class)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExecutorClass, u32)> {
        self.0.iter().map(|(class, count)| (class, *count))
    }

    pub fn total(&self) -> u64 {
        self.0.values().map(|&c| u64::from(c)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Same classes, every count zeroed. Reported when a backend cannot be
    /// reached so the node under-promises instead of over-promising.
    pub fn zeroed(&self) -> Self {
        Self(self.0.keys().map(|class| (class.clone(), 0)).collect())
    }

    /// Subtract active handles per class. Counts clamp at zero and never
    /// exceed the original value.
    pub fn net_of(&self, active: &BTreeMap<ExecutorClass, u32>) -> Self {
        Self(
            self.0
                .iter()
                .map(|(class, &declared)| {
                    let used = active.get(class).copied().unwrap_or(0);
                    (class.clone(), declared.saturating_sub(used))
                })
                .collect(),
        )
    }
}

impl FromIterator<(ExecutorClass, u32)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (ExecutorClass, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<ExecutorClass, u32>> for Manifest {
    fn from(map: BTreeMap<ExecutorClass, u32>) -> Self {
        Self(map)
    }
}
