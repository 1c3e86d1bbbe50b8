//! Registry of readers attached to fragment logs.
//!
//! The registry is an ordinary owned value: the process creates one and
//! hands clones to whatever attaches readers. Each attachment yields a
//! [`ViewerGuard`]; dropping the guard removes the entry, so a reader torn
//! down by its caller never lingers in the map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::scheduler::job::LogAddress;

/// One attached reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerInfo {
    pub viewer_id: Uuid,
    pub attached_at: DateTime<Utc>,
}

type ViewerMap = HashMap<LogAddress, HashMap<Uuid, ViewerInfo>>;

#[derive(Debug, Clone, Default)]
pub struct ViewerRegistry {
    inner: Arc<Mutex<ViewerMap>>,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a reader on `address` until the returned guard is dropped.
    pub fn register(&self, address: &LogAddress) -> ViewerGuard {
        let info = ViewerInfo {
            viewer_id: Uuid::new_v4(),
            attached_at: Utc::now(),
        };
        let viewer_id = info.viewer_id;

        let total = self.with_map(|map| {
            map.entry(address.clone())
                .or_default()
                .insert(viewer_id, info);
            total_of(map)
        });
        MetricsCollector::new().update_viewers(total);

        ViewerGuard {
            registry: self.clone(),
            address: address.clone(),
            viewer_id,
        }
    }

    /// Readers currently attached to `address`.
    pub fn viewers_of(&self, address: &LogAddress) -> Vec<ViewerInfo> {
        self.with_map(|map| {
            map.get(address)
                .map(|viewers| viewers.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn count(&self, address: &LogAddress) -> usize {
        self.with_map(|map| map.get(address).map_or(0, HashMap::len))
    }

    /// Readers attached across all logs.
    pub fn total(&self) -> usize {
        self.with_map(|map| total_of(map))
    }

    fn remove(&self, address: &LogAddress, viewer_id: Uuid) {
        let total = self.with_map(|map| {
            if let Some(viewers) = map.get_mut(address) {
                viewers.remove(&viewer_id);
                if viewers.is_empty() {
                    map.remove(address);
                }
            }
            total_of(map)
        });
        MetricsCollector::new().update_viewers(total);
    }

    fn with_map<T>(&self, f: impl FnOnce(&mut ViewerMap) -> T) -> T {
        // A poisoned lock only means another thread panicked mid-update;
        // the map itself is still usable.
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

fn total_of(map: &ViewerMap) -> usize {
    map.values().map(HashMap::len).sum()
}

/// Keeps a reader registered; removes it on drop.
#[derive(Debug)]
pub struct ViewerGuard {
    registry: ViewerRegistry,
    address: LogAddress,
    viewer_id: Uuid,
}

impl ViewerGuard {
    pub fn viewer_id(&self) -> Uuid {
        self.viewer_id
    }

    pub fn address(&self) -> &LogAddress {
        &self.address
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.address, self.viewer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let registry = ViewerRegistry::new();
        let a = LogAddress::from("log:a");
        let b = LogAddress::from("log:b");

        let g1 = registry.register(&a);
        let g2 = registry.register(&a);
        let g3 = registry.register(&b);
        assert_eq!(registry.count(&a), 2);
        assert_eq!(registry.total(), 3);
        assert_ne!(g1.viewer_id(), g2.viewer_id());

        drop(g1);
        assert_eq!(registry.count(&a), 1);

        drop(g2);
        drop(g3);
        assert_eq!(registry.count(&a), 0);
        assert_eq!(registry.total(), 0);
        assert!(registry.viewers_of(&a).is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ViewerRegistry::new();
        let other = registry.clone();
        let addr = LogAddress::from("log:shared");

        let guard = other.register(&addr);
        assert_eq!(registry.count(&addr), 1);
        assert_eq!(guard.address(), &addr);
        assert_eq!(registry.viewers_of(&addr)[0].viewer_id, guard.viewer_id());
    }
}
