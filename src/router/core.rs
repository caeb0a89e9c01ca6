//! Route resolver contract and the per-request buffers it fills.
//!
//! # Hot path
//!
//! Resolution runs for every request. The resolver writes into pooled buffers
//! owned by the dispatch call instead of returning fresh collections, so a
//! warmed-up server resolves routes without heap allocation for the common
//! case (at most [`MAX_INLINE_VARS`] path variables).

#![deny(clippy::inefficient_to_string)]
#![deny(clippy::unnecessary_to_owned)]

use crate::filter::Filter;
use crate::handler::{MethodHandlers, TaskHandler, UpgradeHandler};
use crate::pool::Recycle;
use crate::server::Environment;
use smallvec::SmallVec;
use std::sync::Arc;

/// Path variables stored inline before spilling to the heap.
pub const MAX_INLINE_VARS: usize = 4;

/// Per-route filters collected during resolution, outermost first.
pub type FilterSet = Vec<Arc<dyn Filter>>;

/// Path-variable indexer filled by the resolver.
///
/// Names are `Arc<str>` shared with the route tree; values are per-request.
#[derive(Debug, Default, Clone)]
pub struct PathVars {
    vars: SmallVec<[(Arc<str>, String); MAX_INLINE_VARS]>,
}

impl PathVars {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sized for `capacity` variables.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            vars: SmallVec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: Arc<str>, value: impl Into<String>) {
        self.vars.push((name, value.into()));
    }

    /// Value of `name`. When a name repeats at several depths the deepest wins.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k.as_ref() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Value at position `index`, in path order.
    #[must_use]
    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.vars.get(index).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_ref(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.vars.truncate(len);
    }
}

impl Recycle for PathVars {
    fn recycle(&mut self) {
        self.vars.clear();
    }
}

/// Route resolver consumed by the dispatch core.
///
/// Three independent route spaces share the same paths: ordinary handlers by
/// method, upgrade handlers and task handlers. A path may have any subset.
pub trait RouteResolver: Send + Sync {
    /// Initialize every handler and filter reachable from the routes.
    fn init(&self, env: &dyn Environment) -> anyhow::Result<()>;

    /// Destroy every handler and filter reachable from the routes.
    fn destroy(&self);

    /// Resolve an ordinary route, filling `vars` and appending the route's
    /// filters to `filters`. `None` means no route matched; the buffers are
    /// left empty in that case.
    fn resolve(
        &self,
        path: &str,
        vars: &mut PathVars,
        filters: &mut FilterSet,
    ) -> Option<Arc<MethodHandlers>>;

    /// Resolve an upgrade route.
    fn resolve_upgrade(&self, path: &str, vars: &mut PathVars) -> Option<Arc<dyn UpgradeHandler>>;

    /// Resolve a task route.
    fn resolve_task(&self, path: &str) -> Option<Arc<dyn TaskHandler>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut vars = PathVars::with_capacity(2);
        vars.push(Arc::from("id"), "org-1");
        vars.push(Arc::from("team"), "t");
        vars.push(Arc::from("id"), "user-7");

        assert_eq!(vars.get("id"), Some("user-7"));
        assert_eq!(vars.value_at(0), Some("org-1"));
        assert_eq!(vars.get("missing"), None);
        assert_eq!(vars.len(), 3);

        vars.recycle();
        assert!(vars.is_empty());
    }
}
