//! Segment radix tree backing the default [`Router`].
//!
//! Paths are split on `/` and each segment becomes a node:
//! - Static segments (e.g., `users`) match exactly and are tried first
//! - Parameter segments (e.g., `{id}`) match any single segment
//! - A trailing catch-all (e.g., `*rest`) matches one or more remaining segments
//!
//! Lookups are O(k) in the number of segments. Parameter children with
//! different names at the same depth are kept side by side and tried in
//! insertion order, backtracking when a deeper match fails.
//!
//! Every node can carry a handler-by-method table, an upgrade handler, a task
//! handler and a filter list. Filters apply to the node and all of its
//! descendants; resolution appends them outermost (closest to the root) first.

use http::Method;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::core::{FilterSet, PathVars, RouteResolver};
use crate::filter::Filter;
use crate::handler::{Handler, MethodHandlers, TaskHandler, UpgradeHandler};
use crate::registry::Component;
use crate::server::Environment;

type Segments<'p> = SmallVec<[&'p str; 8]>;

fn split_path(path: &str) -> Segments<'_> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[derive(Default)]
struct Node {
    segment: String,
    param_name: Option<Arc<str>>,
    children: Vec<Node>,
    param_children: Vec<Node>,
    catch_all: Option<Box<Node>>,
    handlers: Option<Arc<MethodHandlers>>,
    upgrade: Option<Arc<dyn UpgradeHandler>>,
    task: Option<Arc<dyn TaskHandler>>,
    filters: Vec<Arc<dyn Filter>>,
}

/// What a lookup is after.
#[derive(Clone, Copy)]
enum Target {
    Handlers,
    Upgrade,
    Task,
}

impl Node {
    fn param(name: &str) -> Self {
        Self {
            param_name: Some(Arc::from(name)),
            ..Self::default()
        }
    }

    fn has(&self, target: Target) -> bool {
        match target {
            Target::Handlers => self.handlers.is_some(),
            Target::Upgrade => self.upgrade.is_some(),
            Target::Task => self.task.is_some(),
        }
    }

    /// Walk (creating as needed) to the node for `segments`.
    ///
    /// # Panics
    ///
    /// On a catch-all that is not the last segment, or catch-alls with
    /// conflicting names at the same position.
    fn node_mut(&mut self, segments: &[&str], pattern: &str) -> &mut Node {
        let Some((&segment, rest)) = segments.split_first() else {
            return self;
        };

        if let Some(name) = segment.strip_prefix('*') {
            assert!(
                rest.is_empty(),
                "catch-all must be the last segment: {pattern}"
            );
            let node = self.catch_all.get_or_insert_with(|| Box::new(Node::param(name)));
            assert!(
                node.param_name.as_deref() == Some(name),
                "conflicting catch-all names at the same position: {pattern}"
            );
            return node;
        }

        if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let idx = match self
                .param_children
                .iter()
                .position(|c| c.param_name.as_deref() == Some(name))
            {
                Some(idx) => idx,
                None => {
                    self.param_children.push(Node::param(name));
                    self.param_children.len() - 1
                }
            };
            return self.param_children[idx].node_mut(rest, pattern);
        }

        let idx = match self.children.iter().position(|c| c.segment == segment) {
            Some(idx) => idx,
            None => {
                self.children.push(Node {
                    segment: segment.to_string(),
                    ..Node::default()
                });
                self.children.len() - 1
            }
        };
        self.children[idx].node_mut(rest, pattern)
    }

    fn search<'n>(
        &'n self,
        segments: &[&str],
        target: Target,
        vars: &mut PathVars,
        mut filters: Option<&mut FilterSet>,
    ) -> Option<&'n Node> {
        if let Some(f) = filters.as_deref_mut() {
            f.extend(self.filters.iter().map(Arc::clone));
        }

        let Some((&segment, rest)) = segments.split_first() else {
            return self.has(target).then_some(self);
        };

        let vars_len = vars.len();
        let filters_len = filters.as_deref().map_or(0, Vec::len);

        for child in self.children.iter().filter(|c| c.segment == segment) {
            if let Some(found) = child.search(rest, target, vars, filters.as_deref_mut()) {
                return Some(found);
            }
            rollback(vars, vars_len, filters.as_deref_mut(), filters_len);
        }

        for child in &self.param_children {
            if let Some(name) = &child.param_name {
                vars.push(Arc::clone(name), segment);
                if let Some(found) = child.search(rest, target, vars, filters.as_deref_mut()) {
                    return Some(found);
                }
                rollback(vars, vars_len, filters.as_deref_mut(), filters_len);
            }
        }

        if let Some(node) = &self.catch_all {
            if node.has(target) {
                if let Some(name) = &node.param_name {
                    vars.push(Arc::clone(name), segments.join("/"));
                }
                if let Some(f) = filters {
                    f.extend(node.filters.iter().map(Arc::clone));
                }
                return Some(node);
            }
        }
        None
    }

    fn for_each(&self, f: &mut dyn FnMut(&Node)) {
        f(self);
        for child in self.children.iter().chain(&self.param_children) {
            child.for_each(f);
        }
        if let Some(node) = &self.catch_all {
            node.for_each(f);
        }
    }
}

fn rollback(vars: &mut PathVars, vars_len: usize, filters: Option<&mut FilterSet>, filters_len: usize) {
    vars.truncate(vars_len);
    if let Some(f) = filters {
        f.truncate(filters_len);
    }
}

/// Default route resolver.
///
/// Routes are registered up front with the builder methods and the router is
/// then handed to the server, which treats it as read-only.
///
/// Patterns must start with `/`; `{name}` declares a path variable and a
/// final `*name` a catch-all.
#[derive(Default)]
pub struct Router {
    root: Node,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn node_mut(&mut self, pattern: &str) -> &mut Node {
        assert!(
            pattern.starts_with('/'),
            "route pattern must start with '/': {pattern}"
        );
        let segments = split_path(pattern);
        self.root.node_mut(&segments, pattern)
    }

    /// Register `handler` for `method` on `pattern`.
    pub fn handle<H: Handler>(&mut self, method: Method, pattern: &str, handler: H) -> &mut Self {
        self.handle_arc(method, pattern, Arc::new(handler))
    }

    /// Register a shared handler; sharing one instance across routes still
    /// initializes and destroys it once.
    pub fn handle_arc(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        let node = self.node_mut(pattern);
        let table = Arc::make_mut(node.handlers.get_or_insert_with(Default::default));
        if table.insert(method.clone(), handler).is_some() {
            warn!(%method, pattern, "Route handler replaced");
        }
        debug!(%method, pattern, "Route registered");
        self
    }

    pub fn get<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.handle(Method::GET, pattern, handler)
    }

    pub fn post<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.handle(Method::POST, pattern, handler)
    }

    pub fn put<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.handle(Method::PUT, pattern, handler)
    }

    pub fn delete<H: Handler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.handle(Method::DELETE, pattern, handler)
    }

    /// Register an upgrade (websocket) handler on `pattern`.
    pub fn upgrade<H: UpgradeHandler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.node_mut(pattern).upgrade = Some(Arc::new(handler));
        self
    }

    /// Register a task handler on `pattern`.
    pub fn task<H: TaskHandler>(&mut self, pattern: &str, handler: H) -> &mut Self {
        self.node_mut(pattern).task = Some(Arc::new(handler));
        self
    }

    /// Attach `filter` to `pattern` and every route below it.
    pub fn filter<F: Filter>(&mut self, pattern: &str, filter: F) -> &mut Self {
        self.filter_arc(pattern, Arc::new(filter))
    }

    pub fn filter_arc(&mut self, pattern: &str, filter: Arc<dyn Filter>) -> &mut Self {
        self.node_mut(pattern).filters.push(filter);
        self
    }

    /// Every distinct component reachable from the tree, in tree order.
    fn components(&self) -> Vec<Arc<dyn Component>> {
        let mut seen = HashSet::new();
        let mut out: Vec<Arc<dyn Component>> = Vec::new();
        let mut visit = |ptr: *const (), component: Arc<dyn Component>| {
            if seen.insert(ptr) {
                out.push(component);
            }
        };
        self.root.for_each(&mut |node| {
            for f in &node.filters {
                visit(Arc::as_ptr(f).cast(), Arc::clone(f) as Arc<dyn Component>);
            }
            if let Some(table) = &node.handlers {
                for h in table.handlers() {
                    visit(Arc::as_ptr(h).cast(), Arc::clone(h) as Arc<dyn Component>);
                }
            }
            if let Some(h) = &node.upgrade {
                visit(Arc::as_ptr(h).cast(), Arc::clone(h) as Arc<dyn Component>);
            }
            if let Some(h) = &node.task {
                visit(Arc::as_ptr(h).cast(), Arc::clone(h) as Arc<dyn Component>);
            }
        });
        out
    }
}

impl RouteResolver for Router {
    fn init(&self, env: &dyn Environment) -> anyhow::Result<()> {
        let mut first_err = None;
        for component in self.components() {
            if let Err(err) = component.init(env) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn destroy(&self) {
        for component in self.components() {
            component.destroy();
        }
    }

    fn resolve(
        &self,
        path: &str,
        vars: &mut PathVars,
        filters: &mut FilterSet,
    ) -> Option<Arc<MethodHandlers>> {
        let segments = split_path(path);
        let found = self
            .root
            .search(&segments, Target::Handlers, vars, Some(&mut *filters))
            .and_then(|node| node.handlers.as_ref().map(Arc::clone));
        if found.is_none() {
            vars.truncate(0);
            filters.clear();
        }
        found
    }

    fn resolve_upgrade(&self, path: &str, vars: &mut PathVars) -> Option<Arc<dyn UpgradeHandler>> {
        let segments = split_path(path);
        let found = self
            .root
            .search(&segments, Target::Upgrade, vars, None)
            .and_then(|node| node.upgrade.as_ref().map(Arc::clone));
        if found.is_none() {
            vars.truncate(0);
        }
        found
    }

    fn resolve_task(&self, path: &str) -> Option<Arc<dyn TaskHandler>> {
        let segments = split_path(path);
        let mut vars = PathVars::new();
        self.root
            .search(&segments, Target::Task, &mut vars, None)
            .and_then(|node| node.task.as_ref().map(Arc::clone))
    }
}
