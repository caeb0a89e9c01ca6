//! Handler traits for the three route spaces: ordinary requests (by method),
//! upgraded connections and synchronous tasks.
//!
//! Every handler is a [`Component`]: the router initializes it once at server
//! start and destroys it once at shutdown, however many routes share it.

use crate::registry::Component;
use crate::server::{Request, Response, UpgradedConn};
use http::Method;
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Terminal request handler.
pub trait Handler: Component {
    fn handle(&self, req: &mut Request, resp: &mut Response);
}

/// Handler for a connection that completed a protocol upgrade.
///
/// The connection belongs to the handler until `handle` returns; it is not
/// counted by the graceful-shutdown drain.
pub trait UpgradeHandler: Component {
    fn handle(&self, conn: UpgradedConn<'_>);
}

/// Handler for [`Environment::start_task`](crate::server::Environment::start_task).
pub trait TaskHandler: Component {
    fn handle(&self, value: Box<dyn Any + Send>);
}

/// Handler-by-method table attached to a route.
#[derive(Clone, Default)]
pub struct MethodHandlers {
    handlers: SmallVec<[(Method, Arc<dyn Handler>); 4]>,
}

impl MethodHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler for `method`, returning the one it replaces.
    pub fn insert(&mut self, method: Method, handler: Arc<dyn Handler>) -> Option<Arc<dyn Handler>> {
        match self.handlers.iter_mut().find(|(m, _)| *m == method) {
            Some(slot) => Some(std::mem::replace(&mut slot.1, handler)),
            None => {
                self.handlers.push((method, handler));
                None
            }
        }
    }

    /// Handler for `method`. `HEAD` falls back to `GET`.
    #[must_use]
    pub fn get(&self, method: &Method) -> Option<&Arc<dyn Handler>> {
        let found = self.handlers.iter().find(|(m, _)| m == method);
        match found {
            Some((_, h)) => Some(h),
            None if *method == Method::HEAD => self.get(&Method::GET),
            None => None,
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.handlers.iter().map(|(m, _)| m)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.iter().map(|(_, h)| h)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for MethodHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.methods()).finish()
    }
}

/// Closure-backed [`Handler`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a [`Handler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
{
    FnHandler(f)
}

impl<F: Send + Sync + 'static> Component for FnHandler<F> {}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
{
    fn handle(&self, req: &mut Request, resp: &mut Response) {
        (self.0)(req, resp);
    }
}

/// Closure-backed [`UpgradeHandler`].
pub struct FnUpgradeHandler<F>(F);

pub fn upgrade_fn<F>(f: F) -> FnUpgradeHandler<F>
where
    F: Fn(UpgradedConn<'_>) + Send + Sync + 'static,
{
    FnUpgradeHandler(f)
}

impl<F: Send + Sync + 'static> Component for FnUpgradeHandler<F> {}

impl<F> UpgradeHandler for FnUpgradeHandler<F>
where
    F: Fn(UpgradedConn<'_>) + Send + Sync + 'static,
{
    fn handle(&self, conn: UpgradedConn<'_>) {
        (self.0)(conn);
    }
}

/// Closure-backed [`TaskHandler`].
pub struct FnTaskHandler<F>(F);

pub fn task_fn<F>(f: F) -> FnTaskHandler<F>
where
    F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
{
    FnTaskHandler(f)
}

impl<F: Send + Sync + 'static> Component for FnTaskHandler<F> {}

impl<F> TaskHandler for FnTaskHandler<F>
where
    F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
{
    fn handle(&self, value: Box<dyn Any + Send>) {
        (self.0)(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(handler_fn(|_, _| {}))
    }

    #[test]
    fn test_method_table() {
        let mut table = MethodHandlers::new();
        assert!(table.insert(Method::GET, noop()).is_none());
        assert!(table.insert(Method::POST, noop()).is_none());
        assert!(table.insert(Method::GET, noop()).is_some(), "replaced");

        assert_eq!(table.len(), 2);
        assert!(table.get(&Method::GET).is_some());
        assert!(table.get(&Method::DELETE).is_none());
        let methods: Vec<_> = table.methods().cloned().collect();
        assert_eq!(methods, vec![Method::GET, Method::POST]);
    }

    #[test]
    fn test_head_falls_back_to_get() {
        let mut table = MethodHandlers::new();
        assert!(table.get(&Method::HEAD).is_none());
        table.insert(Method::GET, noop());
        assert!(table.get(&Method::HEAD).is_some());
    }
}
