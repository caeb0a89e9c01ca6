use crate::handler::Handler;
use crate::registry::Component;
use crate::server::{Environment, Request, Response};
use std::collections::HashSet;
use std::sync::Arc;

/// Request interceptor.
///
/// A filter either calls [`FilterChain::proceed`] to run the next layer or
/// returns without calling it to short-circuit, usually after writing a
/// response. Work placed after `proceed` runs once the inner layers returned.
pub trait Filter: Component {
    fn filter(&self, req: &mut Request, resp: &mut Response, chain: FilterChain<'_>);
}

/// Innermost action of a chain.
#[derive(Clone, Copy)]
pub enum Terminal<'a> {
    Handler(&'a dyn Handler),
    /// Route matched but has no handler for the request method.
    MethodNotAllowed,
    /// No route matched.
    NotFound,
}

impl Terminal<'_> {
    fn invoke(self, req: &mut Request, resp: &mut Response) {
        match self {
            Terminal::Handler(handler) => handler.handle(req, resp),
            Terminal::MethodNotAllowed => resp.report_method_not_allowed(),
            Terminal::NotFound => resp.report_not_found(),
        }
    }
}

/// Root filters, then route filters, then the terminal action.
///
/// `proceed` consumes the chain, so each layer can continue at most once and
/// a composed chain cannot be invoked twice.
pub struct FilterChain<'a> {
    root: &'a [Arc<dyn Filter>],
    route: &'a [Arc<dyn Filter>],
    terminal: Terminal<'a>,
}

impl<'a> FilterChain<'a> {
    #[must_use]
    pub fn new(
        root: &'a [Arc<dyn Filter>],
        route: &'a [Arc<dyn Filter>],
        terminal: Terminal<'a>,
    ) -> Self {
        Self {
            root,
            route,
            terminal,
        }
    }

    /// Run the next layer.
    pub fn proceed(self, req: &mut Request, resp: &mut Response) {
        if let Some((first, rest)) = self.root.split_first() {
            first.filter(req, resp, FilterChain { root: rest, ..self });
        } else if let Some((first, rest)) = self.route.split_first() {
            first.filter(req, resp, FilterChain { route: rest, ..self });
        } else {
            self.terminal.invoke(req, resp);
        }
    }

    /// Layers left before the terminal action.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.root.len() + self.route.len()
    }
}

/// Filters applied to every route, outside the route's own filters.
pub trait RootFilters: Send + Sync {
    /// Filters for `path`, outermost first.
    fn filters(&self, path: &str) -> &[Arc<dyn Filter>];

    fn init(&self, env: &dyn Environment) -> anyhow::Result<()>;

    fn destroy(&self);
}

/// Ordered root filter list applied to every path.
#[derive(Default)]
pub struct RootFilterList {
    filters: Vec<Arc<dyn Filter>>,
}

impl RootFilterList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter; later filters run inside earlier ones.
    pub fn add<F: Filter>(&mut self, filter: F) -> &mut Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn add_arc(&mut self, filter: Arc<dyn Filter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    fn unique(&self) -> impl Iterator<Item = &Arc<dyn Filter>> {
        let mut seen = HashSet::new();
        self.filters
            .iter()
            .filter(move |f| seen.insert(Arc::as_ptr(f).cast::<()>()))
    }
}

impl RootFilters for RootFilterList {
    fn filters(&self, _path: &str) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    /// Initializes every filter; the first failure is returned after all ran.
    fn init(&self, env: &dyn Environment) -> anyhow::Result<()> {
        let mut first_err = None;
        for filter in self.unique() {
            if let Err(err) = filter.init(env) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn destroy(&self) {
        for filter in self.unique() {
            filter.destroy();
        }
    }
}

/// Closure-backed [`Filter`].
pub struct FnFilter<F>(F);

/// Wrap a closure as a [`Filter`].
pub fn filter_fn<F>(f: F) -> FnFilter<F>
where
    F: Fn(&mut Request, &mut Response, FilterChain<'_>) + Send + Sync + 'static,
{
    FnFilter(f)
}

impl<F: Send + Sync + 'static> Component for FnFilter<F> {}

impl<F> Filter for FnFilter<F>
where
    F: Fn(&mut Request, &mut Response, FilterChain<'_>) + Send + Sync + 'static,
{
    fn filter(&self, req: &mut Request, resp: &mut Response, chain: FilterChain<'_>) {
        (self.0)(req, resp, chain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use http::StatusCode;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn Filter> {
        let log = Arc::clone(log);
        Arc::new(filter_fn(move |req, resp, chain| {
            log.lock().push(format!("{name}-before"));
            chain.proceed(req, resp);
            log.lock().push(format!("{name}-after"));
        }))
    }

    #[test]
    fn test_layer_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = vec![recorder(&log, "G")];
        let route = vec![recorder(&log, "R")];
        let handler_log = Arc::clone(&log);
        let handler = handler_fn(move |_, _| handler_log.lock().push("H".into()));

        let mut req = Request::default();
        let mut resp = Response::default();
        FilterChain::new(&root, &route, Terminal::Handler(&handler)).proceed(&mut req, &mut resp);

        assert_eq!(
            *log.lock(),
            vec!["G-before", "R-before", "H", "R-after", "G-after"]
        );
    }

    #[test]
    fn test_short_circuit_skips_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root: Vec<Arc<dyn Filter>> = vec![Arc::new(filter_fn(|_, resp, _chain| {
            resp.report_status(StatusCode::UNAUTHORIZED);
        }))];
        let route = vec![recorder(&log, "R")];

        let mut req = Request::default();
        let mut resp = Response::default();
        FilterChain::new(&root, &route, Terminal::NotFound).proceed(&mut req, &mut resp);

        assert!(log.lock().is_empty());
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_terminal_statuses() {
        let mut req = Request::default();
        let mut resp = Response::default();
        FilterChain::new(&[], &[], Terminal::MethodNotAllowed).proceed(&mut req, &mut resp);
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let mut resp = Response::default();
        FilterChain::new(&[], &[], Terminal::NotFound).proceed(&mut req, &mut resp);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_root_list_dedups_lifecycle() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counted(AtomicUsize);
        impl Component for Counted {
            fn destroy(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        impl Filter for Counted {
            fn filter(&self, req: &mut Request, resp: &mut Response, chain: FilterChain<'_>) {
                chain.proceed(req, resp);
            }
        }

        let shared = Arc::new(Counted(AtomicUsize::new(0)));
        let mut list = RootFilterList::new();
        list.add_arc(shared.clone()).add_arc(shared.clone());
        assert_eq!(list.len(), 2);
        list.destroy();
        assert_eq!(shared.0.load(Ordering::SeqCst), 1);
    }
}
