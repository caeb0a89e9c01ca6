use super::dispatch::{normalize_path, RequestEnv};
use super::http_server::ServerHandle;
use super::tracker::ConnectionTracker;
use super::transport;
use super::upgrade::{HeaderChecker, Handshaker, WebSocketHandshaker};
use super::Environment;
use crate::attrs::Attributes;
use crate::config::ServerConfig;
use crate::error::{ComponentError, ServerError};
use crate::filter::{RootFilterList, RootFilters};
use crate::logging::Logger;
use crate::pool::Pool;
use crate::registry::{Component, ComponentRegistry, ComponentState};
use crate::resource::{ResourceMaster, ResourceNegotiator};
use crate::router::{FilterSet, PathVars, RouteResolver, Router};
use may::coroutine::JoinHandle;
use may::net::TcpListener;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info};

/// Free-list bound of each per-request pool.
const POOL_MAX_IDLE: usize = 1024;

/// State fixed by `configure`: options plus the per-request pools sized from them.
pub(crate) struct Runtime {
    pub(crate) config: ServerConfig,
    pub(crate) content_type: Option<String>,
    pub(crate) checker: Option<HeaderChecker>,
    pub(crate) logger: Logger,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) envs: Pool<RequestEnv>,
    pub(crate) vars: Pool<PathVars>,
    pub(crate) filters: Pool<FilterSet>,
}

impl Runtime {
    fn new(
        mut config: ServerConfig,
        fallback_logger: &Logger,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        let logger = config
            .logger
            .take()
            .unwrap_or_else(|| fallback_logger.clone());
        let var_capacity = config.path_var_capacity;
        let filter_capacity = config.filter_capacity;
        Self {
            content_type: config.default_content_type().map(str::to_string),
            checker: config.upgrade_checker.clone(),
            logger,
            tls,
            envs: Pool::new(POOL_MAX_IDLE, RequestEnv::default),
            vars: Pool::new(POOL_MAX_IDLE, move || PathVars::with_capacity(var_capacity)),
            filters: Pool::new(POOL_MAX_IDLE, move || {
                FilterSet::with_capacity(filter_capacity)
            }),
            config,
        }
    }
}

/// The aggregate root: routes, root filters, components and the transport.
///
/// Build one with [`Server::builder`] (or [`Server::new`] for an empty
/// server), register components, then [`start`](Server::start) it once.
/// After [`destroy`](Server::destroy) the server cannot be started again.
pub struct Server {
    router: Arc<dyn RouteResolver>,
    root_filters: Arc<dyn RootFilters>,
    resources: Arc<dyn ResourceNegotiator>,
    handshaker: Arc<dyn Handshaker>,
    attrs: Attributes,
    components: ComponentRegistry,
    runtime: OnceCell<Runtime>,
    tracker: ConnectionTracker,
    accept: Mutex<Option<JoinHandle<()>>>,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
    fallback_logger: Logger,
}

impl Server {
    /// Server with an empty router, no root filters and JSON bodies.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    #[must_use]
    pub fn router(&self) -> &dyn RouteResolver {
        &*self.router
    }

    #[must_use]
    pub fn root_filters(&self) -> &dyn RootFilters {
        &*self.root_filters
    }

    #[must_use]
    pub fn resources(&self) -> &dyn ResourceNegotiator {
        &*self.resources
    }

    #[must_use]
    pub fn handshaker(&self) -> &dyn Handshaker {
        &*self.handshaker
    }

    /// Server-wide attributes shared by every component.
    #[must_use]
    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    #[must_use]
    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    #[must_use]
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Options in effect; `None` before the server is configured.
    #[must_use]
    pub fn config(&self) -> Option<&ServerConfig> {
        self.runtime.get().map(|rt| &rt.config)
    }

    pub(crate) fn runtime(&self) -> Option<&Runtime> {
        self.runtime.get()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.tracker.is_destroyed()
    }

    /// Register a named component. See [`ComponentRegistry::add`].
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Init`] when an eager `init` fails.
    pub fn add_component(&self, name: &str, state: ComponentState) -> Result<(), ComponentError> {
        self.components.add(name, state, self)
    }

    /// Look up a named component, running its lazy `init` on first use.
    ///
    /// # Errors
    ///
    /// [`ComponentError::NotFound`] or the lazy `init` failure.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Component>, ComponentError> {
        self.components.lookup(name, self)
    }

    /// Typed [`lookup`](Self::lookup).
    ///
    /// # Errors
    ///
    /// As `lookup`, plus [`ComponentError::WrongType`].
    pub fn lookup_as<T: Component + Any>(&self, name: &str) -> Result<Arc<T>, ComponentError> {
        self.components.lookup_as(name, self)
    }

    pub fn remove_component(&self, name: &str) {
        self.logger().in_scope(|| self.components.remove(name));
    }

    /// Add a component initialized at start and destroyed at shutdown.
    pub fn manage<C: Component>(&self, component: C) {
        self.components.manage(Arc::new(component));
    }

    pub fn manage_arc(&self, component: Arc<dyn Component>) {
        self.components.manage(component);
    }

    /// Apply `config` and initialize resources, managed components, root
    /// filters and routes, in that order.
    ///
    /// Initialization failures are logged and startup continues.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyStarted`] on a second call or after destroy,
    /// [`ServerError::Tls`] when TLS material cannot be loaded.
    pub fn configure(&self, config: ServerConfig) -> Result<(), ServerError> {
        if self.is_destroyed() || self.runtime.get().is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let tls = transport::load_tls(&config)?;
        let runtime = Runtime::new(config, &self.fallback_logger, tls);
        self.runtime
            .set(runtime)
            .map_err(|_| ServerError::AlreadyStarted)?;

        let logger = self.logger().clone();
        logger.in_scope(|| debug!("Initializing server components"));
        if let Err(err) = self.resources.init(self) {
            logger.log_error(&err.context("resource init failed"));
        }
        self.components.init_managed(self, &logger);
        if let Err(err) = self.root_filters.init(self) {
            logger.log_error(&err.context("root filter init failed"));
        }
        if let Err(err) = self.router.init(self) {
            logger.log_error(&err.context("router init failed"));
        }
        Ok(())
    }

    /// Configure, bind and start accepting on a background coroutine.
    ///
    /// # Errors
    ///
    /// Configuration errors, [`ServerError::Bind`] if the address cannot be
    /// bound, [`ServerError::Spawn`] if the accept coroutine cannot start.
    pub fn start(self: &Arc<Self>, config: ServerConfig) -> Result<ServerHandle, ServerError> {
        let listen_addr = config.listen_addr.clone();
        self.configure(config)?;

        let bind_err = |source| ServerError::Bind {
            addr: listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(listen_addr.as_str()).map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;

        let server = Arc::clone(self);
        // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
        // This is safe because:
        // - The closure owns everything it uses (an Arc of the server and the listener)
        // - The coroutine is cancelled and joined by Server::destroy
        let handle = unsafe {
            may::coroutine::Builder::new()
                .name("brrtserver-accept".to_string())
                .spawn(move || transport::accept_loop(&server, &listener))
        }
        .map_err(ServerError::Spawn)?;
        *self.accept.lock() = Some(handle);

        self.logger().in_scope(|| {
            info!(
                addr = %addr,
                tls = self.runtime().is_some_and(|rt| rt.tls.is_some()),
                "Server listening"
            );
        });
        Ok(ServerHandle::new(addr, Arc::clone(self)))
    }

    /// [`start`](Self::start), then block until the server is destroyed.
    ///
    /// # Errors
    ///
    /// As `start`.
    pub fn serve(self: &Arc<Self>, config: ServerConfig) -> Result<(), ServerError> {
        self.start(config)?.join();
        Ok(())
    }

    /// Graceful shutdown. Only the first call does anything.
    ///
    /// Stops accepting, closes idle connections, waits (without a bound) for
    /// in-flight requests, then destroys root filters, routes, named
    /// components, managed components and codecs. Upgraded connections are
    /// not waited for. Destruction order is not the reverse of init order.
    pub fn destroy(&self) {
        if !self.tracker.begin_destroy() {
            self.logger().in_scope(|| debug!("Server already destroyed"));
            return;
        }
        let logger = self.logger().clone();
        logger.in_scope(|| info!("Server shutting down"));

        let accept = self.accept.lock().take();
        if let Some(handle) = accept {
            // SAFETY: may::CoroutineHandle::coroutine().cancel() is marked unsafe by the may runtime.
            // This is safe because:
            // - The handle is valid (we own it)
            // - The accept loop holds no locks across accept(), the only blocking point
            unsafe {
                handle.coroutine().cancel();
            }
            if handle.join().is_err() {
                logger.in_scope(|| debug!("Accept coroutine cancelled"));
            }
        }

        self.tracker.close_idle(&logger);
        self.tracker.wait_drained(&logger);

        logger.in_scope(|| {
            debug!("Destroying server components");
            self.root_filters.destroy();
            self.router.destroy();
            self.components.destroy_components();
            self.components.destroy_managed();
            self.resources.destroy();
            info!("Server stopped");
        });

        *self.stopped.lock() = true;
        self.stopped_cv.notify_all();
    }

    /// Block until [`destroy`](Self::destroy) has completed.
    pub fn wait_stopped(&self) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.stopped_cv.wait(&mut stopped);
        }
    }
}

impl Environment for Server {
    fn server(&self) -> &Server {
        self
    }

    fn logger(&self) -> &Logger {
        self.runtime
            .get()
            .map_or(&self.fallback_logger, |rt| &rt.logger)
    }

    fn start_task(&self, path: &str, value: Box<dyn Any + Send>) {
        let path = normalize_path(path);
        match self.router.resolve_task(path) {
            Some(handler) => handler.handle(value),
            None => panic!("no task handler found for {path}"),
        }
    }

    fn component(&self, name: &str) -> Result<Arc<dyn Component>, ComponentError> {
        self.lookup(name)
    }
}

/// Collaborators of a [`Server`]; unset ones get the built-in defaults.
#[derive(Default)]
pub struct ServerBuilder {
    router: Option<Arc<dyn RouteResolver>>,
    root_filters: Option<Arc<dyn RootFilters>>,
    resources: Option<Arc<dyn ResourceNegotiator>>,
    handshaker: Option<Arc<dyn Handshaker>>,
    logger: Option<Logger>,
}

impl ServerBuilder {
    #[must_use]
    pub fn router<R: RouteResolver + 'static>(mut self, router: R) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    #[must_use]
    pub fn root_filters<F: RootFilters + 'static>(mut self, filters: F) -> Self {
        self.root_filters = Some(Arc::new(filters));
        self
    }

    #[must_use]
    pub fn resources<N: ResourceNegotiator + 'static>(mut self, resources: N) -> Self {
        self.resources = Some(Arc::new(resources));
        self
    }

    #[must_use]
    pub fn handshaker<H: Handshaker + 'static>(mut self, handshaker: H) -> Self {
        self.handshaker = Some(Arc::new(handshaker));
        self
    }

    /// Logger used until a configured one takes over.
    #[must_use]
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Server> {
        Arc::new(Server {
            router: self.router.unwrap_or_else(|| Arc::new(Router::new())),
            root_filters: self
                .root_filters
                .unwrap_or_else(|| Arc::new(RootFilterList::new())),
            resources: self
                .resources
                .unwrap_or_else(|| Arc::new(ResourceMaster::new())),
            handshaker: self
                .handshaker
                .unwrap_or_else(|| Arc::new(WebSocketHandshaker)),
            attrs: Attributes::new(),
            components: ComponentRegistry::new(),
            runtime: OnceCell::new(),
            tracker: ConnectionTracker::new(),
            accept: Mutex::new(None),
            stopped: Mutex::new(false),
            stopped_cv: Condvar::new(),
            fallback_logger: self.logger.unwrap_or_default(),
        })
    }
}
