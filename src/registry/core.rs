use crate::error::ComponentError;
use crate::logging::Logger;
use crate::server::Environment;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Conversion to `Any` for typed lookups; implemented for every sized type.
pub trait AsAny {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A subsystem whose lifecycle is driven by the server.
///
/// `init` may be called again after it returned an error; it is never called
/// again once it succeeded. `destroy` is only called on components whose
/// `init` succeeded (or that were registered as already initialized).
pub trait Component: AsAny + Send + Sync + 'static {
    fn init(&self, _env: &dyn Environment) -> anyhow::Result<()> {
        Ok(())
    }

    fn destroy(&self) {}
}

/// Registration descriptor passed to [`ComponentRegistry::add`].
///
/// `ComponentState::default()` carries no component and is rejected by `add`.
#[derive(Clone, Default)]
pub struct ComponentState {
    pub component: Option<Arc<dyn Component>>,
    /// `init` already ran successfully elsewhere; never call it again
    pub initialized: bool,
    /// Run `init` inside `add` instead of on first lookup
    pub no_lazy: bool,
}

impl ComponentState {
    /// Initialize on first lookup.
    pub fn lazy<C: Component>(component: C) -> Self {
        Self {
            component: Some(Arc::new(component)),
            initialized: false,
            no_lazy: false,
        }
    }

    /// Initialize during registration; failures are returned by `add`.
    pub fn eager<C: Component>(component: C) -> Self {
        Self {
            no_lazy: true,
            ..Self::lazy(component)
        }
    }

    /// Already initialized by the caller.
    pub fn initialized<C: Component>(component: C) -> Self {
        Self {
            initialized: true,
            ..Self::lazy(component)
        }
    }

    /// Wrap an existing shared component.
    #[must_use]
    pub fn from_arc(component: Arc<dyn Component>) -> Self {
        Self {
            component: Some(component),
            initialized: false,
            no_lazy: false,
        }
    }

    #[must_use]
    pub fn no_lazy(mut self, no_lazy: bool) -> Self {
        self.no_lazy = no_lazy;
        self
    }
}

enum Status {
    Registered,
    Initializing {
        attempt: u64,
    },
    Ready,
    Failed {
        attempt: u64,
        error: Arc<anyhow::Error>,
    },
}

struct Lifecycle {
    status: Status,
    attempts: u64,
}

struct Entry {
    name: String,
    component: Arc<dyn Component>,
    ready: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl Entry {
    fn new(name: String, component: Arc<dyn Component>, ready: bool) -> Self {
        Self {
            name,
            component,
            ready: AtomicBool::new(ready),
            lifecycle: Mutex::new(Lifecycle {
                status: if ready { Status::Ready } else { Status::Registered },
                attempts: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn init_error(&self, error: &Arc<anyhow::Error>) -> ComponentError {
        ComponentError::Init {
            name: self.name.clone(),
            cause: Arc::clone(error),
        }
    }

    /// Slow path of a lookup: run `init` at most once per attempt.
    fn initialize(&self, env: &dyn Environment) -> Result<(), ComponentError> {
        let mut guard = self.lifecycle.lock();
        let mut waited_on = None;
        loop {
            match &guard.status {
                Status::Ready => return Ok(()),
                Status::Initializing { attempt } => {
                    waited_on = Some(*attempt);
                    self.changed.wait(&mut guard);
                }
                Status::Failed { attempt, error } if waited_on == Some(*attempt) => {
                    return Err(self.init_error(error));
                }
                Status::Registered | Status::Failed { .. } => {
                    return self.run_init(&mut guard, env);
                }
            }
        }
    }

    fn run_init(
        &self,
        guard: &mut MutexGuard<'_, Lifecycle>,
        env: &dyn Environment,
    ) -> Result<(), ComponentError> {
        guard.attempts += 1;
        let attempt = guard.attempts;
        guard.status = Status::Initializing { attempt };
        env.logger()
            .in_scope(|| debug!(component = %self.name, attempt, "Lazy component init start"));

        // Run without the entry lock so `init` can look up other components.
        let outcome = MutexGuard::unlocked(guard, || {
            panic::catch_unwind(AssertUnwindSafe(|| self.component.init(env)))
        });

        let result = match outcome {
            Ok(Ok(())) => {
                guard.status = Status::Ready;
                self.ready.store(true, Ordering::Release);
                env.logger().in_scope(|| {
                    info!(component = %self.name, attempt, "Component initialized");
                });
                Ok(())
            }
            Ok(Err(err)) => {
                let error = Arc::new(err);
                let result = Err(self.init_error(&error));
                guard.status = Status::Failed { attempt, error };
                result
            }
            Err(payload) => {
                guard.status = Status::Registered;
                self.changed.notify_all();
                MutexGuard::unlocked(guard, || panic::resume_unwind(payload))
            }
        };
        self.changed.notify_all();
        result
    }

    /// Block until no `init` is in flight, then report whether it is ready.
    fn settle(&self) -> bool {
        let mut guard = self.lifecycle.lock();
        while matches!(guard.status, Status::Initializing { .. }) {
            self.changed.wait(&mut guard);
        }
        matches!(guard.status, Status::Ready)
    }
}

/// Registry of named and managed components.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, Arc<Entry>>>,
    managed: Mutex<Vec<Arc<dyn Component>>>,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `state` under `name`.
    ///
    /// Eager components are initialized here, before they become visible to
    /// lookups; on failure nothing is registered and the error is returned.
    /// Registering over an existing name replaces (and destroys, if
    /// initialized) the previous component.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty or `state` carries no component. Both are
    /// deployment bugs, not runtime conditions.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Init`] when an eager `init` fails.
    pub fn add(
        &self,
        name: &str,
        state: ComponentState,
        env: &dyn Environment,
    ) -> Result<(), ComponentError> {
        let component = match (name.is_empty(), state.component) {
            (false, Some(component)) => component,
            _ => panic!("empty name or nil component is not allowed"),
        };

        let mut initialized = state.initialized;
        if !initialized && state.no_lazy {
            component.init(env).map_err(|err| ComponentError::Init {
                name: name.to_string(),
                cause: Arc::new(err),
            })?;
            initialized = true;
            env.logger()
                .in_scope(|| info!(component = %name, "Component initialized eagerly"));
        }

        let entry = Arc::new(Entry::new(name.to_string(), component, initialized));
        let previous = self.components.write().insert(name.to_string(), entry);
        if let Some(previous) = previous {
            env.logger()
                .in_scope(|| warn!(component = %name, "Component replaced"));
            if previous.settle() {
                previous.component.destroy();
            }
        }
        Ok(())
    }

    /// Fetch `name`, initializing it first if needed.
    ///
    /// # Errors
    ///
    /// [`ComponentError::NotFound`] if nothing is registered under `name`;
    /// [`ComponentError::Init`] if the lazy `init` failed.
    pub fn lookup(
        &self,
        name: &str,
        env: &dyn Environment,
    ) -> Result<Arc<dyn Component>, ComponentError> {
        let entry = self
            .components
            .read()
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| ComponentError::NotFound(name.to_string()))?;

        if !entry.ready.load(Ordering::Acquire) {
            entry.initialize(env)?;
        }
        Ok(Arc::clone(&entry.component))
    }

    /// Typed [`lookup`](Self::lookup).
    ///
    /// # Errors
    ///
    /// As `lookup`, plus [`ComponentError::WrongType`] when the component
    /// is not a `T`.
    pub fn lookup_as<T: Component + Any>(
        &self,
        name: &str,
        env: &dyn Environment,
    ) -> Result<Arc<T>, ComponentError> {
        self.lookup(name, env)?
            .into_any()
            .downcast::<T>()
            .map_err(|_| ComponentError::WrongType(name.to_string()))
    }

    /// Unregister `name`, destroying it if it was initialized.
    pub fn remove(&self, name: &str) {
        if name.is_empty() {
            return;
        }
        let removed = self.components.write().remove(name);
        if let Some(entry) = removed {
            if entry.settle() {
                entry.component.destroy();
            }
            debug!(component = %name, "Component removed");
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.components.read().contains_key(name)
    }

    #[must_use]
    pub fn is_initialized(&self, name: &str) -> bool {
        self.components
            .read()
            .get(name)
            .is_some_and(|e| e.ready.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an anonymous component initialized at start and destroyed at shutdown.
    pub fn manage(&self, component: Arc<dyn Component>) {
        self.managed.lock().push(component);
    }

    #[must_use]
    pub fn managed_len(&self) -> usize {
        self.managed.lock().len()
    }

    /// Initialize every managed component; failures are logged, not fatal.
    pub fn init_managed(&self, env: &dyn Environment, logger: &Logger) {
        let managed: Vec<_> = self.managed.lock().iter().map(Arc::clone).collect();
        for component in managed {
            if let Err(err) = component.init(env) {
                logger.log_error(&err.context("managed component init failed"));
            }
        }
    }

    /// Destroy and unregister every initialized named component.
    ///
    /// Order follows map iteration and is not the reverse of init order.
    pub fn destroy_components(&self) {
        let drained: Vec<_> = self.components.write().drain().collect();
        for (name, entry) in drained {
            if entry.settle() {
                debug!(component = %name, "Destroying component");
                entry.component.destroy();
            }
        }
    }

    /// Destroy every managed component in registration order.
    pub fn destroy_managed(&self) {
        let managed = std::mem::take(&mut *self.managed.lock());
        for component in managed {
            component.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        inits: AtomicUsize,
        destroys: AtomicUsize,
        fail_first: bool,
    }

    impl Component for Counting {
        fn init(&self, _env: &dyn Environment) -> anyhow::Result<()> {
            let n = self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("first init fails");
            }
            Ok(())
        }

        fn destroy(&self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_missing_lookup_is_not_found() {
        let server = Server::new();
        let registry = ComponentRegistry::new();
        let err = registry.lookup("missing", &*server).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    #[should_panic(expected = "empty name or nil component")]
    fn test_add_empty_name_panics() {
        let server = Server::new();
        let registry = ComponentRegistry::new();
        let _ = registry.add("", ComponentState::lazy(Counting::default()), &*server);
    }

    #[test]
    fn test_add_nil_component_panics_without_mutation() {
        let server = Server::new();
        let registry = ComponentRegistry::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = registry.add("x", ComponentState::default(), &*server);
        }));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_lazy_init_is_retried() {
        let server = Server::new();
        let registry = ComponentRegistry::new();
        let comp = Arc::new(Counting {
            fail_first: true,
            ..Counting::default()
        });
        registry
            .add("db", ComponentState::from_arc(comp.clone()), &*server)
            .unwrap();

        let err = registry.lookup("db", &*server).err().unwrap();
        assert!(matches!(err, ComponentError::Init { .. }));
        assert!(!registry.is_initialized("db"));

        assert!(registry.lookup("db", &*server).is_ok());
        assert!(registry.lookup("db", &*server).is_ok());
        assert_eq!(comp.inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_destroys_only_initialized() {
        let server = Server::new();
        let registry = ComponentRegistry::new();
        let used = Arc::new(Counting::default());
        let unused = Arc::new(Counting::default());
        registry
            .add("used", ComponentState::from_arc(used.clone()), &*server)
            .unwrap();
        registry
            .add("unused", ComponentState::from_arc(unused.clone()), &*server)
            .unwrap();
        registry.lookup("used", &*server).unwrap();

        registry.remove("used");
        registry.remove("unused");
        registry.remove("never-added");

        assert_eq!(used.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(unused.destroys.load(Ordering::SeqCst), 0);
        assert_eq!(unused.inits.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicking_init_does_not_wedge_entry() {
        struct Explodes(AtomicUsize);
        impl Component for Explodes {
            fn init(&self, _env: &dyn Environment) -> anyhow::Result<()> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(())
            }
        }

        let server = Server::new();
        let registry = ComponentRegistry::new();
        registry
            .add("x", ComponentState::lazy(Explodes(AtomicUsize::new(0))), &*server)
            .unwrap();
        let first = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = registry.lookup("x", &*server);
        }));
        assert!(first.is_err());
        assert!(registry.lookup("x", &*server).is_ok());
    }
}
