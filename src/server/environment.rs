use super::Server;
use crate::error::ComponentError;
use crate::logging::Logger;
use crate::registry::Component;
use std::any::Any;
use std::sync::Arc;

/// Capability surface handed to components, filters and handlers.
///
/// The server is the only production implementation; the trait keeps the
/// contract narrow so collaborators never depend on server internals.
pub trait Environment: Send + Sync {
    /// The owning server.
    fn server(&self) -> &Server;

    fn logger(&self) -> &Logger;

    /// Run the task handler registered for `path` synchronously.
    ///
    /// # Panics
    ///
    /// Panics when no task handler matches `path`.
    fn start_task(&self, path: &str, value: Box<dyn Any + Send>);

    /// Look up a registered component, initializing it on first use.
    ///
    /// # Errors
    ///
    /// [`ComponentError::NotFound`] for unknown names, or the failure of a lazy `init`.
    fn component(&self, name: &str) -> Result<Arc<dyn Component>, ComponentError>;
}
