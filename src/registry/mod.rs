//! # Component Registry
//!
//! Name-keyed store of lifecycle-managed subsystems (caches, clients, codecs).
//! Every [`Component`] receives `init` with the server [`Environment`] and
//! `destroy` on shutdown.
//!
//! ## Initialization modes
//!
//! - **Lazy** (default): `init` is deferred until the first successful
//!   [`ComponentRegistry::lookup`]. Concurrent first lookups from any number of
//!   coroutines or threads trigger exactly one `init` call; every caller that
//!   waited on that call observes its result.
//! - **Eager** (`no_lazy`): `init` runs during [`ComponentRegistry::add`] and a
//!   failure is returned to the caller. Use this for subsystems that must fail
//!   fast at startup.
//!
//! A failed lazy `init` is not permanent: the next lookup that arrives after
//! the failed attempt has finished retries it.
//!
//! ## Managed components
//!
//! [`ComponentRegistry::manage`] keeps an ordered list of anonymous components
//! (typically filters shared by many routes) that are initialized at server
//! start and destroyed at shutdown, without name-based lookup.
//!
//! ## Locking
//!
//! The map is guarded by a reader/writer lock that is never held while user
//! code runs. Each entry carries its own state machine
//! (`Registered → Initializing → Ready | Failed`) behind a mutex + condvar,
//! with a lock-free `ready` flag for the steady-state fast path.
//!
//! [`Environment`]: crate::server::Environment

mod core;

pub use core::{AsAny, Component, ComponentRegistry, ComponentState};
