//! # Router Module
//!
//! Route resolution for the dispatch core. The server only depends on the
//! [`RouteResolver`] trait; [`Router`] is the default segment radix tree.
//!
//! ## Route spaces
//!
//! A single pattern can carry three independent targets:
//!
//! - a handler-by-method table for ordinary requests,
//! - an upgrade handler for websocket handshakes,
//! - a task handler for [`Environment::start_task`](crate::server::Environment::start_task).
//!
//! Filters attached to a pattern apply to every ordinary route at or below it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use brrtserver::handler::handler_fn;
//! use brrtserver::router::Router;
//!
//! let mut router = Router::new();
//! router
//!     .get("/users/{id}", handler_fn(|req, resp| {
//!         let id = req.var("id").unwrap_or_default().to_string();
//!         resp.write_str(&id);
//!     }))
//!     .filter("/users", brrtserver::filter::TracingFilter::new());
//! ```

mod core;
mod radix;

pub use core::{FilterSet, PathVars, RouteResolver, MAX_INLINE_VARS};
pub use radix::Router;
