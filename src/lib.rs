//! # brrtserver
//!
//! **brrtserver** is a coroutine-powered HTTP server core for Rust, built on the `may` runtime.
//! It owns the parts of a web service that sit between the socket and your business logic:
//! a component registry with lazy initialization, filter chains, pooled per-request state,
//! protocol upgrades and a graceful-shutdown drain.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//!
//! - **[`server`]** - The [`Server`](server::Server) aggregate, dispatch core, HTTP/1.1 transport,
//!   connection tracker and websocket handshake
//! - **[`registry`]** - Named, lifecycle-managed components with lazy or eager `init`
//! - **[`router`]** - The [`RouteResolver`](router::RouteResolver) contract and a radix-tree router
//! - **[`filter`]** - Filter chain composition plus tracing and metrics filters
//! - **[`resource`]** - Body codecs and content negotiation
//! - **[`config`]** - [`ServerConfig`](config::ServerConfig) from code, YAML or environment
//! - **[`logging`]** - `tracing` subscriber setup and the server [`Logger`](logging::Logger)
//!
//! ### Request Handling Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Transport as Transport<br/>(may coroutine)
//!     participant Tracker as ConnectionTracker
//!     participant Core as Dispatch Core
//!     participant Router as RouteResolver
//!     participant Pool as Env Pool
//!     participant Chain as FilterChain
//!     participant Handler
//!
//!     Client->>Transport: GET /users/42/
//!     Transport->>Tracker: Active
//!     Transport->>Core: dispatch(incoming)
//!     Core->>Core: normalize path (/users/42)
//!
//!     alt Upgrade request
//!         Core->>Router: resolve_upgrade(path)
//!         Core->>Core: handshake, hijack stream
//!         Core->>Tracker: Hijacked (leaves drain)
//!     else Ordinary request
//!         Core->>Router: resolve(path)
//!         Router-->>Core: handlers, vars, route filters
//!         Core->>Pool: acquire Request/Response
//!         Core->>Chain: root filters → route filters → terminal
//!         Chain->>Handler: handle(req, resp)
//!         Core-->>Transport: write response
//!         Core->>Pool: release
//!         Transport->>Tracker: Idle
//!     end
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use brrtserver::config::ServerConfig;
//! use brrtserver::handler::handler_fn;
//! use brrtserver::router::Router;
//! use brrtserver::server::Server;
//!
//! let mut router = Router::new();
//! router.get("/hello/{name}", handler_fn(|req, resp| {
//!     let name = req.var("name").unwrap_or("world").to_string();
//!     resp.write_str(&format!("hello {name}"));
//! }));
//!
//! let server = Server::builder().router(router).build();
//! let handle = server.start(ServerConfig::default())?;
//! handle.join();
//! ```
//!
//! ## Graceful Shutdown
//!
//! [`Server::destroy`](server::Server::destroy) runs once: it stops accepting, closes idle
//! keep-alive connections, waits for in-flight requests (never for upgraded connections), then
//! destroys root filters, routes, named components and managed components.

pub mod attrs;
pub mod config;
pub mod error;
pub mod filter;
pub mod handler;
pub mod ids;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod resource;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use error::{CodecError, ComponentError, ServerError, UpgradeError};
pub use handler::{handler_fn, task_fn, upgrade_fn, Handler, TaskHandler, UpgradeHandler};
pub use registry::{Component, ComponentState};
pub use server::{Environment, Request, Response, Server, ServerHandle};
