//! # Server Module
//!
//! The aggregate root and everything between the socket and the filter chain.
//!
//! ## Request flow
//!
//! 1. [`transport`] accepts a connection on a `may` coroutine, parses requests
//!    with `httparse` and reports connection states to the
//!    [`ConnectionTracker`].
//! 2. The dispatch core normalizes the path and either runs the upgrade path
//!    (handshake, then hand the raw stream to an [`UpgradeHandler`]) or
//!    resolves the route, binds pooled [`Request`]/[`Response`] objects and
//!    runs the composed [`FilterChain`].
//! 3. The buffered response is serialized by the [`ResponseWriter`].
//!
//! ## Lifecycle
//!
//! A [`Server`] is configured once, started once and destroyed at most once.
//! [`Server::destroy`] stops accepting, waits for in-flight requests (never
//! for upgraded connections), then tears down filters, routes and components.
//!
//! [`UpgradeHandler`]: crate::handler::UpgradeHandler
//! [`FilterChain`]: crate::filter::FilterChain

mod core;
mod dispatch;
mod environment;
mod http_server;
mod request;
mod response;
mod tracker;
pub(crate) mod transport;
mod upgrade;
mod writer;

pub use self::core::{Server, ServerBuilder};
pub use dispatch::normalize_path;
pub use environment::Environment;
pub use http_server::ServerHandle;
pub use request::{parse_cookies, parse_query_params, Incoming, Request};
pub use response::Response;
pub use tracker::{ConnState, ConnectionTracker, TrackedConn};
pub use upgrade::{
    accept_key, is_upgrade_request, HeaderChecker, Handshaker, UpgradedConn, WebSocketHandshaker,
};
pub use writer::{ResponseWriter, Stream};
