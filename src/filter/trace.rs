use std::time::Instant;

use tracing::{info, info_span};

use super::{Filter, FilterChain};
use crate::ids::RequestId;
use crate::registry::Component;
use crate::server::{Request, Response};

/// Header carrying the request id in and out.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Tags each request with a ULID id and logs its completion.
///
/// The id is taken from an incoming `x-request-id` when it parses, echoed
/// back on the response and stored in the request extensions for inner
/// layers. The completion event goes through the server's logger inside a
/// `request` span; nothing stays entered while the chain runs, since the
/// handler may block and resume on another thread.
#[derive(Debug, Default)]
pub struct TracingFilter;

impl TracingFilter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Component for TracingFilter {}

impl Filter for TracingFilter {
    fn filter(&self, req: &mut Request, resp: &mut Response, chain: FilterChain<'_>) {
        let request_id = RequestId::from_header(req.header(REQUEST_ID_HEADER));
        req.extensions_mut().insert(request_id);
        resp.set_header(REQUEST_ID_HEADER, &request_id.to_string());

        let start = Instant::now();
        chain.proceed(req, resp);
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let status = resp.status().as_u16();

        let complete = || {
            info_span!(
                "request",
                request_id = %request_id,
                method = %req.method(),
                path = %req.path(),
            )
            .in_scope(|| info!(status, latency_ms, "Request complete"));
        };
        match req.env() {
            Some(env) => env.logger().in_scope(complete),
            None => complete(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::filter::Terminal;
    use http::Method;
    use std::sync::Arc;

    #[test]
    fn test_request_id_propagation() {
        let incoming_id = RequestId::generate().to_string();
        let mut req = Request::new(Method::GET, "/users");
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, incoming_id.parse().unwrap());
        let mut resp = Response::default();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_in = Arc::clone(&seen);
        let handler = handler_fn(move |req, _| {
            *seen_in.lock() = req.extensions().get::<RequestId>().copied();
        });
        let root: Vec<Arc<dyn Filter>> = vec![Arc::new(TracingFilter::new())];
        FilterChain::new(&root, &[], Terminal::Handler(&handler)).proceed(&mut req, &mut resp);

        assert_eq!(resp.header(REQUEST_ID_HEADER), Some(incoming_id.as_str()));
        assert_eq!(seen.lock().map(|id| id.to_string()), Some(incoming_id));
    }

    #[test]
    fn test_generates_id_when_missing() {
        let mut req = Request::new(Method::GET, "/");
        let mut resp = Response::default();
        let root: Vec<Arc<dyn Filter>> = vec![Arc::new(TracingFilter::new())];
        FilterChain::new(&root, &[], Terminal::NotFound).proceed(&mut req, &mut resp);

        let id = resp.header(REQUEST_ID_HEADER).unwrap();
        assert!(id.parse::<RequestId>().is_ok());
        assert_eq!(resp.status(), http::StatusCode::NOT_FOUND);
    }
}
