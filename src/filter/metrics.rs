use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::{Filter, FilterChain};
use crate::registry::Component;
use crate::server::{Request, Response};

/// Filter collecting Prometheus-compatible request metrics.
///
/// All counters are atomics updated with `Relaxed` ordering; the values are
/// eventually consistent and cheap to collect from every coroutine.
///
/// Metrics collected:
/// - Total request count
/// - Average latency across the inner layers
/// - Responses per status class (1xx..5xx)
/// - Coroutine stack size of the last request
#[derive(Default)]
pub struct MetricsFilter {
    request_count: AtomicUsize,
    total_latency_ns: AtomicU64,
    status_classes: [AtomicUsize; 5],
    stack_size: AtomicUsize,
}

impl MetricsFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of requests seen.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Mean processing time; zero before the first request.
    #[must_use]
    pub fn average_latency(&self) -> Duration {
        let count = self.request_count.load(Ordering::Relaxed) as u64;
        if count == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.total_latency_ns.load(Ordering::Relaxed) / count)
        }
    }

    /// Responses whose status is in `class` (1 for 1xx, ..., 5 for 5xx).
    #[must_use]
    pub fn status_class_count(&self, class: u16) -> usize {
        match class {
            1..=5 => self.status_classes[usize::from(class - 1)].load(Ordering::Relaxed),
            _ => 0,
        }
    }

    /// Stack size of the coroutine that served the last request.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Relaxed)
    }

    /// Render the counters in the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str("# HELP brrtserver_requests_total Total HTTP requests\n");
        out.push_str("# TYPE brrtserver_requests_total counter\n");
        out.push_str(&format!("brrtserver_requests_total {}\n", self.request_count()));
        out.push_str("# HELP brrtserver_request_latency_seconds Average request latency\n");
        out.push_str("# TYPE brrtserver_request_latency_seconds gauge\n");
        out.push_str(&format!(
            "brrtserver_request_latency_seconds {:.6}\n",
            self.average_latency().as_secs_f64()
        ));
        out.push_str("# HELP brrtserver_responses_total Responses by status class\n");
        out.push_str("# TYPE brrtserver_responses_total counter\n");
        for class in 1..=5u16 {
            out.push_str(&format!(
                "brrtserver_responses_total{{class=\"{class}xx\"}} {}\n",
                self.status_class_count(class)
            ));
        }
        out.push_str("# HELP brrtserver_coroutine_stack_bytes Coroutine stack size\n");
        out.push_str("# TYPE brrtserver_coroutine_stack_bytes gauge\n");
        out.push_str(&format!(
            "brrtserver_coroutine_stack_bytes {}\n",
            self.stack_size()
        ));
        out
    }

    fn record(&self, status: u16, latency: Duration) {
        self.total_latency_ns.fetch_add(
            u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        if let 1..=5 = status / 100 {
            self.status_classes[usize::from(status / 100 - 1)].fetch_add(1, Ordering::Relaxed);
        }
        // may exposes the configured size, not the used portion
        let size = if may::coroutine::is_coroutine() {
            may::coroutine::current().stack_size()
        } else {
            may::config().get_stack_size()
        };
        self.stack_size.store(size, Ordering::Relaxed);
    }
}

impl Component for MetricsFilter {}

impl Filter for MetricsFilter {
    fn filter(&self, req: &mut Request, resp: &mut Response, chain: FilterChain<'_>) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        chain.proceed(req, resp);
        self.record(resp.status().as_u16(), start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Terminal;
    use crate::handler::handler_fn;
    use http::{Method, StatusCode};
    use std::sync::Arc;

    #[test]
    fn test_counts_by_status_class() {
        let metrics = Arc::new(MetricsFilter::new());
        let root: Vec<Arc<dyn Filter>> = vec![metrics.clone()];
        let ok = handler_fn(|_, resp| resp.set_status(StatusCode::OK));

        for _ in 0..3 {
            let mut req = Request::new(Method::GET, "/a");
            let mut resp = Response::default();
            FilterChain::new(&root, &[], Terminal::Handler(&ok)).proceed(&mut req, &mut resp);
        }
        let mut req = Request::new(Method::GET, "/missing");
        let mut resp = Response::default();
        FilterChain::new(&root, &[], Terminal::NotFound).proceed(&mut req, &mut resp);

        assert_eq!(metrics.request_count(), 4);
        assert_eq!(metrics.status_class_count(2), 3);
        assert_eq!(metrics.status_class_count(4), 1);
        assert_eq!(metrics.status_class_count(9), 0);
        assert!(metrics.stack_size() > 0);
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = MetricsFilter::new();
        assert_eq!(metrics.average_latency(), Duration::ZERO);
        let text = metrics.render_prometheus();
        assert!(text.contains("brrtserver_requests_total 0"));
        assert!(text.contains("brrtserver_responses_total{class=\"5xx\"} 0"));
    }
}
