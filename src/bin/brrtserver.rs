//! Demo service: a handful of routes exercising filters, components,
//! tasks and websocket upgrades, with graceful shutdown on SIGINT/SIGTERM.

use anyhow::Context;
use brrtserver::config::ServerConfig;
use brrtserver::filter::{MetricsFilter, RootFilterList, TracingFilter};
use brrtserver::handler::{handler_fn, task_fn, upgrade_fn};
use brrtserver::logging::{init_logging_with_config, LogConfig};
use brrtserver::registry::{Component, ComponentState};
use brrtserver::router::Router;
use brrtserver::server::{Environment, Request, Response, Server};
use clap::Parser;
use http::StatusCode;
use serde_json::json;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// brrtserver demo service
#[derive(Parser)]
#[command(name = "brrtserver", version, about = "brrtserver demo service", long_about = None)]
struct Cli {
    /// YAML config file; BRRTS_* environment variables override it
    #[arg(short, long, env = "BRRTS_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Number of may worker threads
    #[arg(long)]
    workers: Option<usize>,
}

/// Visit counter, initialized on first lookup.
#[derive(Default)]
struct VisitCounter {
    visits: AtomicU64,
}

impl Component for VisitCounter {
    fn init(&self, env: &dyn Environment) -> anyhow::Result<()> {
        env.logger().in_scope(|| info!("Visit counter ready"));
        Ok(())
    }
}

fn health(_req: &mut Request, resp: &mut Response) {
    if let Err(err) = resp.send(&json!({ "status": "ok" })) {
        warn!(error = %err, "Failed to encode health response");
        resp.report_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
}

fn echo(req: &mut Request, resp: &mut Response) {
    let body = json!({
        "name": req.var("name"),
        "query": req.query_params(),
    });
    if let Err(err) = resp.send(&body) {
        warn!(error = %err, "Failed to encode echo response");
        resp.report_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
}

fn visits(req: &mut Request, resp: &mut Response) {
    let counter = match req.env().map(|env| env.server().lookup_as::<VisitCounter>("visits")) {
        Some(Ok(counter)) => counter,
        Some(Err(err)) => {
            warn!(error = %err, "Visit counter unavailable");
            resp.report_status(StatusCode::SERVICE_UNAVAILABLE);
            return;
        }
        None => {
            resp.report_not_found();
            return;
        }
    };
    let visits = counter.visits.fetch_add(1, Ordering::Relaxed) + 1;
    if let Some(env) = req.env() {
        env.start_task("/tasks/announce", Box::new(visits));
    }
    if let Err(err) = resp.send(&json!({ "visits": visits })) {
        warn!(error = %err, "Failed to encode visits response");
    }
}

fn build_server() -> Arc<Server> {
    let metrics = Arc::new(MetricsFilter::new());

    let mut root = RootFilterList::new();
    root.add(TracingFilter::new()).add_arc(Arc::clone(&metrics) as _);

    let mut router = Router::new();
    router
        .get("/health", handler_fn(health))
        .get("/echo/{name}", handler_fn(echo))
        .get("/visits", handler_fn(visits))
        .get(
            "/metrics",
            handler_fn(move |_req, resp| {
                resp.set_content_type("text/plain; version=0.0.4");
                resp.write_str(&metrics.render_prometheus());
            }),
        )
        .task(
            "/tasks/announce",
            task_fn(|value| {
                if let Ok(visits) = value.downcast::<u64>() {
                    if *visits % 100 == 0 {
                        info!(visits = *visits, "Visit milestone");
                    }
                }
            }),
        )
        .upgrade(
            "/ws/echo",
            upgrade_fn(|mut conn| {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }),
        );

    Server::builder().router(router).root_filters(root).build()
}

#[cfg(unix)]
fn install_shutdown_handler(server: Arc<Server>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signals")?;
    std::thread::Builder::new()
        .name("brrtserver-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Shutdown signal received");
                server.destroy();
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
fn install_shutdown_handler(_server: Arc<Server>) -> anyhow::Result<()> {
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging_with_config(&LogConfig::from_env())?;

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_yaml_file(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(workers) = cli.workers {
        may::config().set_workers(workers);
    }
    may::config().set_stack_size(config.stack_size);

    let server = build_server();
    server.add_component("visits", ComponentState::lazy(VisitCounter::default()))?;
    install_shutdown_handler(Arc::clone(&server))?;

    info!(addr = %config.listen_addr, "Starting brrtserver");
    server.serve(config)?;
    Ok(())
}
