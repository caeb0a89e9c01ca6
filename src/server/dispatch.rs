//! Per-request dispatch: normalize, branch on upgrade, resolve, run the chain.

use super::core::{Runtime, Server};
use super::environment::Environment;
use super::upgrade::{is_upgrade_request, UpgradedConn};
use super::writer::ResponseWriter;
use super::{Incoming, Request, Response};
use crate::filter::{FilterChain, Terminal};
use crate::logging::Logger;
use crate::pool::Recycle;
use http::{Method, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Strip exactly one trailing slash, except from the root path.
#[must_use]
pub fn normalize_path(path: &str) -> &str {
    match path {
        "" => "/",
        "/" => path,
        _ => path.strip_suffix('/').unwrap_or(path),
    }
}

/// Pooled request/response pair, exclusive to one dispatch call.
#[derive(Default)]
pub(crate) struct RequestEnv {
    pub(crate) req: Request,
    pub(crate) resp: Response,
}

impl Recycle for RequestEnv {
    fn recycle(&mut self) {
        self.req.reset();
        self.resp.reset();
    }
}

fn write_status(writer: &mut ResponseWriter<'_>, status: StatusCode, logger: &Logger) {
    if let Err(err) = writer.write_status(status) {
        logger.in_scope(|| {
            debug!(status = status.as_u16(), error = %err, "Failed to write status");
        });
        writer.set_keep_alive(false);
    }
}

impl Server {
    /// Serve one parsed request, writing the outcome to `writer`.
    ///
    /// Panics raised by filters or handlers are not caught here.
    pub fn dispatch(self: &Arc<Self>, incoming: Incoming, writer: &mut ResponseWriter<'_>) {
        let Some(rt) = self.runtime() else {
            writer.set_keep_alive(false);
            write_status(writer, StatusCode::SERVICE_UNAVAILABLE, self.logger());
            return;
        };
        let path = normalize_path(incoming.path()).to_string();

        if is_upgrade_request(&incoming.headers) {
            self.serve_upgrade(rt, incoming, &path, writer);
            return;
        }

        let mut vars = rt.vars.acquire();
        let mut filters = rt.filters.acquire();
        let handlers = self.router().resolve(&path, &mut vars, &mut filters);

        let mut env = rt.envs.acquire();
        let codec = self.resources().negotiate(&incoming.headers);
        let method = incoming.method.clone();
        env.resp.bind(Arc::clone(&codec));
        if let Some(content_type) = &rt.content_type {
            env.resp.set_content_type(content_type);
        }
        env.req.bind(Arc::clone(self), codec, incoming, path, vars);

        let terminal = match handlers.as_deref() {
            Some(table) => match table.get(&method) {
                Some(handler) => Terminal::Handler(&**handler),
                None => Terminal::MethodNotAllowed,
            },
            None => Terminal::NotFound,
        };
        let root = self.root_filters().filters(env.req.path());
        let RequestEnv { req, resp } = &mut env;
        FilterChain::new(root, &filters, terminal).proceed(req, resp);

        if let Err(err) = writer.write_response(&env.resp, method == Method::HEAD) {
            rt.logger.in_scope(|| debug!(error = %err, "Failed to write response"));
            writer.set_keep_alive(false);
        }

        rt.vars.release(env.req.take_vars());
        rt.envs.release(env);
        rt.filters.release(filters);
    }

    /// Upgrade route space: no filters, the handler owns the connection.
    fn serve_upgrade(
        self: &Arc<Self>,
        rt: &Runtime,
        incoming: Incoming,
        path: &str,
        writer: &mut ResponseWriter<'_>,
    ) {
        let mut vars = rt.vars.acquire();
        let Some(handler) = self.router().resolve_upgrade(path, &mut vars) else {
            rt.vars.release(vars);
            write_status(writer, StatusCode::NOT_FOUND, &rt.logger);
            return;
        };

        match self
            .handshaker()
            .upgrade(writer, &incoming, rt.checker.as_ref())
        {
            Ok(()) => {
                rt.logger.in_scope(|| debug!(path, "Connection upgraded"));
                let conn = UpgradedConn::new(writer.hijack(), incoming.pending, &vars, &**self, path);
                handler.handle(conn);
            }
            Err(err) => {
                rt.logger
                    .in_scope(|| debug!(path, error = %err, "Upgrade handshake failed"));
                writer.set_keep_alive(false);
                write_status(writer, StatusCode::BAD_REQUEST, &rt.logger);
            }
        }
        rt.vars.release(vars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, CONTENT_TYPE_DISABLE};
    use crate::filter::{filter_fn, RootFilterList};
    use crate::handler::{handler_fn, upgrade_fn};
    use crate::router::Router;
    use std::io::{Cursor, Read, Write};

    fn run(server: &Arc<Server>, incoming: Incoming) -> String {
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = ResponseWriter::new(&mut out, true);
            server.dispatch(incoming, &mut writer);
        }
        String::from_utf8(out.into_inner()).unwrap()
    }

    fn server_with(router: Router, root: RootFilterList, config: ServerConfig) -> Arc<Server> {
        let server = Server::builder().router(router).root_filters(root).build();
        server.configure(config).unwrap();
        server
    }

    fn demo_router() -> Router {
        let mut router = Router::new();
        router.get(
            "/users/{id}",
            handler_fn(|req, resp| {
                let id = req.var("id").unwrap_or_default().to_string();
                resp.write_str(&id);
            }),
        );
        router
    }

    fn tagging_root() -> RootFilterList {
        let mut root = RootFilterList::new();
        root.add(filter_fn(|req, resp, chain| {
            chain.proceed(req, resp);
            resp.set_header("x-global", "seen");
        }));
        root
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/a/"), "/a");
        assert_eq!(normalize_path("/a//"), "/a/");
        assert_eq!(normalize_path("/a"), "/a");
    }

    #[test]
    fn test_route_match_with_trailing_slash() {
        let server = server_with(demo_router(), tagging_root(), ServerConfig::default());
        let out = run(&server, Incoming::new(Method::GET, "/users/42/?x=1"));
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("content-type: application/json; charset=utf-8\r\n"));
        assert!(out.contains("x-global: seen\r\n"));
        assert!(out.ends_with("\r\n\r\n42"));
    }

    #[test]
    fn test_global_filters_wrap_404_and_405() {
        let server = server_with(demo_router(), tagging_root(), ServerConfig::default());

        let out = run(&server, Incoming::new(Method::DELETE, "/users/42"));
        assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(out.contains("x-global: seen\r\n"));

        let out = run(&server, Incoming::new(Method::GET, "/nowhere"));
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.contains("x-global: seen\r\n"));
    }

    #[test]
    fn test_head_uses_get_without_body() {
        let server = server_with(demo_router(), RootFilterList::new(), ServerConfig::default());
        let out = run(&server, Incoming::new(Method::HEAD, "/users/7"));
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("content-length: 1\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_content_type_sentinel() {
        let config = ServerConfig {
            content_type: CONTENT_TYPE_DISABLE.to_string(),
            ..ServerConfig::default()
        };
        let server = server_with(demo_router(), RootFilterList::new(), config);
        let out = run(&server, Incoming::new(Method::GET, "/users/1"));
        assert!(!out.contains("content-type"));
    }

    #[test]
    fn test_env_is_reset_between_requests() {
        let mut router = Router::new();
        router.get(
            "/pooled",
            handler_fn(|req, resp| {
                let seen = req.extensions().get::<u32>().is_some() || req.var("id").is_some();
                req.extensions_mut().insert(7u32);
                resp.set_header("x-leak", if seen { "yes" } else { "no" });
            }),
        );
        router.get("/users/{id}", handler_fn(|_, _| {}));
        let server = server_with(router, RootFilterList::new(), ServerConfig::default());

        run(&server, Incoming::new(Method::GET, "/users/9"));
        run(&server, Incoming::new(Method::GET, "/pooled"));
        let out = run(&server, Incoming::new(Method::GET, "/pooled"));
        assert!(out.contains("x-leak: no\r\n"));

        let rt = server.runtime().unwrap();
        assert_eq!(rt.envs.created(), 1);
        assert_eq!(rt.envs.idle(), 1);
        assert_eq!(rt.vars.idle(), 1);
        assert_eq!(rt.filters.idle(), 1);
    }

    #[test]
    fn test_unconfigured_server_is_unavailable() {
        let out = run(&Server::new(), Incoming::new(Method::GET, "/"));
        assert!(out.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(out.contains("connection: close\r\n"));
    }

    fn ws_request(path: &str) -> Incoming {
        Incoming::new(Method::GET, path)
            .with_header("connection", "Upgrade")
            .with_header("upgrade", "websocket")
            .with_header("sec-websocket-version", "13")
            .with_header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[test]
    fn test_upgrade_without_handler_is_404() {
        let server = server_with(demo_router(), tagging_root(), ServerConfig::default());
        let out = run(&server, ws_request("/users/1"));
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!out.contains("x-global"), "filters never see upgrades");
    }

    #[test]
    fn test_upgrade_hands_over_connection() {
        let mut router = Router::new();
        router.upgrade(
            "/echo/{room}",
            upgrade_fn(|mut conn| {
                let mut greeting = [0u8; 2];
                conn.read_exact(&mut greeting).unwrap();
                let room = conn.var("room").unwrap_or_default().to_string();
                conn.write_all(room.as_bytes()).unwrap();
                conn.write_all(&greeting).unwrap();
            }),
        );
        let server = server_with(router, RootFilterList::new(), ServerConfig::default());

        let mut incoming = ws_request("/echo/lobby");
        incoming.pending = b"hi".to_vec();
        let mut out = Cursor::new(Vec::new());
        let hijacked = {
            let mut writer = ResponseWriter::new(&mut out, true);
            server.dispatch(incoming, &mut writer);
            writer.is_hijacked()
        };
        assert!(hijacked);
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.ends_with("\r\n\r\nlobbyhi"));
    }
}
