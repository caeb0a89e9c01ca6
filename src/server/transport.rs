//! HTTP/1.1 transport on `may` coroutines.
//!
//! One accept coroutine, one coroutine per connection. Requests are parsed
//! with `httparse`; only `Content-Length` bodies are accepted. Every
//! connection reports its state to the server's [`ConnectionTracker`] so
//! shutdown can refuse new work and drain in-flight requests.
//!
//! [`ConnectionTracker`]: super::ConnectionTracker

use super::core::Server;
use super::request::Incoming;
use super::tracker::{ConnState, ConnectionTracker, TrackedConn};
use super::upgrade::is_upgrade_request;
use super::writer::ResponseWriter;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::ids::ConnId;
use crate::logging::Logger;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Method, StatusCode, Version};
use may::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use rustls::{ServerConnection, StreamOwned};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// Socket handle the tracker uses to close a connection from outside its coroutine.
struct SocketHandle(Mutex<TcpStream>);

impl TrackedConn for SocketHandle {
    fn force_close(&self) {
        if let Err(err) = self.0.lock().shutdown(Shutdown::Both) {
            debug!(error = %err, "Socket shutdown failed");
        }
    }
}

/// Plain or TLS-terminated connection.
enum Connection {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.read(buf),
            Connection::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.write(buf),
            Connection::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(s) => s.flush(),
            Connection::Tls(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ReadError {
    /// Request head exceeds `max_header_bytes` or the header count limit.
    TooLarge,
    /// `Content-Length` exceeds `max_body_bytes`.
    BodyTooLarge,
    Bad(String),
    /// Chunked request bodies are not accepted.
    Unsupported,
    Io(io::Error),
}

impl ReadError {
    fn status(&self) -> Option<StatusCode> {
        match self {
            ReadError::TooLarge => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            ReadError::BodyTooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ReadError::Bad(_) => Some(StatusCode::BAD_REQUEST),
            ReadError::Unsupported => Some(StatusCode::NOT_IMPLEMENTED),
            ReadError::Io(_) => None,
        }
    }
}

/// Parse the head at the start of `buf`. `Ok(None)` means more bytes are needed.
fn parse_head(buf: &[u8], max_header_bytes: usize) -> Result<Option<(usize, Incoming)>, ReadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return if buf.len() > max_header_bytes {
                Err(ReadError::TooLarge)
            } else {
                Ok(None)
            };
        }
        Err(httparse::Error::TooManyHeaders) => return Err(ReadError::TooLarge),
        Err(err) => return Err(ReadError::Bad(err.to_string())),
    };
    if head_len > max_header_bytes {
        return Err(ReadError::TooLarge);
    }

    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| ReadError::Bad("invalid method".into()))?;
    let mut incoming = Incoming::new(method, parsed.path.unwrap_or("/"));
    incoming.version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ReadError::Bad(format!("invalid header name {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ReadError::Bad(format!("invalid value for header {name}")))?;
        incoming.headers.append(name, value);
    }
    Ok(Some((head_len, incoming)))
}

fn content_length(incoming: &Incoming) -> Result<usize, ReadError> {
    if incoming.headers.contains_key(TRANSFER_ENCODING) {
        return Err(ReadError::Unsupported);
    }
    match incoming.headers.get(CONTENT_LENGTH) {
        None => Ok(0),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ReadError::Bad("invalid content-length".into())),
    }
}

/// Read into `buf` until at least `wanted` bytes are buffered.
/// Returns `false` on a clean EOF.
fn fill(stream: &mut impl Read, buf: &mut Vec<u8>, wanted: usize) -> Result<bool, ReadError> {
    let mut chunk = [0u8; READ_CHUNK];
    while buf.len() < wanted {
        let n = stream.read(&mut chunk).map_err(ReadError::Io)?;
        if n == 0 {
            return Ok(false);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(true)
}

/// Size bounds applied while reading a request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_header_bytes: usize,
    pub(crate) max_body_bytes: usize,
}

impl Limits {
    pub(crate) fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_header_bytes: config.max_header_bytes,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Read the next request off `stream`.
///
/// `buf` carries bytes across calls (pipelined requests). `Ok(None)` is a
/// clean close between requests. For upgrade requests every byte past the
/// head is moved into [`Incoming::pending`].
pub(crate) fn read_request(
    stream: &mut impl Read,
    buf: &mut Vec<u8>,
    limits: Limits,
) -> Result<Option<Incoming>, ReadError> {
    let (head_len, mut incoming) = loop {
        if !buf.is_empty() {
            if let Some(head) = parse_head(buf, limits.max_header_bytes)? {
                break head;
            }
        }
        let had = buf.len();
        if !fill(stream, buf, had + 1)? {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ReadError::Bad("connection closed mid-request".into()))
            };
        }
    };

    if is_upgrade_request(&incoming.headers) {
        incoming.pending = buf.split_off(head_len);
        buf.clear();
        return Ok(Some(incoming));
    }

    let body_len = content_length(&incoming)?;
    if body_len > limits.max_body_bytes {
        return Err(ReadError::BodyTooLarge);
    }
    let total = head_len
        .checked_add(body_len)
        .ok_or(ReadError::BodyTooLarge)?;
    if !fill(stream, buf, total)? {
        return Err(ReadError::Bad("connection closed mid-body".into()));
    }
    incoming.body = buf[head_len..total].to_vec();
    buf.drain(..total);
    Ok(Some(incoming))
}

/// Load the TLS config: a prebuilt one wins over PEM files.
pub(crate) fn load_tls(
    config: &ServerConfig,
) -> Result<Option<Arc<rustls::ServerConfig>>, ServerError> {
    if let Some(tls) = &config.tls_config {
        return Ok(Some(Arc::clone(tls)));
    }
    let (cert_file, key_file) = match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(ServerError::Tls(
                "cert_file and key_file must be set together".into(),
            ))
        }
    };

    let certs = CertificateDer::pem_file_iter(cert_file)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ServerError::Tls(format!("{cert_file}: {e}")))?;
    let key = PrivateKeyDer::from_pem_file(key_file)
        .map_err(|e| ServerError::Tls(format!("{key_file}: {e}")))?;

    let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ServerError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| ServerError::Tls(e.to_string()))?;
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Some(Arc::new(tls)))
}

fn configure_socket(stream: &TcpStream, config: &ServerConfig, logger: &Logger) {
    if let Err(err) = stream.set_read_timeout(config.read_timeout()) {
        logger.in_scope(|| debug!(error = %err, "Failed to set read timeout"));
    }
    if let Err(err) = stream.set_write_timeout(config.write_timeout()) {
        logger.in_scope(|| debug!(error = %err, "Failed to set write timeout"));
    }
    if let Some(period) = config.keep_alive() {
        if let Err(err) = set_tcp_keepalive(stream, period) {
            logger.in_scope(|| debug!(error = %err, "Failed to enable TCP keep-alive"));
        }
    }
}

#[cfg(unix)]
fn set_tcp_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    use std::os::fd::{AsRawFd, BorrowedFd};
    // SAFETY: BorrowedFd::borrow_raw() is unsafe because the fd must stay open
    // for the borrow. `stream` owns the fd and outlives `fd`.
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    socket2::SockRef::from(&fd).set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(period))
}

#[cfg(not(unix))]
fn set_tcp_keepalive(_stream: &TcpStream, _period: Duration) -> io::Result<()> {
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Reports `Closed` to the tracker however the connection coroutine exits.
struct Untrack<'a> {
    tracker: &'a ConnectionTracker,
    id: ConnId,
    handle: &'a Arc<dyn TrackedConn>,
}

impl Drop for Untrack<'_> {
    fn drop(&mut self) {
        self.tracker.transition(self.id, self.handle, ConnState::Closed);
    }
}

/// Serve requests on one connection until it closes, is hijacked, or the
/// tracker refuses it.
fn serve_connection(server: &Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let Some(rt) = server.runtime() else {
        return;
    };
    let logger = &rt.logger;
    let id = ConnId::next();
    let handle: Arc<dyn TrackedConn> = match stream.try_clone() {
        Ok(clone) => Arc::new(SocketHandle(Mutex::new(clone))),
        Err(err) => {
            logger.in_scope(|| debug!(error = %err, "Failed to clone socket"));
            return;
        }
    };
    let tracker = server.tracker();
    let _untrack = Untrack {
        tracker,
        id,
        handle: &handle,
    };
    if !tracker.transition(id, &handle, ConnState::New) {
        refused(logger, id, ConnState::New);
        return;
    }
    configure_socket(&stream, &rt.config, logger);

    let mut conn = match &rt.tls {
        Some(tls) => match ServerConnection::new(Arc::clone(tls)) {
            Ok(session) => Connection::Tls(Box::new(StreamOwned::new(session, stream))),
            Err(err) => {
                logger.in_scope(|| warn!(conn = %id, error = %err, "TLS session setup failed"));
                return;
            }
        },
        None => Connection::Plain(stream),
    };

    let limits = Limits::from_config(&rt.config);
    let mut buf = Vec::with_capacity(READ_CHUNK);
    loop {
        let mut incoming = match read_request(&mut conn, &mut buf, limits) {
            Ok(Some(incoming)) => incoming,
            Ok(None) => break,
            Err(err) => {
                logger.in_scope(|| {
                    debug!(conn = %id, peer = %peer, error = ?err, "Failed to read request");
                });
                if let Some(status) = err.status() {
                    let mut writer = ResponseWriter::new(&mut conn, false);
                    if let Err(err) = writer.write_status(status) {
                        logger.in_scope(|| debug!(error = %err, "Failed to write error status"));
                    }
                }
                break;
            }
        };
        incoming.remote_addr = Some(peer);

        if !tracker.transition(id, &handle, ConnState::Active) {
            refused(logger, id, ConnState::Active);
            return;
        }
        let keep_alive = incoming.keep_alive();
        let on_hijack = || {
            tracker.transition(id, &handle, ConnState::Hijacked);
        };
        let mut writer = ResponseWriter::new(&mut conn, keep_alive).on_hijack(&on_hijack);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| server.dispatch(incoming, &mut writer)));
        if let Err(payload) = outcome {
            logger.in_scope(|| {
                error!(conn = %id, panic = panic_message(&*payload), "Request handler panicked");
            });
            writer.set_keep_alive(false);
            if !writer.is_hijacked() {
                if let Err(err) = writer.write_status(StatusCode::INTERNAL_SERVER_ERROR) {
                    logger.in_scope(|| debug!(error = %err, "Failed to write error status"));
                }
            }
        }
        if writer.is_hijacked() {
            logger.in_scope(|| debug!(conn = %id, "Connection hijacked"));
            return;
        }
        if !writer.keep_alive() {
            break;
        }
        if !tracker.transition(id, &handle, ConnState::Idle) {
            refused(logger, id, ConnState::Idle);
            return;
        }
    }
}

fn refused(logger: &Logger, id: ConnId, state: ConnState) {
    logger.in_scope(|| debug!(conn = %id, state = ?state, "Closing connection during shutdown"));
}

/// Accept until the coroutine is cancelled by `Server::destroy`.
pub(crate) fn accept_loop(server: &Arc<Server>, listener: &TcpListener) {
    let Some(rt) = server.runtime() else {
        return;
    };
    let stack_size = rt.config.stack_size;
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if server.is_destroyed() {
                    break;
                }
                rt.logger.in_scope(|| warn!(error = %err, "Accept failed"));
                may::coroutine::sleep(Duration::from_millis(5));
                continue;
            }
        };
        if server.is_destroyed() {
            break;
        }
        let server = Arc::clone(server);
        // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
        // This is safe because:
        // - The closure owns the stream and an Arc of the server
        // - Handler panics are caught inside serve_connection
        let spawned = unsafe {
            may::coroutine::Builder::new()
                .stack_size(stack_size)
                .spawn(move || serve_connection(&server, stream, peer))
        };
        if let Err(err) = spawned {
            rt.logger
                .in_scope(|| error!(error = %err, "Failed to spawn connection coroutine"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(raw: &[u8], max: usize) -> Vec<Result<Option<Incoming>, ReadError>> {
        read_all_with(
            raw,
            Limits {
                max_header_bytes: max,
                max_body_bytes: 1024,
            },
        )
    }

    fn read_all_with(raw: &[u8], limits: Limits) -> Vec<Result<Option<Incoming>, ReadError>> {
        let mut stream = Cursor::new(raw.to_vec());
        let mut buf = Vec::new();
        let mut out = Vec::new();
        loop {
            let next = read_request(&mut stream, &mut buf, limits);
            let stop = !matches!(next, Ok(Some(_)));
            out.push(next);
            if stop {
                return out;
            }
        }
    }

    #[test]
    fn test_pipelined_requests_with_body() {
        let raw = b"POST /items HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello\
GET /items/1?full=true HTTP/1.0\r\n\r\n";
        let results = read_all(raw, 1024);
        assert_eq!(results.len(), 3);

        let first = results[0].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(first.method, Method::POST);
        assert_eq!(first.body, b"hello");
        assert_eq!(first.version, Version::HTTP_11);

        let second = results[1].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(second.path(), "/items/1");
        assert_eq!(second.query(), Some("full=true"));
        assert_eq!(second.version, Version::HTTP_10);
        assert!(!second.keep_alive());

        assert!(matches!(results[2], Ok(None)));
    }

    #[test]
    fn test_header_limit() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(200));
        let results = read_all(raw.as_bytes(), 64);
        assert!(matches!(results[0], Err(ReadError::TooLarge)));
        assert_eq!(
            results[0].as_ref().err().and_then(ReadError::status),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
    }

    #[test]
    fn test_rejects_chunked_and_garbage() {
        let chunked = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n";
        assert!(matches!(read_all(chunked, 1024)[0], Err(ReadError::Unsupported)));

        let garbage = b"\x00\x01 nonsense\r\n\r\n";
        assert!(matches!(read_all(garbage, 1024)[0], Err(ReadError::Bad(_))));

        let truncated = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(read_all(truncated, 1024)[0], Err(ReadError::Bad(_))));
    }

    #[test]
    fn test_content_length_near_usize_max_is_413() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        let unbounded = Limits {
            max_header_bytes: 1024,
            max_body_bytes: usize::MAX,
        };
        for results in [read_all(raw, 1024), read_all_with(raw, unbounded)] {
            assert!(matches!(results[0], Err(ReadError::BodyTooLarge)));
            assert_eq!(
                results[0].as_ref().err().and_then(ReadError::status),
                Some(StatusCode::PAYLOAD_TOO_LARGE)
            );
        }
    }

    #[test]
    fn test_body_limit() {
        let limits = Limits {
            max_header_bytes: 1024,
            max_body_bytes: 4,
        };
        let at_limit = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd";
        let results = read_all_with(at_limit, limits);
        assert_eq!(results[0].as_ref().unwrap().as_ref().unwrap().body, b"abcd");

        let over = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        assert!(matches!(read_all_with(over, limits)[0], Err(ReadError::BodyTooLarge)));
    }

    #[test]
    fn test_upgrade_keeps_trailing_bytes() {
        let raw = b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n\x81\x02hi";
        let results = read_all(raw, 1024);
        let incoming = results[0].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(incoming.pending, b"\x81\x02hi");
    }

    #[test]
    fn test_tls_requires_both_files() {
        let config = ServerConfig {
            cert_file: Some("cert.pem".into()),
            ..ServerConfig::default()
        };
        assert!(matches!(load_tls(&config), Err(ServerError::Tls(_))));
        assert!(load_tls(&ServerConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_tls_missing_files() {
        let config = ServerConfig {
            cert_file: Some("/nonexistent/cert.pem".into()),
            key_file: Some("/nonexistent/key.pem".into()),
            ..ServerConfig::default()
        };
        assert!(matches!(load_tls(&config), Err(ServerError::Tls(_))));
    }
}
