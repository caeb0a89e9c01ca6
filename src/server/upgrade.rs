//! Protocol-upgrade (websocket) handshake.
//!
//! Only the opening handshake lives here. Once it succeeds the connection is
//! handed to the route's [`UpgradeHandler`](crate::handler::UpgradeHandler) as
//! a raw byte stream; frame encoding is the handler's business.

use super::writer::{ResponseWriter, Stream};
use super::{Environment, Incoming};
use crate::error::UpgradeError;
use crate::router::PathVars;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::header::{CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{HeaderMap, Method, Version};
use sha1::{Digest, Sha1};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Custom validation run on handshake headers; an error rejects the upgrade.
#[derive(Clone)]
pub struct HeaderChecker(Arc<dyn Fn(&HeaderMap) -> anyhow::Result<()> + Send + Sync>);

impl HeaderChecker {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&HeaderMap) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(check))
    }

    /// # Errors
    ///
    /// Whatever the wrapped check returns.
    pub fn check(&self, headers: &HeaderMap) -> anyhow::Result<()> {
        (self.0)(headers)
    }
}

impl fmt::Debug for HeaderChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HeaderChecker(..)")
    }
}

fn header_has_token(headers: &HeaderMap, name: http::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|v| {
        v.to_str()
            .unwrap_or_default()
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

/// Whether the request asks to switch to the websocket protocol.
#[must_use]
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    header_has_token(headers, CONNECTION, "upgrade")
        && header_has_token(headers, UPGRADE, "websocket")
}

/// `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.trim().as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

/// Handshake collaborator.
///
/// On success the switching-protocols response has been written and the
/// caller hijacks the writer's stream. On failure nothing is guaranteed
/// about what was written; the caller closes the connection.
pub trait Handshaker: Send + Sync {
    /// # Errors
    ///
    /// Any [`UpgradeError`]; the connection must not be reused afterwards.
    fn upgrade(
        &self,
        writer: &mut ResponseWriter<'_>,
        req: &Incoming,
        checker: Option<&HeaderChecker>,
    ) -> Result<(), UpgradeError>;
}

/// RFC 6455 server handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketHandshaker;

impl Handshaker for WebSocketHandshaker {
    fn upgrade(
        &self,
        writer: &mut ResponseWriter<'_>,
        req: &Incoming,
        checker: Option<&HeaderChecker>,
    ) -> Result<(), UpgradeError> {
        if req.method != Method::GET {
            return Err(UpgradeError::NotUpgrade("method must be GET"));
        }
        if matches!(req.version, Version::HTTP_09 | Version::HTTP_10) {
            return Err(UpgradeError::NotUpgrade("HTTP/1.1 or later required"));
        }
        if !is_upgrade_request(&req.headers) {
            return Err(UpgradeError::NotUpgrade("missing upgrade headers"));
        }
        let version = req
            .headers
            .get(SEC_WEBSOCKET_VERSION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim);
        if version != Some("13") {
            return Err(UpgradeError::UnsupportedVersion);
        }
        let key = req
            .headers
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
            .filter(|k| STANDARD.decode(k.trim()).is_ok_and(|raw| raw.len() == 16))
            .ok_or(UpgradeError::MissingKey)?;
        if let Some(checker) = checker {
            checker.check(&req.headers).map_err(UpgradeError::Rejected)?;
        }

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             upgrade: websocket\r\n\
             connection: Upgrade\r\n\
             sec-websocket-accept: {}\r\n\r\n",
            accept_key(key)
        );
        writer.write_raw(response.as_bytes())?;
        Ok(())
    }
}

/// Connection handed to an upgrade handler.
///
/// Reads first drain any bytes the transport had already buffered past the
/// handshake request, then continue on the socket.
pub struct UpgradedConn<'a> {
    stream: &'a mut dyn Stream,
    pending: Vec<u8>,
    pos: usize,
    vars: &'a PathVars,
    env: &'a dyn Environment,
    path: &'a str,
}

impl<'a> UpgradedConn<'a> {
    pub fn new(
        stream: &'a mut dyn Stream,
        pending: Vec<u8>,
        vars: &'a PathVars,
        env: &'a dyn Environment,
        path: &'a str,
    ) -> Self {
        Self {
            stream,
            pending,
            pos: 0,
            vars,
            env,
            path,
        }
    }

    #[must_use]
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name)
    }

    #[must_use]
    pub fn vars(&self) -> &PathVars {
        self.vars
    }

    #[must_use]
    pub fn env(&self) -> &dyn Environment {
        self.env
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.path
    }
}

impl Read for UpgradedConn<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.pending.len() {
            let n = buf.len().min(self.pending.len() - self.pos);
            buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        self.stream.read(buf)
    }
}

impl Write for UpgradedConn<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
