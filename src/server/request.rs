use super::{Environment, Server};
use crate::error::{CodecError, ComponentError};
use crate::registry::Component;
use crate::resource::Codec;
use crate::router::PathVars;
use http::header::{CONNECTION, COOKIE};
use http::{Extensions, HeaderMap, Method, Version};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Request as parsed by the transport, before routing.
#[derive(Debug, Default)]
pub struct Incoming {
    pub method: Method,
    /// Request target: path plus optional `?query`.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
    /// Bytes read past the request; only kept for upgrade requests.
    pub pending: Vec<u8>,
}

impl Incoming {
    #[must_use]
    pub fn new(method: Method, target: &str) -> Self {
        Self {
            method,
            target: target.to_string(),
            ..Self::default()
        }
    }

    /// Append a header; invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Target without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("/")
    }

    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Whether the connection stays open after this request.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers.get_all(CONNECTION).iter().any(|v| {
                v.to_str()
                    .unwrap_or_default()
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case(token))
            })
        };
        match self.version {
            Version::HTTP_10 => has_token("keep-alive"),
            _ => !has_token("close"),
        }
    }
}

/// Extract cookies from the `Cookie` headers.
#[must_use]
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|c| c.split(';'))
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let value = parts.next().unwrap_or("").trim();
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Parse and URL-decode a query string (without the leading `?`).
#[must_use]
pub fn parse_query_params(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Request wrapper handed to filters and handlers.
///
/// Instances are pooled: the dispatch core binds one to each request and
/// clears it afterwards, so never keep references to it past the handler.
#[derive(Default)]
pub struct Request {
    method: Method,
    path: String,
    query: String,
    version: Version,
    headers: HeaderMap,
    body: Vec<u8>,
    remote_addr: Option<SocketAddr>,
    vars: PathVars,
    extensions: Extensions,
    codec: Option<Arc<dyn Codec>>,
    env: Option<Arc<Server>>,
}

impl Request {
    /// Unbound request, mainly for exercising filters and handlers directly.
    #[must_use]
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        Self {
            method,
            path: path.to_string(),
            query: query.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn bind(
        &mut self,
        env: Arc<Server>,
        codec: Arc<dyn Codec>,
        incoming: Incoming,
        path: String,
        vars: PathVars,
    ) {
        self.query.clear();
        if let Some(q) = incoming.query() {
            self.query.push_str(q);
        }
        self.method = incoming.method;
        self.path = path;
        self.version = incoming.version;
        self.headers = incoming.headers;
        self.body = incoming.body;
        self.remote_addr = incoming.remote_addr;
        self.vars = vars;
        self.codec = Some(codec);
        self.env = Some(env);
    }

    /// Hand the path-variable buffer back to its pool.
    pub(crate) fn take_vars(&mut self) -> PathVars {
        std::mem::take(&mut self.vars)
    }

    pub(crate) fn reset(&mut self) {
        self.method = Method::GET;
        self.path.clear();
        self.query.clear();
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.body.clear();
        self.remote_addr = None;
        self.vars.truncate(0);
        self.extensions.clear();
        self.codec = None;
        self.env = None;
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Normalized path (no trailing slash except for `/`).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[must_use]
    pub fn cookies(&self) -> HashMap<String, String> {
        parse_cookies(&self.headers)
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies().remove(name)
    }

    /// Raw query string, empty when absent.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query_params(&self.query)
    }

    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        url::form_urlencoded::parse(self.query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Path variable extracted by the router.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name)
    }

    #[must_use]
    pub fn vars(&self) -> &PathVars {
        &self.vars
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body with the negotiated codec (JSON when unbound).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the body is malformed or does not
    /// match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let value = match &self.codec {
            Some(codec) => codec.decode(&self.body)?,
            None => crate::resource::JsonCodec.decode(&self.body)?,
        };
        serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
    }

    #[must_use]
    pub fn codec(&self) -> Option<&Arc<dyn Codec>> {
        self.codec.as_ref()
    }

    /// Request-scoped values shared between filters and handlers.
    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The serving environment; `None` for unbound requests.
    #[must_use]
    pub fn env(&self) -> Option<&dyn Environment> {
        self.env.as_deref().map(|s| s as &dyn Environment)
    }

    /// Shorthand for `env().component(name)`.
    ///
    /// # Errors
    ///
    /// As [`Environment::component`]; unbound requests report `NotFound`.
    pub fn component(&self, name: &str) -> Result<Arc<dyn Component>, ComponentError> {
        match self.env() {
            Some(env) => env.component(name),
            None => Err(ComponentError::NotFound(name.to_string())),
        }
    }
}
