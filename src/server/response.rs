use crate::error::CodecError;
use crate::resource::{Codec, JsonCodec};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Buffered response handed to filters and handlers.
///
/// Nothing reaches the wire until the chain returns; the dispatch core then
/// serializes status, headers and body in one write.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    codec: Option<Arc<dyn Codec>>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            codec: None,
        }
    }
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&mut self, codec: Arc<dyn Codec>) {
        self.codec = Some(codec);
    }

    pub(crate) fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.body.clear();
        self.codec = None;
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
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

    /// Set (replace) a header. Invalid names or values are dropped.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => debug!(header = name, "Dropping invalid response header"),
        }
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header(CONTENT_TYPE.as_str(), content_type);
    }

    /// Append raw bytes to the body.
    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Encode `value` with the negotiated codec (JSON when unbound) and
    /// append it to the body. Sets the codec's content type when none is set.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if `value` cannot be serialized.
    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let value = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        let bytes = match &self.codec {
            Some(codec) => codec.encode(&value)?,
            None => JsonCodec.encode(&value)?,
        };
        if self.content_type().is_none() {
            let content_type = self
                .codec
                .as_ref()
                .map_or("application/json", |c| c.content_type())
                .to_string();
            self.set_content_type(&content_type);
        }
        self.body.extend_from_slice(&bytes);
        Ok(())
    }

    /// Set `status` as the outcome of the request.
    pub fn report_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn report_not_found(&mut self) {
        self.report_status(StatusCode::NOT_FOUND);
    }

    pub fn report_method_not_allowed(&mut self) {
        self.report_status(StatusCode::METHOD_NOT_ALLOWED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_sets_content_type_once() {
        let mut resp = Response::new();
        resp.send(&json!({"ok": true})).unwrap();
        assert_eq!(resp.content_type(), Some("application/json"));
        assert_eq!(resp.body(), br#"{"ok":true}"#);

        let mut resp = Response::new();
        resp.set_content_type("application/json; charset=utf-8");
        resp.send(&[1, 2]).unwrap();
        assert_eq!(resp.content_type(), Some("application/json; charset=utf-8"));
    }

    #[test]
    fn test_invalid_header_is_dropped() {
        let mut resp = Response::new();
        resp.set_header("bad header", "x");
        resp.set_header("x-ok", "line\nbreak");
        assert!(resp.headers().is_empty());
    }

    #[test]
    fn test_reset() {
        let mut resp = Response::new();
        resp.report_not_found();
        resp.write_str("gone");
        resp.set_header("x-a", "1");
        resp.reset();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.body().is_empty());
        assert!(resp.headers().is_empty());
    }
}
