//! Body codecs and content negotiation.
//!
//! Codecs work on `serde_json::Value` so they stay object safe; the typed
//! helpers on [`Request`](crate::server::Request) and
//! [`Response`](crate::server::Response) convert through serde.

use crate::error::CodecError;
use crate::registry::Component;
use crate::server::Environment;
use http::header::{HeaderName, ACCEPT, CONTENT_TYPE};
use http::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A request/response body encoding.
pub trait Codec: Component {
    /// Media type written to `Content-Type`, e.g. `application/json`.
    fn content_type(&self) -> &str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Component for JsonCodec {}

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Chooses the codec bound to a request and its response.
pub trait ResourceNegotiator: Send + Sync {
    fn negotiate(&self, headers: &HeaderMap) -> Arc<dyn Codec>;

    fn init(&self, env: &dyn Environment) -> anyhow::Result<()>;

    fn destroy(&self);
}

/// Media type without parameters, lowercased.
fn essence(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Default negotiator: request `Content-Type`, then `Accept`, then the
/// default codec (JSON unless replaced).
pub struct ResourceMaster {
    codecs: Vec<(String, Arc<dyn Codec>)>,
    default: Arc<dyn Codec>,
}

impl Default for ResourceMaster {
    fn default() -> Self {
        Self {
            codecs: Vec::new(),
            default: Arc::new(JsonCodec),
        }
    }
}

impl ResourceMaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec under its own content type.
    pub fn register<C: Codec>(&mut self, codec: C) -> &mut Self {
        let codec: Arc<dyn Codec> = Arc::new(codec);
        self.codecs.push((essence(codec.content_type()), codec));
        self
    }

    /// Register `codec` and make it the fallback.
    pub fn set_default<C: Codec>(&mut self, codec: C) -> &mut Self {
        let codec: Arc<dyn Codec> = Arc::new(codec);
        self.codecs
            .push((essence(codec.content_type()), Arc::clone(&codec)));
        self.default = codec;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    fn find(&self, media_type: &str) -> Option<&Arc<dyn Codec>> {
        let wanted = essence(media_type);
        self.codecs
            .iter()
            .find(|(ct, _)| *ct == wanted)
            .map(|(_, c)| c)
    }

    fn unique(&self) -> Vec<Arc<dyn Codec>> {
        let mut out: Vec<Arc<dyn Codec>> = vec![Arc::clone(&self.default)];
        for (_, codec) in &self.codecs {
            if !out.iter().any(|c| Arc::ptr_eq(c, codec)) {
                out.push(Arc::clone(codec));
            }
        }
        out
    }
}

impl ResourceNegotiator for ResourceMaster {
    fn negotiate(&self, headers: &HeaderMap) -> Arc<dyn Codec> {
        let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        if let Some(codec) = header(CONTENT_TYPE).and_then(|ct| self.find(ct)) {
            return Arc::clone(codec);
        }
        if let Some(accept) = header(ACCEPT) {
            for range in accept.split(',') {
                if let Some(codec) = self.find(range) {
                    return Arc::clone(codec);
                }
            }
        }
        Arc::clone(&self.default)
    }

    fn init(&self, env: &dyn Environment) -> anyhow::Result<()> {
        for codec in self.unique() {
            debug!(content_type = codec.content_type(), "Init codec");
            codec.init(env)?;
        }
        Ok(())
    }

    fn destroy(&self) {
        for codec in self.unique() {
            codec.destroy();
        }
    }
}
