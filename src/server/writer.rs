use super::Response;
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::StatusCode;
use std::io::{self, Read, Write};

/// Byte stream a connection is served over (plain TCP, TLS, or a test double).
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

fn status_reason(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}

fn has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// HTTP/1.1 response serializer bound to one connection for one request.
///
/// The upgrade path takes the underlying stream over with [`hijack`]; after
/// that the transport no longer writes to, reuses or tracks the connection.
///
/// [`hijack`]: ResponseWriter::hijack
pub struct ResponseWriter<'a> {
    stream: &'a mut dyn Stream,
    keep_alive: bool,
    hijacked: bool,
    on_hijack: Option<&'a (dyn Fn() + 'a)>,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(stream: &'a mut dyn Stream, keep_alive: bool) -> Self {
        Self {
            stream,
            keep_alive,
            hijacked: false,
            on_hijack: None,
        }
    }

    /// Run `hook` once when the stream is hijacked.
    #[must_use]
    pub fn on_hijack(mut self, hook: &'a (dyn Fn() + 'a)) -> Self {
        self.on_hijack = Some(hook);
        self
    }

    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    #[must_use]
    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Serialize `resp`. With `head_only` the body is counted but not sent.
    ///
    /// # Errors
    ///
    /// I/O errors from the underlying stream.
    pub fn write_response(&mut self, resp: &Response, head_only: bool) -> io::Result<()> {
        let status = resp.status();
        let mut head = Vec::with_capacity(256);
        write!(head, "HTTP/1.1 {} {}\r\n", status.as_u16(), status_reason(status))?;
        for (name, value) in resp.headers() {
            if *name == CONTENT_LENGTH || *name == CONNECTION {
                continue;
            }
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        let with_body = has_body(status);
        if with_body {
            write!(head, "content-length: {}\r\n", resp.body().len())?;
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        write!(head, "connection: {connection}\r\n\r\n")?;

        self.stream.write_all(&head)?;
        if with_body && !head_only {
            self.stream.write_all(resp.body())?;
        }
        self.stream.flush()
    }

    /// Write a bodiless response with only `status`.
    ///
    /// # Errors
    ///
    /// I/O errors from the underlying stream.
    pub fn write_status(&mut self, status: StatusCode) -> io::Result<()> {
        let mut resp = Response::new();
        resp.set_status(status);
        self.write_response(&resp, false)
    }

    /// Write bytes verbatim (handshake responses).
    ///
    /// # Errors
    ///
    /// I/O errors from the underlying stream.
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    /// Take the connection over. The transport stops serving it once the
    /// current dispatch returns.
    pub fn hijack(&mut self) -> &mut dyn Stream {
        if !self.hijacked {
            self.hijacked = true;
            self.keep_alive = false;
            if let Some(hook) = self.on_hijack {
                hook();
            }
        }
        &mut *self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Cursor;

    fn written(out: Cursor<Vec<u8>>) -> String {
        String::from_utf8(out.into_inner()).unwrap()
    }

    #[test]
    fn test_write_response() {
        let mut out = Cursor::new(Vec::new());
        let mut resp = Response::new();
        resp.set_status(StatusCode::CREATED);
        resp.set_content_type("text/plain");
        resp.write_str("hello");
        ResponseWriter::new(&mut out, true)
            .write_response(&resp, false)
            .unwrap();

        let text = written(out);
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_head_and_no_content() {
        let mut out = Cursor::new(Vec::new());
        let mut resp = Response::new();
        resp.write_str("hello");
        ResponseWriter::new(&mut out, false)
            .write_response(&resp, true)
            .unwrap();
        let text = written(out);
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("connection: close\r\n\r\n"));

        let mut out = Cursor::new(Vec::new());
        ResponseWriter::new(&mut out, true)
            .write_status(StatusCode::NO_CONTENT)
            .unwrap();
        assert!(!written(out).contains("content-length"));
    }

    #[test]
    fn test_hijack_runs_hook_once() {
        let calls = Cell::new(0);
        let hook = || calls.set(calls.get() + 1);
        let mut out = Cursor::new(Vec::new());
        let mut writer = ResponseWriter::new(&mut out, true).on_hijack(&hook);
        writer.hijack().write_all(b"raw").unwrap();
        writer.hijack();
        assert!(writer.is_hijacked());
        assert!(!writer.keep_alive());
        assert_eq!(calls.get(), 1);
    }
}
