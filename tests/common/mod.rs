#![allow(dead_code)]

pub mod test_server {
    use brrtserver::config::ServerConfig;
    use brrtserver::server::{Server, ServerHandle};
    use std::sync::{Arc, Once};

    /// Ensures May coroutines are configured only once
    static MAY_INIT: Once = Once::new();

    pub fn setup_may_runtime() {
        MAY_INIT.call_once(|| {
            may::config().set_stack_size(0x8000);
        });
    }

    /// Loopback config on an ephemeral port.
    pub fn local_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            stack_size: 0x8000,
            ..ServerConfig::default()
        }
    }

    /// Start `server` on an ephemeral port and wait until it accepts.
    pub fn start(server: &Arc<Server>) -> ServerHandle {
        start_with(server, local_config())
    }

    pub fn start_with(server: &Arc<Server>, config: ServerConfig) -> ServerHandle {
        setup_may_runtime();
        let handle = server.start(config).expect("server start");
        handle.wait_ready().expect("server ready");
        handle
    }
}

pub mod http {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    #[derive(Debug)]
    pub struct RawResponse {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl RawResponse {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.body).into_owned()
        }

        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).expect("json body")
        }
    }

    /// Minimal HTTP/1.1 client keeping one connection open.
    pub struct Client {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl Client {
        pub fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).expect("connect");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("read timeout");
            let writer = stream.try_clone().expect("clone stream");
            Self {
                reader: BufReader::new(stream),
                writer,
            }
        }

        pub fn send(&mut self, raw: &[u8]) {
            self.writer.write_all(raw).expect("send request");
        }

        pub fn response(&mut self) -> RawResponse {
            let mut line = String::new();
            self.reader.read_line(&mut line).expect("status line");
            let status = line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| panic!("bad status line: {line:?}"));

            let mut headers = Vec::new();
            loop {
                line.clear();
                self.reader.read_line(&mut line).expect("header line");
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    break;
                }
                let (name, value) = trimmed.split_once(':').expect("header separator");
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }

            let len = headers
                .iter()
                .find(|(k, _)| k == "content-length")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0);
            let mut body = vec![0u8; len];
            self.reader.read_exact(&mut body).expect("body");
            RawResponse {
                status,
                headers,
                body,
            }
        }

        pub fn request(&mut self, raw: &str) -> RawResponse {
            self.send(raw.as_bytes());
            self.response()
        }

        /// Raw bytes after the current position, until `n` bytes arrived.
        pub fn read_bytes(&mut self, n: usize) -> Vec<u8> {
            let mut buf = vec![0u8; n];
            self.reader.read_exact(&mut buf).expect("read bytes");
            buf
        }

        /// Whether the server closed the connection (EOF or reset); a read
        /// timeout means it is still open.
        pub fn is_closed(&mut self) -> bool {
            let mut byte = [0u8; 1];
            match self.reader.read(&mut byte) {
                Ok(n) => n == 0,
                Err(err) => !matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
            }
        }
    }

    pub fn get(path: &str) -> String {
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n")
    }

    /// One request on a fresh connection.
    pub fn send_request(addr: SocketAddr, raw: &str) -> RawResponse {
        Client::connect(addr).request(raw)
    }
}
