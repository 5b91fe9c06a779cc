//! Local HTTP fixtures shared by the engine tests.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tiny_http::{Request, Response, Server, StatusCode};
use url::Url;

const THROTTLE_CHUNK: usize = 8 * 1024;

pub enum Reply {
    Text { status: u16, body: String },
    /// `bytes` of zeros streamed at `kbps` KiB/s with a Content-Length header.
    Throttled { bytes: usize, kbps: f64 },
    Delayed { delay: Duration, reply: Box<Reply> },
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Reply::Text {
            status: 200,
            body: body.to_string(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Text {
            status,
            body: body.to_string(),
        }
    }
}

type Route = dyn Fn(&Request) -> Reply + Send + Sync;

/// tiny_http server answering every request on its own thread.
pub struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    accept: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start<F>(route: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind test server"));
        let addr = server
            .server_addr()
            .to_ip()
            .expect("test server has an ip address");
        let hits = Arc::new(AtomicUsize::new(0));
        let route: Arc<Route> = Arc::new(route);

        let accept = {
            let server = Arc::clone(&server);
            let hits = Arc::clone(&hits);
            thread::spawn(move || {
                for request in server.incoming_requests() {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let route = Arc::clone(&route);
                    thread::spawn(move || {
                        let reply = route(&request);
                        respond(request, reply);
                    });
                }
            })
        };

        Self {
            server,
            addr,
            hits,
            accept: Some(accept),
        }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).expect("test url")
    }

    /// The server's base address, for use as an http proxy.
    pub fn proxy_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("proxy url")
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}

fn respond(request: Request, reply: Reply) {
    match reply {
        Reply::Text { status, body } => {
            let response = Response::from_string(body).with_status_code(StatusCode(status));
            let _ = request.respond(response);
        }
        Reply::Throttled { bytes, kbps } => {
            let body = ThrottledBody::new(bytes, kbps);
            let response = Response::new(StatusCode(200), Vec::new(), body, Some(bytes), None);
            let _ = request.respond(response);
        }
        Reply::Delayed { delay, reply } => {
            thread::sleep(delay);
            respond(request, *reply);
        }
    }
}

struct ThrottledBody {
    remaining: usize,
    sent: usize,
    bytes_per_sec: f64,
    started: Option<Instant>,
}

impl ThrottledBody {
    fn new(bytes: usize, kbps: f64) -> Self {
        Self {
            remaining: bytes,
            sent: 0,
            bytes_per_sec: kbps * 1024.0,
            started: None,
        }
    }
}

impl Read for ThrottledBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        let chunk = self.remaining.min(THROTTLE_CHUNK).min(buf.len());
        let due =
            started + Duration::from_secs_f64((self.sent + chunk) as f64 / self.bytes_per_sec);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        buf[..chunk].fill(0);
        self.sent += chunk;
        self.remaining -= chunk;
        Ok(chunk)
    }
}

/// A loopback port with nothing listening on it.
pub fn refused_url() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    Url::parse(&format!("http://{addr}/")).expect("url")
}

/// Minimal forward proxy that rejects every request with a fixed raw
/// response, then closes the connection.
pub struct RejectingProxy {
    addr: SocketAddr,
}

impl RejectingProxy {
    pub fn start(raw_response: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind proxy");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => head.push(byte[0]),
                    }
                }
                let _ = stream.write_all(raw_response.as_bytes());
                let _ = stream.flush();
            }
        });
        Self { addr }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("proxy url")
    }
}
