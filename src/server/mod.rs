//! The HTTP serving layer.
//!
//! A deliberately small async TCP server: accept connections, parse
//! HTTP/1.1 requests with [`httparse`], dispatch the handful of GET routes
//! this proxy exposes, and write JSON back. HTTP/1.1 persistent connections
//! (keep-alive) are supported. There is no general router or middleware;
//! the route table is the four endpoints and will stay that size.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::App;
use crate::error::Error as ProxyError;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum bytes of a single request we will buffer. Every endpoint is a
/// bodyless GET, so anything near this is garbage.
const MAX_REQUEST_SIZE: usize = 16 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 1024;

/// Maximum number of request headers we parse.
const MAX_HEADERS: usize = 64;

/// The proxy's route table.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Films,
    People,
    FilmPeople(Uuid),
}

/// Resolves a request path to a route. Trailing slashes are tolerated.
fn route(path: &str) -> Option<Route> {
    let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);
    match path {
        "/health" => Some(Route::Health),
        "/films" => Some(Route::Films),
        "/people" => Some(Route::People),
        other => {
            let rest = other.strip_prefix("/films/")?;
            let (id, tail) = rest.split_once('/')?;
            if tail != "people" {
                return None;
            }
            let id = Uuid::parse_str(id).ok()?;
            Some(Route::FilmPeople(id))
        }
    }
}

/// An HTTP/1.1 response ready to serialize.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn text(status: u16, reason: &'static str, body: &str) -> Self {
        Self {
            status,
            reason,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    /// A JSON response. Serialization failure of our own types would be a
    /// bug; it degrades to a 500 rather than a broken wire.
    fn json<T: Serialize>(status: u16, reason: &'static str, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                reason,
                content_type: "application/json",
                body,
            },
            Err(err) => {
                error!(error = %err, "failed to serialize response body");
                Self::text(500, "Internal Server Error", "internal error")
            }
        }
    }

    /// Status code, primarily for tests.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Serializes to HTTP/1.1 wire format.
    fn into_bytes(self, keep_alive: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        buf.put(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
        buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        let connection = if keep_alive { "keep-alive" } else { "close" };
        buf.put(format!("Connection: {connection}\r\n\r\n").as_bytes());
        buf.put(self.body.as_slice());
        buf
    }
}

/// The proxy's HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ghibli_proxy::app::App;
/// use ghibli_proxy::config::Config;
/// use ghibli_proxy::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let app = Arc::new(App::new(&config)?);
///     let server = Server::bind(&config.bind_addr).await?;
///     server.run(app).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and serves requests against `app` until the
    /// process is terminated or the listener fails unrecoverably.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, app: Arc<App>) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "ghibli-proxy listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let app = Arc::clone(&app);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, app).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Serves one connection for its lifetime: one request per loop iteration
/// until the peer closes or sends `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    app: Arc<App>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large — sending 413");
            let response = Response::text(413, "Payload Too Large", "request too large");
            stream.write_all(&response.into_bytes(false)).await?;
            break;
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let offset = match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(offset)) => offset,
            Ok(httparse::Status::Partial) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                let response = Response::text(400, "Bad Request", "bad request");
                stream.write_all(&response.into_bytes(false)).await?;
                break;
            }
        };

        let method = parsed.method.unwrap_or("").to_owned();
        let target = parsed.path.unwrap_or("").to_owned();
        let keep_alive = is_keep_alive(&parsed);

        // Bodyless API: wait for any declared body, then throw it away.
        let content_length = content_length(&parsed);
        let total_needed = offset + content_length;
        if buf.len() < total_needed {
            continue;
        }

        // Drop the query string; none of our routes take parameters.
        let path = target.split('?').next().unwrap_or("").to_owned();

        debug!(peer = %peer_addr, %method, %path, "dispatching request");
        let response = respond(&app, &method, &path).await;
        let status = response.status();
        stream.write_all(&response.into_bytes(keep_alive)).await?;
        stream.flush().await?;
        debug!(peer = %peer_addr, %method, %path, status, "request served");

        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close — shutting down");
            break;
        }
    }

    Ok(())
}

/// HTTP/1.1 defaults to keep-alive unless the peer says otherwise.
fn is_keep_alive(parsed: &httparse::Request<'_, '_>) -> bool {
    let connection = parsed
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("connection"))
        .and_then(|h| std::str::from_utf8(h.value).ok());
    match connection {
        Some(value) => !value.eq_ignore_ascii_case("close"),
        None => parsed.version == Some(1),
    }
}

fn content_length(parsed: &httparse::Request<'_, '_>) -> usize {
    parsed
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Routes one request to the application and renders the outcome.
async fn respond(app: &App, method: &str, path: &str) -> Response {
    if method != "GET" {
        return Response::text(405, "Method Not Allowed", "method not allowed");
    }

    match route(path) {
        None => Response::json(404, "Not Found", &json!({"error": "no such resource"})),
        Some(Route::Health) => Response::text(200, "OK", "ok"),
        Some(Route::Films) => match app.films().await {
            Ok(films) => Response::json(200, "OK", &films),
            Err(err) => error_response(err),
        },
        Some(Route::People) => match app.people().await {
            Ok(people) => Response::json(200, "OK", &people),
            Err(err) => error_response(err),
        },
        Some(Route::FilmPeople(film_id)) => match app.film_people(film_id).await {
            Ok(Some(joined)) => Response::json(200, "OK", &joined),
            Ok(None) => Response::json(404, "Not Found", &json!({"error": "no such film"})),
            Err(err) => error_response(err),
        },
    }
}

/// Failures that reach this point were not recoverable from the cache:
/// partner trouble becomes a 502, anything else is on us.
fn error_response(err: ProxyError) -> Response {
    if err.is_partner_unavailable() {
        warn!(error = %err, "upstream unavailable with no cache to fall back on");
        Response::json(
            502,
            "Bad Gateway",
            &json!({"error": "upstream partner unavailable"}),
        )
    } else {
        error!(error = %err, "request failed");
        Response::json(500, "Internal Server Error", &json!({"error": "internal error"}))
    }
}
