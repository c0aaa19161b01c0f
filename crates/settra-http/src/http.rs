//! The HTTP/1.1 server loop and wire plumbing.

use crate::handlers;
use crate::state::{AppState, OpenError, ServerConfig};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use thiserror::Error;
use tracing::{debug, error};

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// A parsed request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Path segments, percent-decoded, with no empties.
    pub fn segments(&self) -> Vec<String> {
        self.path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(percent_decode)
            .collect()
    }
}

/// A response ready to serialize.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
            headers: Vec::new(),
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": message.into() }))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Run the server until the listener fails.
pub fn serve(config: ServerConfig) -> Result<(), ServeError> {
    serve_with_limit(config, None)
}

/// Run the server, optionally stopping after a bounded number of accepted
/// connections (used by tests).
pub fn serve_with_limit(config: ServerConfig, max_requests: Option<usize>) -> Result<(), ServeError> {
    let state = Arc::new(AppState::open(&config)?);
    let listener = TcpListener::bind(config.bind).map_err(ServeError::Bind)?;
    tracing::info!(bind = %config.bind, doc_only = config.doc_only, "listening");
    let served = Arc::new(AtomicUsize::new(0));

    for stream in listener.incoming() {
        if let Some(limit) = max_requests
            && served.load(Ordering::Relaxed) >= limit
        {
            break;
        }
        match stream {
            Ok(stream) => {
                let _ = stream.set_read_timeout(Some(config.request_timeout));
                let _ = stream.set_write_timeout(Some(config.request_timeout));
                let state = Arc::clone(&state);
                let served = Arc::clone(&served);
                thread::spawn(move || {
                    handle_connection(&state, stream);
                    served.fetch_add(1, Ordering::Relaxed);
                });
            }
            Err(err) => return Err(ServeError::Accept(err)),
        }
    }
    Ok(())
}

fn handle_connection(state: &AppState, mut stream: TcpStream) {
    let response = match read_request(&mut stream) {
        Ok(request) => {
            debug!(method = %request.method, path = %request.path, "request");
            handlers::dispatch(state, &request)
        }
        Err(message) => HttpResponse::error(400, message),
    };
    if let Err(err) = write_response(&mut stream, response) {
        error!(error = %err, "failed to write response");
    }
}

fn read_request(stream: &mut TcpStream) -> Result<Request, String> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .map_err(|e| format!("failed to read request: {e}"))?;
    let (method, target) = parse_request_line(request_line.trim_end())?;

    let mut headers = BTreeMap::new();
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| format!("failed to read headers: {e}"))?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .map(|value| value.parse::<usize>())
        .transpose()
        .map_err(|_| "invalid content-length".to_string())?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err("request body too large".to_string());
    }
    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .map_err(|e| format!("failed to read body: {e}"))?;

    let (path, query) = split_target(&target);
    Ok(Request {
        method,
        path: path.to_string(),
        query: parse_query_params(query),
        headers,
        body,
    })
}

fn parse_request_line(line: &str) -> Result<(String, String), String> {
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or_else(|| "missing method".to_string())?;
    let target = parts.next().ok_or_else(|| "missing target".to_string())?;
    Ok((method.to_string(), target.to_string()))
}

fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    }
}

pub(crate) fn parse_query_params(query: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = percent_decode(k);
        if key.is_empty() {
            continue;
        }
        out.insert(key, percent_decode(v));
    }
    out
}

pub(crate) fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let (Some(h), Some(l)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    out.push((h * 16 + l) as char);
                    i += 3;
                } else {
                    out.push('%');
                    i += 1;
                }
            }
            ch => {
                out.push(ch as char);
                i += 1;
            }
        }
    }
    out
}

fn hex_val(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

fn write_response(stream: &mut TcpStream, response: HttpResponse) -> std::io::Result<()> {
    let body = match &response.body {
        Some(value) => serde_json::to_vec(value)?,
        None => Vec::new(),
    };
    let mut header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        reason_phrase(response.status),
        body.len()
    );
    if response.body.is_some() {
        header.push_str("Content-Type: application/json\r\n");
    }
    for (name, value) in &response.headers {
        header.push_str(&format!("{name}: {value}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(&body)?;
    stream.flush()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_segments_are_decoded_and_non_empty() {
        let request = Request {
            method: "GET".to_string(),
            path: "/api/v1/settings/cache%5Fsize/".to_string(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        assert_eq!(request.segments(), ["api", "v1", "settings", "cache_size"]);
    }

    #[test]
    fn query_params_decode_common_forms() {
        let params = parse_query_params("settings=a%2Cb&include_metadata=true&empty");
        assert_eq!(params["settings"], "a,b");
        assert_eq!(params["include_metadata"], "true");
        assert_eq!(params["empty"], "");
    }

    #[test]
    fn percent_decode_works_for_common_forms() {
        assert_eq!(percent_decode("a%3A%28x%29"), "a:(x)");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
    }
}
