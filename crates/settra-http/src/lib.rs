//! # Settra HTTP
//!
//! The HTTP/1.1 surface of the settings service: a `TcpListener` accept
//! loop with one short-lived thread per connection, routed onto the store
//! and service layers. The shared state is a single `RwLock`-guarded store;
//! every mutation holds the write lock across validate, apply, and the
//! post-commit snapshot write.

mod handlers;
pub mod http;
mod state;

pub use http::{HttpResponse, Request, ServeError, serve, serve_with_limit};
pub use state::{AppState, OpenError, ServerConfig};

/// Route one parsed request. The server loop calls this per connection; it
/// is also the seam the integration tests drive.
pub fn handle_request(state: &AppState, request: &Request) -> HttpResponse {
    handlers::dispatch(state, request)
}
