//! HTTP server: shared state, accept loop and request routing

mod http;

pub use http::{run, AppState, BoxBody};
