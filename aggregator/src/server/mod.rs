//! Network surfaces of the aggregator

pub mod http;

pub use http::serve_admin;
