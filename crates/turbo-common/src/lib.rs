//! Common types for turbo
//!
//! This crate provides the HTTP vocabulary shared by the validation and API crates.

pub mod http;

pub use http::{HttpMethod, HttpStatus, InvalidMethod};
