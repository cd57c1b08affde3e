//! Core protocol types for hearth.
//!
//! This crate provides the value types shared by the decoder, the
//! response encoder, and the server:
//!
//! - [`Request`] with [`Method`], [`HttpVersion`] and [`Headers`]
//! - [`Response`] with [`StatusCode`]
//!
//! # Design Principles
//!
//! - No I/O: these are plain data types, fully testable in isolation
//! - Header names compare case-insensitively; insertion order and
//!   duplicates are preserved
//! - All types are `Send + Sync`

#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

mod request;
mod response;

pub use request::{Headers, HttpVersion, Method, Request};
pub use response::{Response, StatusCode};
