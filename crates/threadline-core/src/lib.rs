//! Core types and trait definitions for threadline.
//!
//! This crate is deliberately free of HTTP and database dependencies. Identity
//! normalization and thread grouping live here so that every consumer (the
//! datastore, the sync engine, reporting) calls one implementation.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
#![allow(async_fn_in_trait)]

pub mod communication;
pub mod contact;
pub mod error;
pub mod identity;
pub mod link;
pub mod record;
pub mod store;
pub mod thread;

pub use error::{Error, Result};
