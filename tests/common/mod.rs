//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A scriptable in-memory backend for failure injection

// Not every test binary exercises every helper.
#![allow(dead_code)]

pub mod containers;
pub mod fake_backend;

pub use containers::*;
pub use fake_backend::*;
