//! Dirmeta Common - Shared types and utilities
//!
//! This crate provides the error definitions and configuration types
//! used across all dirmeta components.

pub mod config;
pub mod error;

pub use config::MetadataConfig;
pub use error::{Error, Result};
