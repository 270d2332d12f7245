//! services/api/src/lib.rs
//!
//! The HTTP service around the study-state core: configuration, the PostgreSQL
//! adapter and the Axum web layer. The binaries in `src/bin` wire these together.

pub mod adapters;
pub mod config;
pub mod error;
pub mod web;
