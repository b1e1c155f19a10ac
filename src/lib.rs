//! Timeline preview render cache library
//!
//! Re-exports all modules for use by the binary target.

// Core engine (chunks, cache store, scheduler, history)
pub mod core;

// Front-end support
pub mod cli;
pub mod config;
pub mod paths;

// Re-export commonly used types from core
pub use core::event_bus::EventBus;
pub use core::{CacheStore, ChunkId, ChunkSet, PreviewError, PreviewScheduler};
pub use config::{DocumentSettings, PreviewConfig};
