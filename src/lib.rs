//! PinGuard - app-lock and anti-tamper protection engine
//!
//! This crate provides:
//! - Per-app unlock sessions with idle timeout and periodic sweep
//! - A persisted bypass window and capability latch gating tamper response
//! - Tamper detection over settings navigation with per-category debounce
//! - Keyword countdown overlays with a single grace deferral
//! - A single-consumer tokio runtime, JSON-lines host protocol and CLI

pub mod cli;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod paths;
pub mod security;
pub mod wire;

pub use config::Config;
pub use engine::{EngineHandle, EngineRuntime, ProtectionEngine};
