//! Core types and configuration for the Harmonia coordination core.
//!
//! This crate provides the foundational pieces shared across all Harmonia
//! crates: the unified error enum and the startup configuration read by the
//! health monitor, coordinator, pattern store, evolution queue and harmony
//! controller.
//!
//! # Main types
//!
//! - [`HarmoniaError`]: Unified error enum for all Harmonia subsystems.
//! - [`HarmoniaResult`]: Convenience alias for `Result<T, HarmoniaError>`.
//! - [`HarmoniaConfig`]: Read-only startup configuration, loaded from TOML.

/// Startup configuration sections.
pub mod config;
/// Error taxonomy.
pub mod error;

pub use config::{
    CoordinatorConfig, EvolutionConfig, ExecutionConfig, HarmonyConfig, HarmonyWeights,
    HarmoniaConfig, HealthConfig, PatternConfig,
};
pub use error::{HarmoniaError, HarmoniaResult};
