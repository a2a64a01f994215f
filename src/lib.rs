//! Kiln - buildpack image builder
//!
//! Runs the buildpack lifecycle in ephemeral containers, turns the build
//! output into content-addressed image layers with a provenance label, and
//! rebases built images onto new run images without rebuilding. Builder
//! images bake a set of buildpacks into a stack's build image.

pub mod audit;
pub mod builder;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod image;
pub mod layer;
pub mod lifecycle;
pub mod metadata;
pub mod rebase;
pub mod ui;

pub use error::{KilnError, KilnResult};
