//! CLI command implementations

pub mod build;
pub mod config;
pub mod create_builder;
pub mod rebase;

pub use build::execute as build;
pub use config::execute as config;
pub use create_builder::execute as create_builder;
pub use rebase::execute as rebase;
