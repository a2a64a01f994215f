//! Terminal output for the CLI
//!
//! Uses `cliclack` in interactive terminals and falls back to plain,
//! prefixed lines in CI and when output is piped.

mod context;
mod output;
mod progress;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, outro_error, outro_success, remark, section, step_info, step_ok_detail,
    step_warn,
};
pub use progress::{PhaseOutput, TaskSpinner};
pub use theme::{init_theme, KilnTheme};
