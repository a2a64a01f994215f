//! cliclack theme

use cliclack::ThemeState;
use console::Style;

/// Amber while a build is running, green once it is done
#[derive(Debug, Clone, Copy, Default)]
pub struct KilnTheme;

impl KilnTheme {
    fn accent(state: &ThemeState, finished: Style) -> Style {
        match state {
            ThemeState::Active => Style::new().yellow(),
            ThemeState::Submit => finished,
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel => Style::new().dim(),
        }
    }
}

impl cliclack::Theme for KilnTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        Self::accent(state, Style::new().yellow().dim())
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        Self::accent(state, Style::new().green())
    }
}

pub fn init_theme() {
    cliclack::set_theme(KilnTheme);
}
