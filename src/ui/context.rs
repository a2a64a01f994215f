//! Terminal vs CI output mode

use std::io::IsTerminal;

/// Variables whose presence means we are running under CI
const CI_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "CIRCLECI",
    "JENKINS_URL",
    "BUILDKITE",
    "TF_BUILD",
];

/// How a command should present itself
#[derive(Debug, Clone)]
pub struct UiContext {
    interactive: bool,
    /// Echo phase container output
    show_output: bool,
}

impl UiContext {
    /// Spinners and cliclack output on a terminal, plain lines under CI or a pipe
    pub fn detect() -> Self {
        let tty = std::io::stdout().is_terminal();
        Self::from_env(tty, |var| std::env::var_os(var).is_some())
    }

    fn from_env(tty: bool, is_set: impl Fn(&str) -> bool) -> Self {
        Self {
            interactive: tty && !CI_VARS.iter().any(|var| is_set(var)),
            show_output: true,
        }
    }

    pub fn non_interactive() -> Self {
        Self::from_env(false, |_| false)
    }

    /// `--quiet` hides phase output but keeps progress and results
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.show_output = !quiet;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }

    pub fn show_output(&self) -> bool {
        self.show_output
    }
}
