//! Line-oriented output shared by the commands
//!
//! Every function has a cliclack rendering for terminals and a plain one
//! for CI logs.

use super::context::UiContext;
use console::{style, StyledObject};

#[derive(Debug, Clone, Copy)]
enum Status {
    Ok,
    Warn,
    Info,
}

impl Status {
    fn tag(self) -> StyledObject<&'static str> {
        match self {
            Status::Ok => style("[OK]").green(),
            Status::Warn => style("[WARN]").yellow(),
            Status::Info => style("[INFO]").cyan(),
        }
    }

    fn emit(self, ctx: &UiContext, message: &str) {
        if !ctx.use_fancy_output() {
            println!("  {} {}", self.tag(), message);
            return;
        }
        let _ = match self {
            Status::Ok => cliclack::log::success(message),
            Status::Warn => cliclack::log::warning(message),
            Status::Info => cliclack::log::info(message),
        };
    }
}

pub fn intro(ctx: &UiContext, title: &str) {
    let title = style(title).cyan().bold();
    if ctx.use_fancy_output() {
        let _ = cliclack::intro(title);
    } else {
        println!("{}\n", title);
    }
}

fn outro(ctx: &UiContext, ok: bool, message: &str) {
    if ctx.use_fancy_output() {
        let styled = if ok {
            style(message).green().bold()
        } else {
            style(message).red().bold()
        };
        let _ = cliclack::outro(styled);
    } else {
        let tag = if ok { style("[OK]").green() } else { style("[ERROR]").red() };
        println!("\n{} {}", tag, message);
    }
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    outro(ctx, true, message);
}

pub fn outro_error(ctx: &UiContext, message: &str) {
    outro(ctx, false, message);
}

/// Header printed when a new phase starts producing output
pub fn section(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        let _ = cliclack::log::step(style(title).bold());
    } else {
        println!("{}", style(format!("===> {}", title.to_uppercase())).bold());
    }
}

pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    let line = if ctx.use_fancy_output() {
        format!("{} ({})", message, style(detail).dim())
    } else {
        format!("{} ({})", message, detail)
    };
    Status::Ok.emit(ctx, &line);
}

pub fn step_warn(ctx: &UiContext, message: &str) {
    Status::Warn.emit(ctx, message);
}

pub fn step_info(ctx: &UiContext, message: &str) {
    Status::Info.emit(ctx, message);
}

/// Dimmed free text, e.g. the output tail of a failed phase
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        let _ = cliclack::log::remark(message);
    } else {
        for line in message.lines() {
            println!("  {}", style(line).dim());
        }
    }
}

pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    let key = if ctx.use_fancy_output() {
        style(key).dim()
    } else {
        style(key)
    };
    println!("  {}: {}", key, value);
}
