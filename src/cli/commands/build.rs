//! Build command - run the lifecycle for an app directory

use crate::audit::{AuditEvent, AuditLog};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::engine::create_engine;
use crate::error::{KilnError, KilnResult};
use crate::lifecycle::{run_build, BuildSession};
use crate::ui::{self, PhaseOutput, TaskSpinner, UiContext};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config, cancel: &CancellationToken) -> KilnResult<()> {
    let ctx = UiContext::detect().with_quiet(args.quiet);
    let session = resolve_session(&args, config)?;

    ui::intro(&ctx, &format!("Building {}", session.repo_name));
    ui::key_value(&ctx, "App", &session.app_dir.display().to_string());
    ui::key_value(&ctx, "Build image", &session.build_image);
    ui::key_value(&ctx, "Run image", &session.run_image);
    if session.publish {
        ui::key_value(&ctx, "Publish", "registry");
    }

    let engine = create_engine(config);
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Checking {}...", engine.engine_name()));
    if let Err(e) = engine.ensure_ready().await {
        spinner.stop_error(&format!("{} is not available", engine.engine_name()));
        return Err(e);
    }
    spinner.stop(&format!("{} is ready", engine.engine_name()));

    let audit = AuditLog::new(config);
    let sink = PhaseOutput::new(&ctx).into_sink();

    match run_build(engine, config, &session, sink, cancel).await {
        Ok(digest) => {
            audit.record(AuditEvent::build_completed(&session, &digest)).await;
            ui::outro_success(&ctx, &format!("Built {} ({})", session.repo_name, digest));
            Ok(())
        }
        Err(e) => {
            audit
                .record(AuditEvent::build_failed(&session, e.phase(), &e.to_string()))
                .await;
            if let Some(tail) = e.output_tail() {
                ui::remark(&ctx, tail);
            }
            ui::outro_error(&ctx, "Build failed");
            Err(e)
        }
    }
}

/// Fill in images from the stack and resolve the app directory
fn resolve_session(args: &BuildArgs, config: &Config) -> KilnResult<BuildSession> {
    let stack = config.require_stack(args.stack.as_deref())?;
    debug!("Using stack {}", stack.id);

    let build_image = match &args.builder {
        Some(image) => image.clone(),
        None => stack.require_build_image_for(&args.repo_name)?.to_string(),
    };
    let run_image = match &args.run_image {
        Some(image) => image.clone(),
        None => stack.require_run_image_for(&args.repo_name)?.to_string(),
    };

    let app_dir = match &args.path {
        Some(path) => path.clone(),
        None => std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?,
    };

    Ok(BuildSession::new(
        &app_dir,
        build_image,
        run_image,
        &args.repo_name,
        args.publish,
    )?
    .with_stack(&stack.id))
}
