//! Rebase command - move an image onto a new run image

use crate::audit::{AuditEvent, AuditLog};
use crate::cli::args::RebaseArgs;
use crate::config::Config;
use crate::engine::{create_engine, ContainerEngine};
use crate::error::KilnResult;
use crate::image::select_store;
use crate::rebase::{run_rebase, RebaseRequest};
use crate::ui::{self, TaskSpinner, UiContext};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Execute the rebase command
pub async fn execute(args: RebaseArgs, config: &Config, cancel: &CancellationToken) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let engine = create_engine(config);
    if !args.publish {
        engine.ensure_ready().await?;
    }

    let store = select_store(args.publish, Arc::clone(&engine), config);
    let puller: Option<&dyn ContainerEngine> = if args.publish || args.no_pull {
        None
    } else {
        Some(engine.as_ref())
    };
    if args.no_pull {
        ui::step_info(&ctx, "Using local copies of the image and run image");
    }
    let request = RebaseRequest {
        repo_name: args.repo_name.clone(),
        run_image: args.run_image.clone(),
        stack: args.stack.clone(),
    };

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Rebasing {}...", request.repo_name));
    let digest = match run_rebase(store.as_ref(), puller, config, &request, cancel).await {
        Ok(digest) => digest,
        Err(e) => {
            spinner.stop_error(&format!("Rebase of {} failed", request.repo_name));
            return Err(e);
        }
    };
    spinner.stop(&format!("Rebased {}", request.repo_name));

    AuditLog::new(config)
        .record(AuditEvent::RebaseCompleted {
            repo: request.repo_name.clone(),
            run_image: request.run_image.clone(),
            publish: args.publish,
            digest: digest.clone(),
        })
        .await;

    ui::step_ok_detail(&ctx, &format!("Wrote {} to the {} store", request.repo_name, store.store_name()), &digest);
    Ok(())
}
