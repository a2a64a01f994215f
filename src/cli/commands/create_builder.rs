//! Create-builder command - bake buildpacks into a build image

use crate::audit::{AuditEvent, AuditLog};
use crate::builder::{create_builder, BuilderConfig, BuilderRequest};
use crate::cli::args::CreateBuilderArgs;
use crate::config::Config;
use crate::engine::{create_engine, ContainerEngine};
use crate::error::KilnResult;
use crate::image::select_store;
use crate::ui::{self, TaskSpinner, UiContext};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn execute(args: CreateBuilderArgs, config: &Config, cancel: &CancellationToken) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let engine = create_engine(config);
    if !args.publish {
        engine.ensure_ready().await?;
    }

    // Fail on a bad builder.toml before touching any image
    let buildpacks: Vec<String> = BuilderConfig::load(&args.builder_config)
        .await?
        .buildpacks
        .into_iter()
        .map(|bp| bp.id)
        .collect();

    let store = select_store(args.publish, Arc::clone(&engine), config);
    let puller: Option<&dyn ContainerEngine> = if args.publish || args.no_pull {
        None
    } else {
        Some(engine.as_ref())
    };
    let request = BuilderRequest {
        repo_name: args.repo_name.clone(),
        builder_toml: args.builder_config.clone(),
        build_image: args.build_image.clone(),
        stack: args.stack.clone(),
    };

    ui::intro(&ctx, &format!("Creating builder {}", request.repo_name));
    ui::key_value(&ctx, "Buildpacks", &buildpacks.join(", "));

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Adding buildpacks layer...");
    let digest = match create_builder(store.as_ref(), puller, config, &request, cancel).await {
        Ok(digest) => digest,
        Err(e) => {
            spinner.stop_error(&format!("Builder {} failed", request.repo_name));
            return Err(e);
        }
    };
    spinner.stop(&format!("Created {}", request.repo_name));

    AuditLog::new(config)
        .record(AuditEvent::BuilderCreated {
            repo: request.repo_name.clone(),
            build_image: request.build_image.clone(),
            buildpacks,
            publish: args.publish,
            digest: digest.clone(),
        })
        .await;

    ui::step_ok_detail(&ctx, &format!("Wrote {} to the {} store", request.repo_name, store.store_name()), &digest);
    ui::outro_success(&ctx, &format!("Builder {} is ready", request.repo_name));
    Ok(())
}
