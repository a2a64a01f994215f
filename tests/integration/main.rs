//! Integration tests for kiln

mod support;

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn kiln(config_dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.env("KILN_CONFIG", config_dir.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Build container images from source"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path_honours_env() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains(
                dir.path().join("config.toml").to_string_lossy().into_owned(),
            ));
    }

    #[test]
    fn config_show_lists_default_stack() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[lifecycle]"))
            .stdout(predicate::str::contains("io.buildpacks.stacks.bionic"));
    }

    #[test]
    fn config_init_writes_file() {
        let dir = TempDir::new().unwrap();
        kiln(&dir).args(["config", "init"]).assert().success();
        assert!(dir.path().join("config.toml").exists());
    }

    #[test]
    fn invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "stacks = 3").unwrap();
        kiln(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn build_rejects_bad_repo_name() {
        let dir = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();
        kiln(&dir)
            .args(["build", "Not/Valid"])
            .arg("--path")
            .arg(app.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid image reference"));
    }

    #[test]
    fn build_rejects_unknown_stack() {
        let dir = TempDir::new().unwrap();
        let app = TempDir::new().unwrap();
        kiln(&dir)
            .args(["build", "myapp", "--stack", "com.example.none"])
            .arg("--path")
            .arg(app.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Stack not found"));
    }

    #[test]
    fn create_builder_rejects_bad_builder_toml() {
        let dir = TempDir::new().unwrap();
        let builder_toml = dir.path().join("builder.toml");
        std::fs::write(&builder_toml, "[[buildpacks]]\nid = \"../escape\"\nuri = \"bp\"\n").unwrap();
        kiln(&dir)
            .args(["create-builder", "acme/builder", "--publish", "-b"])
            .arg(&builder_toml)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn rebase_publish_and_no_pull_conflict() {
        let dir = TempDir::new().unwrap();
        kiln(&dir)
            .args(["rebase", "myapp", "--publish", "--no-pull"])
            .assert()
            .failure();
    }
}

mod lifecycle {
    use crate::support::*;
    use futures_util::FutureExt;
    use kiln::error::KilnError;
    use kiln::image::ImageStore;
    use kiln::layer::{read_single_file, LayerBuilder};
    use kiln::lifecycle::{BuildSession, Lifecycle, LifecycleSettings, Phase};
    use kiln::metadata::{BuildMetadata, METADATA_LABEL, STACK_LABEL};
    use kiln::KilnResult;
    use serde_json::json;
    use std::fs;
    use std::panic::AssertUnwindSafe;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Writes one artifact `cache-dep` with `k = "v"` plus a process config
    fn write_cache_dep(launch: &Path, cache: &Path) {
        let bp = launch.join("example/bp");
        fs::create_dir_all(bp.join("cache-dep")).unwrap();
        fs::write(bp.join("cache-dep/dep.txt"), "dependency").unwrap();
        fs::write(bp.join("cache-dep.toml"), "k = \"v\"").unwrap();
        fs::write(bp.join("launch.toml"), "[[processes]]\ntype = \"web\"").unwrap();
        fs::create_dir_all(launch.join("config")).unwrap();
        fs::write(launch.join("config/metadata.toml"), "buildpacks = []").unwrap();
        fs::write(cache.join("marker"), "warm").unwrap();
    }

    async fn build(
        engine: &Arc<FakeEngine>,
        store: &MemoryStore,
        session: &BuildSession,
        cancel: &CancellationToken,
    ) -> (KilnResult<String>, Phase) {
        let mut lifecycle = Lifecycle::new(
            Arc::clone(engine) as Arc<dyn kiln::engine::ContainerEngine>,
            Box::new(store.clone()),
            LifecycleSettings::default(),
        );
        let result = lifecycle.run(session, cancel).await;
        (result, lifecycle.phase())
    }

    fn label(image: &kiln::image::Image) -> BuildMetadata {
        BuildMetadata::from_label(&image.name, image.label(METADATA_LABEL).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn builds_image_with_one_buildpack() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(
            FakeEngine::new(&cancel)
                .with_group(Some(
                    "repository = \"packs/build:v2\"\n[[buildpacks]]\nid = \"example/bp\"\nversion = \"1.0\"\n",
                ))
                .with_build(write_cache_dep),
        );
        let base = run_image("packs/run");
        let store = MemoryStore::default().with_image(base.clone());
        let app = app_dir();
        let session = session(&app, false);

        let (result, phase) = build(&engine, &store, &session, &cancel).await;
        let digest = result.unwrap();
        assert_eq!(phase, Phase::Done);

        let image = store.image("myapp").unwrap();
        assert_eq!(image.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(store.write_count(), 1);
        assert_eq!(image.layers.len(), base.layers.len() + 3);
        assert_eq!(image.layers[0].digest, base.layers[0].digest);
        assert_eq!(image.label(STACK_LABEL), Some("io.buildpacks.stacks.bionic"));

        let metadata = label(&image);
        assert_eq!(metadata.run_image.name, "packs/run");
        assert_eq!(metadata.run_image.sha, base.layers[1].diff_id);
        assert_eq!(metadata.buildpacks.len(), 1);
        assert_eq!(metadata.buildpacks[0].key, "example/bp");
        let dep = &metadata.buildpacks[0].layers["cache-dep"];
        assert_eq!(dep.data, json!({"k": "v"}));
        for sha in metadata.shas() {
            assert!(image.find_layer(sha).is_some(), "{} not in image", sha);
        }

        let app_layer = image.find_layer(&metadata.app.sha).unwrap();
        let entries = tar_entries(app_layer.bytes().unwrap());
        assert!(entries.contains(&"launch/app/index.js".to_string()), "{:?}", entries);

        // Recorded shas are the digests of the directories the layers came from
        let builder = LayerBuilder::new(LifecycleSettings::default().layer_options);
        assert_eq!(metadata.app.sha, builder.build(app.path(), "launch/app").unwrap().digest);
        let produced = TempDir::new().unwrap();
        fs::create_dir_all(produced.path().join("cache-dep")).unwrap();
        fs::write(produced.path().join("cache-dep/dep.txt"), "dependency").unwrap();
        let expected = builder
            .build(&produced.path().join("cache-dep"), "launch/example/bp/cache-dep")
            .unwrap();
        assert_eq!(dep.sha, expected.digest);

        let state = engine.state();
        assert_eq!(state.spec("build").unwrap().image, "packs/build:v2");
        assert!(state.spec("analyze").is_none());
        assert!(state.pulls.contains(&"packs/run".to_string()));
        let copy = state.spec("copy-app").unwrap();
        assert_eq!(copy.user.as_deref(), Some("0"));
        assert_eq!(copy.cmd, vec!["chown", "-R", "packs:packs", "/launch"]);
        drop(state);

        assert_cleaned_up(&engine, &session);
        assert!(volume_dir(&engine, &session.volumes.cache).is_some());
    }

    #[tokio::test]
    async fn rebuild_carries_forward_unproduced_artifacts() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_build(write_cache_dep));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();

        let first_session = session(&app, false);
        build(&engine, &store, &first_session, &cancel).await.0.unwrap();
        let first = store.image("myapp").unwrap();
        let first_label = first.label(METADATA_LABEL).unwrap().to_string();

        let saw_cache = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&saw_cache);
        engine.set_build(move |launch, cache| {
            seen.store(cache.join("marker").exists(), Ordering::SeqCst);
            let bp = launch.join("example/bp");
            fs::create_dir_all(&bp).unwrap();
            fs::write(bp.join("cache-dep.toml"), "k = \"changed\"").unwrap();
        });

        let second_session = session(&app, false);
        assert_eq!(first_session.volumes.cache, second_session.volumes.cache);
        build(&engine, &store, &second_session, &cancel).await.0.unwrap();
        assert!(saw_cache.load(Ordering::SeqCst));

        let second = store.image("myapp").unwrap();
        let (old, new) = (label(&first), label(&second));
        let carried = &new.buildpacks[0].layers["cache-dep"];
        assert_eq!(carried, &old.buildpacks[0].layers["cache-dep"]);
        assert_eq!(carried.data, json!({"k": "v"}));
        assert_eq!(
            second.find_layer(&carried.sha).unwrap().digest,
            first.find_layer(&carried.sha).unwrap().digest
        );

        let state = engine.state();
        let analyze = state.spec("analyze").unwrap();
        assert_eq!(analyze.image, "packs/util");
        assert_eq!(analyze.cmd, vec!["-metadata", "/tmp/metadata.json", "myapp"]);
        assert!(state.pulls.contains(&"packs/util".to_string()));
        let (_, _, tar) = state
            .uploads
            .iter()
            .find(|(id, dest, _)| id == &analyze.name && dest == "/tmp")
            .unwrap();
        assert_eq!(read_single_file(tar).unwrap(), first_label.as_bytes());
        drop(state);

        assert_cleaned_up(&engine, &second_session);
    }

    #[tokio::test]
    async fn previous_image_without_label_skips_analyze() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_build(write_cache_dep));
        let unlabelled = run_image("myapp");
        let store = MemoryStore::default()
            .with_image(run_image("packs/run"))
            .with_image(unlabelled);
        let app = app_dir();
        let session = session(&app, false);

        let (result, phase) = build(&engine, &store, &session, &cancel).await;
        result.unwrap();
        assert_eq!(phase, Phase::Done);
        assert!(engine.state().spec("analyze").is_none());
    }

    #[tokio::test]
    async fn publish_mode_skips_pull_and_passes_credentials() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_build(write_cache_dep));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();

        build(&engine, &store, &session(&app, true), &cancel).await.0.unwrap();
        build(&engine, &store, &session(&app, true), &cancel).await.0.unwrap();

        let state = engine.state();
        assert!(!state.pulls.contains(&"packs/run".to_string()));
        let analyze = state.spec("analyze").unwrap();
        assert!(analyze
            .env
            .contains(&("PACK_USE_HELPERS".to_string(), "true".to_string())));
        assert!(analyze
            .binds
            .iter()
            .any(|b| b.target == "/home/packs/.docker" && b.read_only));
    }

    #[tokio::test]
    async fn failed_phase_reports_code_and_output() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_fault(Fault::Exit("build", 3)));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();
        let session = session(&app, false);

        let (result, phase) = build(&engine, &store, &session, &cancel).await;
        let err = result.unwrap_err();
        assert_eq!(phase, Phase::Failed);
        assert!(matches!(err, KilnError::PhaseFailed { phase: Phase::Build, code: 3, .. }));
        let tail = err.output_tail().unwrap();
        assert!(tail.contains("build starting"));
        assert!(tail.contains("build warning"));
        assert_eq!(store.write_count(), 0);
        assert!(engine.state().spec("export").is_none());
        assert_cleaned_up(&engine, &session);
    }

    #[tokio::test]
    async fn cleanup_holds_at_every_failure_point() {
        let faults = [
            Fault::CreateVolume(0),
            Fault::CreateVolume(1),
            Fault::CreateVolume(2),
            Fault::Create("copy-app"),
            Fault::Exit("copy-app", 1),
            Fault::Create("detect"),
            Fault::Exit("detect", 1),
            Fault::Create("build"),
            Fault::Exit("build", 2),
            Fault::Create("export"),
        ];

        for fault in faults {
            let cancel = CancellationToken::new();
            let engine = Arc::new(FakeEngine::new(&cancel).with_build(write_cache_dep).with_fault(fault.clone()));
            let store = MemoryStore::default().with_image(run_image("packs/run"));
            let app = app_dir();
            let session = session(&app, false);

            let (result, phase) = build(&engine, &store, &session, &cancel).await;
            assert!(result.is_err(), "{:?} did not fail the build", fault);
            assert_eq!(phase, Phase::Failed, "{:?}", fault);
            assert_eq!(store.write_count(), 0, "{:?}", fault);
            assert_cleaned_up(&engine, &session);
        }
    }

    #[tokio::test]
    async fn missing_group_fails_detection() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_group(None));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();
        let session = session(&app, false);

        let (result, _) = build(&engine, &store, &session, &cancel).await;
        let err = result.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Detect));
        assert!(matches!(err.root(), KilnError::DetectionFailed(_)));
        assert!(err.hint().is_some());
        assert_cleaned_up(&engine, &session);
    }

    #[tokio::test]
    async fn empty_group_fails_detection() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_group(Some("buildpacks = []")));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();
        let session = session(&app, false);

        let (result, _) = build(&engine, &store, &session, &cancel).await;
        assert!(matches!(result.unwrap_err().root(), KilnError::DetectionFailed(_)));
        assert!(engine.state().spec("build").is_none());
    }

    #[tokio::test]
    async fn missing_run_image_is_access_error() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_build(write_cache_dep));
        let store = MemoryStore::default();
        let app = app_dir();
        let session = session(&app, false);

        let (result, phase) = build(&engine, &store, &session, &cancel).await;
        let err = result.unwrap_err();
        assert_eq!(phase, Phase::Failed);
        assert_eq!(err.phase(), Some(Phase::Export));
        assert!(matches!(err.root(), KilnError::ImageAccess { .. }));
        assert_cleaned_up(&engine, &session);
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_build(write_cache_dep));
        let store = MemoryStore::default()
            .with_image(run_image("packs/run"))
            .failing_writes();
        let app = app_dir();
        let session = session(&app, false);

        let (result, _) = build(&engine, &store, &session, &cancel).await;
        assert!(result.is_err());
        assert!(store.image("myapp").is_none());
        assert_cleaned_up(&engine, &session);
    }

    #[tokio::test]
    async fn cancellation_stops_the_build_and_cleans_up() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(
            FakeEngine::new(&cancel)
                .with_build(write_cache_dep)
                .with_fault(Fault::Hang("build")),
        );
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();
        let session = session(&app, false);

        let (result, phase) = build(&engine, &store, &session, &cancel).await;
        assert!(matches!(result, Err(KilnError::Cancelled)));
        assert_eq!(phase, Phase::Failed);
        assert_eq!(store.write_count(), 0);
        assert!(engine.state().spec("export").is_none());
        assert_cleaned_up(&engine, &session);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = Arc::new(FakeEngine::new(&cancel));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();
        let session = session(&app, false);

        let (result, _) = build(&engine, &store, &session, &cancel).await;
        assert!(matches!(result, Err(KilnError::Cancelled)));
        assert!(engine.state().containers_created.is_empty());
        assert_cleaned_up(&engine, &session);
    }

    #[tokio::test]
    async fn panic_in_phase_still_cleans_up() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_fault(Fault::Panic("detect")));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();
        let session = session(&app, false);

        let mut lifecycle = Lifecycle::new(
            Arc::clone(&engine) as Arc<dyn kiln::engine::ContainerEngine>,
            Box::new(store.clone()),
            LifecycleSettings::default(),
        );
        let outcome = AssertUnwindSafe(lifecycle.run(&session, &cancel))
            .catch_unwind()
            .await;

        assert!(outcome.is_err());
        assert_eq!(lifecycle.phase(), Phase::Failed);
        assert_cleaned_up(&engine, &session);
        let state = engine.state();
        assert!(state
            .containers_removed
            .iter()
            .any(|c| c.starts_with("kiln-detect-")));
    }

    #[tokio::test]
    async fn analyzer_failure_is_fatal() {
        let cancel = CancellationToken::new();
        let engine = Arc::new(FakeEngine::new(&cancel).with_build(write_cache_dep));
        let store = MemoryStore::default().with_image(run_image("packs/run"));
        let app = app_dir();
        build(&engine, &store, &session(&app, false), &cancel).await.0.unwrap();

        let engine = Arc::new(
            FakeEngine::new(&cancel)
                .with_build(write_cache_dep)
                .with_fault(Fault::Exit("analyze", 1)),
        );
        let session = session(&app, false);
        let (result, _) = build(&engine, &store, &session, &cancel).await;
        assert!(matches!(result, Err(KilnError::PhaseFailed { phase: Phase::Analyze, .. })));
        assert_eq!(store.write_count(), 1);
        assert_cleaned_up(&engine, &session);
    }

    #[tokio::test]
    async fn store_read_of_missing_image_is_soft() {
        let store = MemoryStore::default();
        let err = store.read_existing("myapp").await.unwrap_err();
        assert!(err.is_not_found());
    }
}

mod rebase {
    use crate::support::*;
    use kiln::config::Config;
    use kiln::engine::ContainerEngine;
    use kiln::error::KilnError;
    use kiln::image::{Image, Layer};
    use kiln::metadata::{BuildMetadata, LayerSha, RunImageMetadata, METADATA_LABEL, STACK_LABEL};
    use kiln::rebase::{run_rebase, RebaseRequest};
    use tokio_util::sync::CancellationToken;

    fn built_on(base: &Image) -> Image {
        let app = Layer::from_tar(b"app".to_vec(), Some("launch/app".to_string()));
        let config = Layer::from_tar(b"config".to_vec(), Some("launch/config".to_string()));
        let metadata = BuildMetadata {
            run_image: RunImageMetadata {
                name: base.name.clone(),
                sha: base.top_diff_id().unwrap().to_string(),
            },
            app: LayerSha {
                sha: app.digest.clone(),
            },
            config: LayerSha {
                sha: config.digest.clone(),
            },
            buildpacks: vec![],
        };
        Image::derive(base, "myapp")
            .with_layer(app)
            .with_layer(config)
            .with_label(METADATA_LABEL, metadata.to_label().unwrap())
            .with_label(STACK_LABEL, "io.buildpacks.stacks.bionic")
    }

    fn request(run_image: Option<&str>) -> RebaseRequest {
        RebaseRequest {
            repo_name: "myapp".to_string(),
            run_image: run_image.map(str::to_string),
            stack: None,
        }
    }

    #[tokio::test]
    async fn moves_app_layers_onto_new_base() {
        let old_base = run_image("packs/run:1");
        let new_base = run_image("packs/run:2");
        let target = built_on(&old_base);
        let store = MemoryStore::default()
            .with_image(target.clone())
            .with_image(new_base.clone());

        let cancel = CancellationToken::new();
        let digest = run_rebase(&store, None, &Config::default(), &request(Some("packs/run:2")), &cancel)
            .await
            .unwrap();

        assert_eq!(store.write_count(), 1);
        let rebased = store.image("myapp").unwrap();
        assert_eq!(rebased.digest.as_deref(), Some(digest.as_str()));

        let digests: Vec<&str> = rebased.layers.iter().map(|l| l.digest.as_str()).collect();
        let expected: Vec<&str> = new_base
            .layers
            .iter()
            .chain(&target.layers[old_base.layers.len()..])
            .map(|l| l.digest.as_str())
            .collect();
        assert_eq!(digests, expected);

        let metadata = BuildMetadata::from_label("myapp", rebased.label(METADATA_LABEL).unwrap()).unwrap();
        assert_eq!(metadata.run_image.name, "packs/run:2");
        assert_eq!(metadata.run_image.sha, new_base.layers[1].diff_id);
        assert_eq!(rebased.label(STACK_LABEL), Some("io.buildpacks.stacks.bionic"));
    }

    #[tokio::test]
    async fn defaults_to_stack_run_image_and_pulls_both_images() {
        let old_base = run_image("packs/run:1");
        let stack_base = run_image("packs/run");
        let store = MemoryStore::default()
            .with_image(built_on(&old_base))
            .with_image(stack_base);

        let cancel = CancellationToken::new();
        let engine = FakeEngine::new(&cancel);
        run_rebase(
            &store,
            Some(&engine as &dyn ContainerEngine),
            &Config::default(),
            &request(None),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(engine.state().pulls, vec!["myapp".to_string(), "packs/run".to_string()]);
        let metadata = BuildMetadata::from_label("myapp", store.image("myapp").unwrap().label(METADATA_LABEL).unwrap()).unwrap();
        assert_eq!(metadata.run_image.name, "packs/run");
    }

    #[tokio::test]
    async fn failed_target_pull_is_fatal() {
        let old_base = run_image("packs/run:1");
        let store = MemoryStore::default()
            .with_image(built_on(&old_base))
            .with_image(run_image("packs/run:2"));

        let cancel = CancellationToken::new();
        let engine = FakeEngine::new(&cancel).with_fault(Fault::Pull("myapp"));
        let err = run_rebase(
            &store,
            Some(&engine as &dyn ContainerEngine),
            &Config::default(),
            &request(Some("packs/run:2")),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, KilnError::Engine { .. }));
        assert_eq!(engine.state().pulls, vec!["myapp".to_string()]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_label_writes_nothing() {
        let old_base = run_image("packs/run:1");
        let mut target = built_on(&old_base);
        let mut metadata = BuildMetadata::from_label("myapp", target.label(METADATA_LABEL).unwrap()).unwrap();
        metadata.run_image.sha = "sha256:unknown".to_string();
        target = target.with_label(METADATA_LABEL, metadata.to_label().unwrap());

        let store = MemoryStore::default()
            .with_image(target)
            .with_image(run_image("packs/run:2"));

        let cancel = CancellationToken::new();
        let err = run_rebase(&store, None, &Config::default(), &request(Some("packs/run:2")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::RebaseBoundaryNotFound { .. }));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn unlabelled_target_is_rejected() {
        let store = MemoryStore::default()
            .with_image(run_image("myapp"))
            .with_image(run_image("packs/run:2"));

        let cancel = CancellationToken::new();
        let err = run_rebase(&store, None, &Config::default(), &request(Some("packs/run:2")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::MissingProvenance(_)));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn missing_target_is_fatal() {
        let store = MemoryStore::default().with_image(run_image("packs/run:2"));
        let cancel = CancellationToken::new();
        let err = run_rebase(&store, None, &Config::default(), &request(Some("packs/run:2")), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn missing_new_base_writes_nothing() {
        let store = MemoryStore::default().with_image(built_on(&run_image("packs/run:1")));
        let cancel = CancellationToken::new();
        let err = run_rebase(&store, None, &Config::default(), &request(Some("packs/run:9")), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.write_count(), 0);
    }
}

mod builder {
    use crate::support::*;
    use kiln::builder::{create_builder, BuilderRequest, BuildpackOrder};
    use kiln::config::Config;
    use kiln::engine::ContainerEngine;
    use kiln::error::KilnError;
    use kiln::metadata::STACK_LABEL;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// builder.toml next to two buildpack directories
    fn builder_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in ["node", "ruby"] {
            fs::create_dir_all(dir.path().join(name).join("bin")).unwrap();
            fs::write(dir.path().join(name).join("bin/detect"), "#!/bin/sh\n").unwrap();
        }
        fs::write(
            dir.path().join("builder.toml"),
            r#"
            [[buildpacks]]
            id = "com.example.node"
            uri = "node"

            [[buildpacks]]
            id = "com.example.ruby"
            uri = "file://ruby"

            [[groups]]
            buildpacks = [{ id = "com.example.ruby" }]

            [[groups]]
            buildpacks = [{ id = "com.example.node" }]
            "#,
        )
        .unwrap();
        dir
    }

    fn request(dir: &TempDir) -> BuilderRequest {
        BuilderRequest {
            repo_name: "acme/builder".to_string(),
            builder_toml: dir.path().join("builder.toml"),
            ..BuilderRequest::default()
        }
    }

    fn order_of(blob: &[u8]) -> BuildpackOrder {
        let mut archive = tar::Archive::new(blob);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_str() == Some("buildpacks/order.toml") {
                let mut text = String::new();
                entry.read_to_string(&mut text).unwrap();
                return toml::from_str(&text).unwrap();
            }
        }
        panic!("layer has no order.toml");
    }

    #[tokio::test]
    async fn appends_buildpacks_layer_to_stack_build_image() {
        let dir = builder_dir();
        let base = run_image("packs/build");
        let store = MemoryStore::default().with_image(base.clone());
        let cancel = CancellationToken::new();
        let engine = FakeEngine::new(&cancel);

        let digest = create_builder(
            &store,
            Some(&engine as &dyn ContainerEngine),
            &Config::default(),
            &request(&dir),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(engine.state().pulls, vec!["packs/build".to_string()]);
        assert_eq!(store.write_count(), 1);
        let builder = store.image("acme/builder").unwrap();
        assert_eq!(builder.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(builder.layers.len(), base.layers.len() + 1);
        for (kept, original) in builder.layers.iter().zip(&base.layers) {
            assert_eq!(kept.digest, original.digest);
        }
        assert_eq!(builder.label(STACK_LABEL), Some("io.buildpacks.stacks.bionic"));

        let layer = builder.layers.last().unwrap();
        let entries = tar_entries(layer.bytes().unwrap());
        assert!(entries.contains(&"buildpacks/com.example.node/latest/bin/detect".to_string()), "{entries:?}");
        assert!(entries.contains(&"buildpacks/com.example.ruby/latest/bin/detect".to_string()), "{entries:?}");

        let order = order_of(layer.bytes().unwrap());
        assert_eq!(order.groups.len(), 2);
        assert_eq!(order.groups[0].buildpacks[0].id, "com.example.ruby");
    }

    #[tokio::test]
    async fn explicit_build_image_without_pull() {
        let dir = builder_dir();
        let store = MemoryStore::default().with_image(run_image("custom/build:2"));
        let cancel = CancellationToken::new();
        let mut req = request(&dir);
        req.build_image = Some("custom/build:2".to_string());

        create_builder(&store, None, &Config::default(), &req, &cancel)
            .await
            .unwrap();
        assert!(store.image("acme/builder").is_some());
    }

    #[tokio::test]
    async fn missing_build_image_writes_nothing() {
        let dir = builder_dir();
        let store = MemoryStore::default();
        let cancel = CancellationToken::new();

        let err = create_builder(&store, None, &Config::default(), &request(&dir), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn missing_buildpack_source_writes_nothing() {
        let dir = builder_dir();
        fs::remove_dir_all(dir.path().join("ruby")).unwrap();
        let store = MemoryStore::default().with_image(run_image("packs/build"));
        let cancel = CancellationToken::new();

        let err = create_builder(&store, None, &Config::default(), &request(&dir), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::LayerConstruction { .. }));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn failed_write_is_reported() {
        let dir = builder_dir();
        let store = MemoryStore::default()
            .with_image(run_image("packs/build"))
            .failing_writes();
        let cancel = CancellationToken::new();

        let err = create_builder(&store, None, &Config::default(), &request(&dir), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ImageAccess { .. }));
    }
}
