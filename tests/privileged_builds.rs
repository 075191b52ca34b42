//! End-to-end builds against the in-memory runtime services.
//!
//! Every build here must create exactly one container and release it, and the
//! privilege decision must agree between the recipe and the start call.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use shipyard::build::{
    BuildError, BuildEvent, BuildInput, BuildOptions, BuildState, ErrorKind, LifecycleStage,
    Orchestrator, spawn_build,
};
use shipyard::docker::fake::{ContainerOp, FakeContainerService, FakeImageService, ImageOp};
use shipyard::docker::{CancelToken, OutputLine};
use shipyard::repo::{EnvVars, Repo};
use shipyard::script::BuildScript;

fn privileged_repo() -> Repo {
    Repo::new("https://github.com/drone/drone")
        .with_working_dir("/var/cache/drone/src/github.com/drone/drone")
        .with_privileged(true)
}

fn script() -> BuildScript {
    BuildScript::new("some-image").with_commands(["go test ./..."])
}

fn services() -> (Arc<FakeImageService>, Arc<FakeContainerService>) {
    (
        Arc::new(FakeImageService::new().with_image("some-image")),
        Arc::new(FakeContainerService::new()),
    )
}

fn build(
    images: &Arc<FakeImageService>,
    containers: &Arc<FakeContainerService>,
    input: &BuildInput,
) -> Result<shipyard::build::BuildReport, BuildError> {
    Orchestrator::new(images.clone(), containers.clone()).run(input, &CancelToken::new())
}

#[test]
fn trusted_build_runs_privileged() {
    let (images, containers) = services();
    let input = BuildInput::new(privileged_repo(), script());

    let report = build(&images, &containers, &input).unwrap();

    let created = containers.created();
    assert_eq!(created.len(), 1, "exactly one container per build");
    let handle = &created[0].0;
    assert!(containers.started(handle).unwrap().privileged);
    assert!(report.privileged);

    let recipe = &images.built()[0].recipe;
    assert!(recipe.contains("\nENV DRONE_PRIVILEGED true\n"), "{recipe}");
    assert_eq!(recipe, &report.recipe);
}

#[test]
fn pull_request_build_is_never_privileged() {
    let (images, containers) = services();
    let repo = privileged_repo().with_pull_request("some-dangerous-pr");
    let input = BuildInput::new(repo, script());

    let report = build(&images, &containers, &input).unwrap();

    let created = containers.created();
    assert_eq!(created.len(), 1);
    assert!(!containers.started(&created[0].0).unwrap().privileged);
    assert!(!report.privileged);
    assert!(images.built()[0].recipe.contains("\nENV DRONE_PRIVILEGED false\n"));
}

#[test]
fn recipe_matches_expected_layout() {
    let (images, containers) = services();
    let repo = privileged_repo().with_params(EnvVars::new().with("GOPATH", "/go"));
    let input = BuildInput::new(repo, script())
        .with_env(EnvVars::new().with("DRONE_COMMIT", "d34db33f"));

    build(&images, &containers, &input).unwrap();

    assert_eq!(
        images.built()[0].recipe,
        "FROM some-image\n\
         ADD src /var/cache/drone/src/github.com/drone/drone\n\
         WORKDIR /var/cache/drone/src/github.com/drone/drone\n\
         ENV GOPATH /go\n\
         ENV DRONE_PRIVILEGED true\n\
         ENV DRONE_COMMIT d34db33f\n\
         RUN go test ./...\n"
    );
}

#[test]
fn spoofed_privilege_variable_is_ignored() {
    let (images, containers) = services();
    let repo = privileged_repo()
        .with_pull_request("7")
        .with_params(EnvVars::new().with("DRONE_PRIVILEGED", "true"));
    let input = BuildInput::new(repo, script())
        .with_env(EnvVars::new().with("DRONE_PRIVILEGED", "true"));

    build(&images, &containers, &input).unwrap();

    let recipe = &images.built()[0].recipe;
    assert_eq!(recipe.matches("DRONE_PRIVILEGED").count(), 1);
    assert!(recipe.contains("ENV DRONE_PRIVILEGED false\n"));
}

#[test]
fn failing_script_is_a_report_not_an_error() {
    let images = Arc::new(FakeImageService::new().with_image("some-image"));
    let containers = Arc::new(
        FakeContainerService::new()
            .with_exit_code(1)
            .with_output([OutputLine::Stderr("--- FAIL: TestBuild".into())]),
    );
    let input = BuildInput::new(privileged_repo(), script());

    let report = build(&images, &containers, &input).unwrap();

    assert_eq!(report.exit_code, 1);
    assert!(!report.succeeded());
    assert_eq!(report.status(), BuildState::Failed);
    assert!(report.log.contains("--- FAIL: TestBuild"));
    assert_eq!(containers.removed().len(), 1);
}

#[test]
fn wait_failure_is_an_error_and_still_tears_down() {
    let images = Arc::new(FakeImageService::new().with_image("some-image"));
    let containers =
        Arc::new(FakeContainerService::new().failing(ContainerOp::Wait, "daemon went away"));
    let input = BuildInput::new(privileged_repo(), script());

    let err = build(&images, &containers, &input).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ContainerLifecycle);
    assert!(matches!(
        err,
        BuildError::Container {
            stage: LifecycleStage::Wait,
            ..
        }
    ));
    let handle = containers.created()[0].0.clone();
    assert_eq!(containers.stopped(), vec![handle.clone()]);
    assert_eq!(containers.removed(), vec![handle]);
}

#[test]
fn create_failure_leaves_nothing_to_tear_down() {
    let images = Arc::new(FakeImageService::new().with_image("some-image"));
    let containers =
        Arc::new(FakeContainerService::new().failing(ContainerOp::Create, "quota exceeded"));
    let input = BuildInput::new(privileged_repo(), script());

    let err = build(&images, &containers, &input).unwrap_err();

    assert!(matches!(
        err,
        BuildError::Container {
            stage: LifecycleStage::Create,
            handle: None,
            ..
        }
    ));
    assert!(containers.stopped().is_empty());
    assert!(containers.removed().is_empty());
}

#[test]
fn missing_image_is_a_configuration_error() {
    let (images, containers) = services();
    let input = BuildInput::new(privileged_repo(), BuildScript::new("").with_commands(["make"]));

    let err = build(&images, &containers, &input).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(images.built().is_empty());
    assert!(containers.created().is_empty());
}

#[test]
fn image_build_failure_creates_no_container() {
    let images = Arc::new(
        FakeImageService::new()
            .with_image("some-image")
            .failing(ImageOp::Build, "error checking context: no space left on device"),
    );
    let containers = Arc::new(FakeContainerService::new());
    let input = BuildInput::new(privileged_repo(), script());

    let err = build(&images, &containers, &input).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ImageBuild);
    assert!(containers.created().is_empty());
}

#[test]
fn failing_script_step_is_distinct_from_infrastructure_errors() {
    let images = Arc::new(
        FakeImageService::new()
            .with_image("some-image")
            .with_failing_step(3),
    );
    let containers = Arc::new(FakeContainerService::new());
    let input = BuildInput::new(privileged_repo(), script());

    let err = build(&images, &containers, &input).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Script);
    assert_eq!(err.exit_code(), Some(3));
    assert!(containers.created().is_empty());
}

#[test]
fn base_image_pull_failure_is_an_image_error() {
    let images = Arc::new(FakeImageService::new().failing(ImageOp::Pull, "manifest unknown"));
    let containers = Arc::new(FakeContainerService::new());
    let input = BuildInput::new(privileged_repo(), script());

    let err = build(&images, &containers, &input).unwrap_err();

    assert!(matches!(err, BuildError::BaseImage { ref image, .. } if image == "some-image"));
    assert!(containers.created().is_empty());
}

#[test]
fn timeout_stops_a_hung_build() {
    let images = Arc::new(FakeImageService::new().with_image("some-image"));
    let containers = Arc::new(FakeContainerService::new().with_blocking_wait());
    let options = BuildOptions {
        timeout: Some(Duration::from_millis(300)),
        ..BuildOptions::default()
    };
    let input = BuildInput::new(privileged_repo(), script());

    let started = Instant::now();
    let err = Orchestrator::new(images, containers.clone())
        .with_options(options)
        .run(&input, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, BuildError::TimedOut(_)));
    assert!(started.elapsed() < Duration::from_secs(10));
    let handle = containers.created()[0].0.clone();
    assert_eq!(containers.stopped(), vec![handle.clone()]);
    assert_eq!(containers.removed(), vec![handle]);
}

#[test]
fn cancellation_interrupts_wait() {
    let images = Arc::new(FakeImageService::new().with_image("some-image"));
    let containers = Arc::new(FakeContainerService::new().with_blocking_wait());
    let input = BuildInput::new(privileged_repo(), script());
    let cancel = CancelToken::new();

    let (tx, rx) = mpsc::channel();
    let orchestrator = Orchestrator::new(images, containers.clone()).with_events(tx);
    let worker = {
        let cancel = cancel.clone();
        std::thread::spawn(move || orchestrator.run(&input, &cancel))
    };

    // Cancel once the container is being waited on.
    for event in rx.iter() {
        if matches!(event, BuildEvent::StateChanged(BuildState::Attached)) {
            cancel.cancel();
            break;
        }
    }

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));
    assert_eq!(err.kind(), ErrorKind::Interrupted);
    assert_eq!(containers.created().len(), 1);
    assert_eq!(containers.removed().len(), 1);
}

#[test]
fn concurrent_builds_share_services() {
    let (images, containers) = services();
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let images = images.clone();
            let containers = containers.clone();
            std::thread::spawn(move || {
                let repo = if n % 2 == 0 {
                    privileged_repo()
                } else {
                    privileged_repo().with_pull_request(n.to_string())
                };
                Orchestrator::new(images, containers)
                    .run(&BuildInput::new(repo, script()), &CancelToken::new())
            })
        })
        .collect();

    let reports: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    assert_eq!(containers.created().len(), 4);
    assert_eq!(containers.removed().len(), 4);
    for report in &reports {
        let host = containers.started(&report.container).unwrap();
        assert_eq!(host.privileged, report.privileged);
    }
    assert_eq!(reports.iter().filter(|r| r.privileged).count(), 2);
}

#[test]
fn background_build_streams_events() {
    let (images, containers) = services();
    let rx = spawn_build(
        Orchestrator::new(images, containers),
        BuildInput::new(privileged_repo(), script()),
        CancelToken::new(),
    );

    let events: Vec<_> = rx.iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        BuildEvent::StateChanged(BuildState::TornDown)
    )));
    match events.last() {
        Some(BuildEvent::Completed(report)) => assert!(report.succeeded()),
        other => panic!("expected Completed, got {other:?}"),
    }
}
