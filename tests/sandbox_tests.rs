mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{next_matching, wait_until, TestStrategy};
use live_sandbox::{
    mime, LoaderRegistry, ResetOutcome, Sandbox, SandboxConfig, SandboxEvent, SandboxState,
};
use tempfile::tempdir;

const INDEX: &str = "mem:///site/index.html";

/// Execution context whose identity is its creation number.
#[derive(Debug)]
struct Global(usize);

fn sandbox(strategy: Arc<TestStrategy>) -> Sandbox<Global> {
    let created = Arc::new(AtomicUsize::new(0));
    Sandbox::new(
        strategy,
        Arc::new(LoaderRegistry::with_defaults()),
        move || Global(created.fetch_add(1, Ordering::SeqCst)),
    )
    .unwrap()
}

fn site() -> TestStrategy {
    TestStrategy::new()
        .with_file(
            INDEX,
            "<html>\n<head><link rel=\"stylesheet\" href=\"site.css\"></head>\n<body><img src=\"logo.png\"></body>\n</html>",
        )
        .with_file("mem:///site/site.css", "body { background: url(bg.png) }")
        .with_file("mem:///site/bg.png", "bg")
        .with_file("mem:///site/logo.png", "logo")
}

#[tokio::test]
async fn test_dependency_change_resets_and_reopens() {
    let strategy = Arc::new(site());
    let sandbox = sandbox(strategy.clone());
    sandbox
        .open(mime::HTML_MIME_TYPE, INDEX, None)
        .await
        .unwrap();
    let before = sandbox.global();
    let mut events = sandbox.subscribe();

    strategy.set("mem:///site/bg.png", "new bg");
    sandbox.importer().refresh().await.unwrap();

    let uris = next_matching(&mut events, |event| match event {
        SandboxEvent::Changed { uris } => Some(uris),
        _ => None,
    })
    .await;
    assert_eq!(uris, vec!["mem:///site/bg.png"]);

    let after = sandbox.global();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!((before.0, after.0), (0, 1));
    assert_eq!(sandbox.state(), SandboxState::Open);
    let entry = sandbox.entry().unwrap();
    assert_eq!((entry.mime_type.as_str(), entry.file_path.as_str()), (mime::HTML_MIME_TYPE, INDEX));
    assert_eq!(
        sandbox.importer().dependency("mem:///site/bg.png").unwrap().content,
        "new bg"
    );
}

#[tokio::test]
async fn test_reset_reopen_emits_evaluated_then_changed() {
    let strategy = Arc::new(site());
    let sandbox = sandbox(strategy.clone());
    sandbox
        .open(mime::HTML_MIME_TYPE, INDEX, None)
        .await
        .unwrap();
    let mut events = sandbox.subscribe();

    strategy.set("mem:///site/site.css", "body { color: red }");
    sandbox.importer().refresh().await.unwrap();

    let first = next_matching(&mut events, Some).await;
    assert!(matches!(first, SandboxEvent::Evaluated { .. }));
    let second = next_matching(&mut events, Some).await;
    assert_eq!(
        second,
        SandboxEvent::Changed {
            uris: vec!["mem:///site/site.css".into()]
        }
    );
    // the stylesheet dropped bg.png
    assert!(sandbox.importer().dependency("mem:///site/bg.png").is_none());
}

#[tokio::test]
async fn test_resets_during_a_reset_coalesce_into_one_trailing_run() {
    let strategy = Arc::new(site());
    let sandbox = sandbox(strategy.clone());
    sandbox
        .open(mime::HTML_MIME_TYPE, INDEX, None)
        .await
        .unwrap();
    let mut events = sandbox.subscribe();

    strategy.close_gate();
    let first = tokio::spawn({
        let sandbox = sandbox.clone();
        async move { sandbox.reset().await }
    });
    strategy.wait_blocked().await;
    assert_eq!(sandbox.state(), SandboxState::Resetting);

    assert_eq!(sandbox.reset().await, ResetOutcome::Coalesced);
    assert_eq!(sandbox.reset().await, ResetOutcome::Coalesced);
    assert_eq!(sandbox.reset().await, ResetOutcome::Coalesced);
    strategy.open_gate();

    assert_eq!(first.await.unwrap(), ResetOutcome::Completed { runs: 2 });
    assert_eq!(sandbox.state(), SandboxState::Open);

    let mut changed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SandboxEvent::Changed { .. }) {
            changed += 1;
        }
    }
    assert_eq!(changed, 2);
}

#[tokio::test]
async fn test_failed_reset_is_reported_and_keeps_sandbox_open() {
    let strategy = Arc::new(site());
    let sandbox = sandbox(strategy.clone());
    sandbox
        .open(mime::HTML_MIME_TYPE, INDEX, None)
        .await
        .unwrap();
    let mut events = sandbox.subscribe();

    strategy.set(INDEX, "<img src=\"http://[broken\">");
    assert_eq!(sandbox.reset().await, ResetOutcome::Completed { runs: 1 });

    let message = next_matching(&mut events, |event| match event {
        SandboxEvent::ResetFailed { message } => Some(message),
        _ => None,
    })
    .await;
    assert!(message.contains("http://[broken"));
    assert_eq!(sandbox.state(), SandboxState::Open);
    assert!(sandbox
        .entry_dependency()
        .unwrap()
        .content
        .contains("site.css"));
}

#[tokio::test]
async fn test_manual_reset_reports_upstream_changes_once() {
    let strategy = Arc::new(site());
    let sandbox = sandbox(strategy.clone());
    sandbox
        .open(mime::HTML_MIME_TYPE, INDEX, None)
        .await
        .unwrap();
    let mut events = sandbox.subscribe();

    strategy.set("mem:///site/bg.png", "new bg");
    assert_eq!(sandbox.reset().await, ResetOutcome::Completed { runs: 1 });
    // leave room for a follow-up reset to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            SandboxEvent::Evaluated {
                entry: sandbox.entry().unwrap()
            },
            SandboxEvent::Changed {
                uris: vec!["mem:///site/bg.png".into()]
            },
        ]
    );
    assert_eq!(
        sandbox.importer().dependency("mem:///site/bg.png").unwrap().content,
        "new bg"
    );
}

/// Index whose only image resolves slowly, so a reset can land mid-open.
fn slow_site() -> Arc<TestStrategy> {
    let strategy = Arc::new(
        site()
            .with_file(INDEX, "<img src=\"slow.png\">")
            .with_file("mem:///site/slow.png", "slow"),
    );
    strategy.delay("slow.png", 200);
    strategy
}

/// Start opening the index and fire a reset while the open is in flight.
async fn open_with_reset_in_flight(
    strategy: &Arc<TestStrategy>,
    sandbox: &Sandbox<Global>,
) -> (
    tokio::task::JoinHandle<live_sandbox::Result<()>>,
    tokio::task::JoinHandle<ResetOutcome>,
) {
    let open = tokio::spawn({
        let sandbox = sandbox.clone();
        async move { sandbox.open(mime::HTML_MIME_TYPE, INDEX, None).await }
    });
    wait_until(|| strategy.resolved().iter().any(|r| r == "slow.png")).await;

    let generation = sandbox.importer().generation();
    let reset = tokio::spawn({
        let sandbox = sandbox.clone();
        async move { sandbox.reset().await }
    });
    wait_until(|| sandbox.importer().generation() != generation).await;
    (open, reset)
}

#[tokio::test]
async fn test_open_overtaken_by_reset_still_commits() {
    let strategy = slow_site();
    let sandbox = sandbox(strategy.clone());
    let mut events = sandbox.subscribe();

    let (open, reset) = open_with_reset_in_flight(&strategy, &sandbox).await;
    open.await.unwrap().unwrap();
    assert_eq!(sandbox.entry().unwrap().file_path, INDEX);
    assert_eq!(sandbox.entry_dependency().unwrap().uri, INDEX);
    assert!(sandbox.importer().dependency("mem:///site/slow.png").is_some());

    assert_eq!(reset.await.unwrap(), ResetOutcome::Completed { runs: 1 });
    assert_eq!(sandbox.state(), SandboxState::Open);

    let mut evaluated = 0;
    let mut changed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SandboxEvent::Evaluated { .. } => evaluated += 1,
            SandboxEvent::Changed { .. } => changed += 1,
            SandboxEvent::ResetFailed { .. } => panic!("reset failed"),
        }
    }
    // one for the open, one for the reset's reopen
    assert_eq!((evaluated, changed), (2, 1));
}

#[tokio::test]
async fn test_open_overtaken_by_reset_fails_without_partial_state() {
    let strategy = slow_site();
    let sandbox = sandbox(strategy.clone());

    let (open, reset) = open_with_reset_in_flight(&strategy, &sandbox).await;
    strategy.set(INDEX, "<img src=\"http://[bad\">");

    let err = open.await.unwrap().unwrap_err();
    assert!(err.is_resolution());
    assert_eq!(sandbox.state(), SandboxState::Closed);
    assert!(sandbox.entry().is_none());
    assert!(sandbox.entry_dependency().is_none());

    assert_eq!(reset.await.unwrap(), ResetOutcome::Completed { runs: 1 });
    assert_eq!(sandbox.state(), SandboxState::Closed);
    assert!(sandbox.entry().is_none());
}

#[tokio::test]
async fn test_concurrent_opens_are_serialized() {
    let strategy = Arc::new(
        site()
            .with_file("mem:///site/about.html", "<p>about</p>"),
    );
    let sandbox = sandbox(strategy.clone());

    let (a, b) = tokio::join!(
        sandbox.open(mime::HTML_MIME_TYPE, INDEX, None),
        sandbox.open(mime::HTML_MIME_TYPE, "about.html", Some("mem:///site/")),
    );
    a.unwrap();
    b.unwrap();

    let entry = sandbox.entry().unwrap();
    assert_eq!(entry.file_path, "about.html");
    assert_eq!(entry.relative_path.as_deref(), Some("mem:///site/"));
    assert_eq!(
        sandbox.entry_dependency().unwrap().uri,
        "mem:///site/about.html"
    );
    // the index graph was pruned when about.html committed
    assert!(sandbox.importer().dependency("mem:///site/site.css").is_none());
}

#[tokio::test]
async fn test_file_backed_sandbox() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("css")).unwrap();
    std::fs::write(
        dir.path().join("index.html"),
        "<link rel=\"stylesheet\" href=\"css/site.css\">",
    )
    .unwrap();
    std::fs::write(dir.path().join("css/site.css"), "h1 { color: red }").unwrap();

    let config = SandboxConfig {
        root_dir: dir.path().to_string_lossy().into_owned(),
        ..Default::default()
    };
    let sandbox = Sandbox::from_config(&config, || ()).unwrap();
    sandbox
        .open(mime::HTML_MIME_TYPE, "index.html", None)
        .await
        .unwrap();

    let entry = sandbox.entry_dependency().unwrap();
    assert!(entry.uri.starts_with("file://"));
    assert!(entry.uri.ends_with("/index.html"));
    let transformed = entry.transformed_content.unwrap();
    assert!(transformed.contains("file://"));
    assert!(transformed.ends_with("/css/site.css\">"));
    assert_eq!(sandbox.importer().dependencies().len(), 2);
}

#[tokio::test]
async fn test_file_backed_sandbox_blocks_escapes_and_remote_origins() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("site");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(dir.path().join("secret.css"), "secret").unwrap();
    std::fs::write(root.join("escape.html"), "<link href=\"../secret.css\">").unwrap();
    std::fs::write(
        root.join("remote.html"),
        "<script src=\"https://cdn.example.com/app.js\"></script>",
    )
    .unwrap();

    let config = SandboxConfig {
        root_dir: root.to_string_lossy().into_owned(),
        ..Default::default()
    };
    let sandbox = Sandbox::from_config(&config, || ()).unwrap();

    let err = sandbox
        .open(mime::HTML_MIME_TYPE, "escape.html", None)
        .await
        .unwrap_err();
    assert!(err.is_resolution());
    assert!(err.to_string().contains("outside the allowed directory"));

    let err = sandbox
        .open(mime::HTML_MIME_TYPE, "remote.html", None)
        .await
        .unwrap_err();
    assert!(err.is_resolution());
    assert!(err.to_string().contains("not in the allowlist"));
    assert_eq!(sandbox.state(), SandboxState::Closed);
}

#[tokio::test]
async fn test_from_config_rejects_missing_root() {
    let config = SandboxConfig {
        root_dir: "/definitely/not/here".into(),
        ..Default::default()
    };
    let err = Sandbox::from_config(&config, || ()).unwrap_err();
    assert!(matches!(err, live_sandbox::SandboxError::Config(_)));
}
