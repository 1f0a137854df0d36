#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, timeout};

use pandoc_preview::host::Subscription;
use pandoc_preview::{
    Document, Host, PreviewSession, Previewer, Settings, Surface, SurfaceOptions, Workspace,
};

use crate::{fake_converter, recording_workspace, wait_for};

const ECHO: &str = "cat\n";

#[tokio::test]
async fn initial_render() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(
        dir.path(),
        "printf '<p>'; cat; printf '</p>'\n",
    ));

    let document = workspace.open(None, "hello");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert_eq!(recorder.contents(), ["<p>hello</p>"]);

    let surfaces = recorder.surfaces();
    assert_eq!(surfaces.len(), 1);
    assert_eq!(surfaces[0].title, "Preview #1");
    assert!(surfaces[0].local_resource_roots.is_empty());

    Ok(())
}

#[tokio::test]
async fn converter_arguments() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), "printf '%s\\n' \"$@\"\n"));

    let document = workspace.open(None, "");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);

    let args = recorder.contents().remove(0);
    let args = args.lines().collect::<Vec<_>>();
    assert_eq!(
        args,
        [
            "-s",
            "--katex=https://cdn.jsdelivr.net/npm/katex@0.16.11/dist/",
            "--css=https://preview.test/assets/css/markdown.css",
        ]
    );

    Ok(())
}

#[tokio::test]
async fn coalesces_bursts() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let calls = dir.path().join("calls");
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(Settings {
        minimum_wait_interval: Duration::from_millis(500),
        ..fake_converter(
            dir.path(),
            &format!("echo call >> '{}'\ncat\n", calls.display()),
        )
    });

    let document = workspace.open(None, "v0");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document.clone())?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);

    for text in ["v1", "v2", "v3"] {
        workspace.edit(document.id(), text);
        time::sleep(Duration::from_millis(10)).await;
    }

    assert!(wait_for(|| recorder.contents().len() == 2).await);

    // Nothing else is pending.
    time::sleep(Duration::from_millis(700)).await;

    assert_eq!(recorder.contents(), ["v0", "v3"]);
    assert_eq!(std::fs::read_to_string(&calls)?.lines().count(), 2);

    let timestamps = recorder.timestamps();
    assert!(timestamps[1] - timestamps[0] >= Duration::from_millis(500));

    Ok(())
}

#[tokio::test]
async fn edit_during_render_rerenders_latest() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), "sleep 0.3\ncat\n"));

    let document = workspace.open(None, "first");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document.clone())?;

    time::sleep(Duration::from_millis(50)).await;
    workspace.edit(document.id(), "second");
    workspace.edit(document.id(), "third");

    assert!(wait_for(|| recorder.contents().len() == 2).await);
    assert_eq!(recorder.contents(), ["first", "third"]);

    Ok(())
}

#[tokio::test]
async fn failure_shows_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(
        dir.path(),
        "echo 'unexpected <input>' >&2\nexit 3\n",
    ));

    let document = workspace.open(None, "# Title");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document.clone())?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);

    let html = recorder.contents().remove(0);
    assert!(html.starts_with("<p>Error executing pandoc:</p>\n<pre>"));
    assert!(html.contains("unexpected &lt;input&gt;"));

    // A failure does not end the session.
    assert!(session.is_active());
    workspace.edit(document.id(), "# Again");
    assert!(wait_for(|| recorder.contents().len() == 2).await);

    Ok(())
}

#[tokio::test]
async fn missing_converter() -> anyhow::Result<()> {
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(Settings {
        pandoc: PathBuf::from("/nonexistent/pandoc"),
        ..Settings::default()
    });

    let document = workspace.open(None, "text");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert!(recorder.contents()[0].contains("failed to spawn converter"));

    Ok(())
}

#[tokio::test]
async fn timeout_shows_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(Settings {
        timeout: Duration::from_millis(200),
        ..fake_converter(dir.path(), "exec sleep 5\n")
    });

    let document = workspace.open(None, "text");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert!(recorder.contents()[0].contains("timed out after 200ms"));

    Ok(())
}

#[tokio::test]
async fn dispose_discards_in_flight_render() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), "sleep 0.5\ncat\n"));

    let document = workspace.open(None, "text");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    time::sleep(Duration::from_millis(100)).await;
    session.dispose();
    assert!(!session.is_active());

    timeout(Duration::from_secs(5), session.closed()).await?;
    time::sleep(Duration::from_millis(700)).await;

    assert!(recorder.contents().is_empty());
    assert_eq!(recorder.closes(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dispose_wins_over_finished_render() -> anyhow::Result<()> {
    // The render times out at the same instant the session is disposed.
    for _ in 0..20 {
        let dir = tempfile::tempdir()?;
        let (workspace, recorder) = recording_workspace();
        workspace.set_settings(Settings {
            timeout: Duration::from_millis(1000),
            ..fake_converter(dir.path(), "exec sleep 5\n")
        });

        let document = workspace.open(None, "text");
        let session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

        time::sleep(Duration::from_millis(1000)).await;
        let shown = recorder.contents().len();

        session.dispose();
        session.closed().await;

        assert_eq!(recorder.contents().len(), shown);
        assert_eq!(recorder.closes(), 1);
    }

    Ok(())
}

#[tokio::test]
async fn malformed_arguments_show_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    let settings = fake_converter(dir.path(), ECHO);
    workspace.set_settings(Settings {
        extra_pandoc_arguments: format!(
            "{} --metadata=title:'My Notes",
            settings.extra_pandoc_arguments
        ),
        ..settings
    });

    let document = workspace.open(None, "text");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert!(recorder.contents()[0].contains("invalid extra pandoc arguments"));

    Ok(())
}

#[tokio::test]
async fn quoted_argument_reaches_converter() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    let settings = fake_converter(dir.path(), "printf '%s\\n' \"$1\"\n");
    workspace.set_settings(Settings {
        extra_pandoc_arguments: format!(
            "{} --metadata=title:'My Notes'",
            settings.extra_pandoc_arguments
        ),
        ..settings
    });

    let document = workspace.open(None, "text");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert_eq!(recorder.contents(), ["--metadata=title:My Notes\n"]);

    Ok(())
}

#[tokio::test]
async fn dispose_twice() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let document = workspace.open(None, "text");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    session.dispose();
    session.dispose();
    timeout(Duration::from_secs(5), session.closed()).await?;

    drop(session);
    time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.closes(), 1);

    Ok(())
}

#[tokio::test]
async fn drop_disposes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let document = workspace.open(None, "text");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document)?;
    drop(session);

    assert!(wait_for(|| recorder.closes() == 1).await);

    Ok(())
}

#[tokio::test]
async fn user_close_ends_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let document = workspace.open(None, "text");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document.clone())?;
    assert!(wait_for(|| recorder.contents().len() == 1).await);

    recorder.close_by_user();
    timeout(Duration::from_secs(5), session.closed()).await?;

    assert!(!session.is_active());

    // The surface is already gone, so the session does not close it again.
    session.dispose();
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.closes(), 0);

    // Edits after closing are ignored.
    workspace.edit(document.id(), "more");
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.contents().len(), 1);

    Ok(())
}

#[tokio::test]
async fn document_close_ends_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let document = workspace.open(None, "text");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document.clone())?;
    assert!(wait_for(|| recorder.contents().len() == 1).await);

    assert!(workspace.close(document.id()));
    timeout(Duration::from_secs(5), session.closed()).await?;

    assert!(!session.is_active());
    assert_eq!(recorder.closes(), 1);

    Ok(())
}

#[tokio::test]
async fn other_documents_are_ignored() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let document = workspace.open(None, "mine");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document)?;
    assert!(wait_for(|| recorder.contents().len() == 1).await);

    let other = workspace.open(None, "theirs");
    workspace.edit(other.id(), "still theirs");
    workspace.close(other.id());

    time::sleep(Duration::from_millis(200)).await;
    assert!(session.is_active());
    assert_eq!(recorder.contents(), ["mine"]);

    Ok(())
}

#[tokio::test]
async fn extra_input_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("header.md"), "HEADER\n")?;

    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(Settings {
        extra_pandoc_input_files: vec![PathBuf::from("header.md")],
        ..fake_converter(dir.path(), ECHO)
    });

    let document = workspace.open(Some(dir.path().join("doc.md")), "body");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert_eq!(recorder.contents(), ["HEADER\nbody"]);

    Ok(())
}

#[tokio::test]
async fn missing_input_file_shows_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(Settings {
        extra_pandoc_input_files: vec![PathBuf::from("missing.md")],
        ..fake_converter(dir.path(), ECHO)
    });

    let document = workspace.open(Some(dir.path().join("doc.md")), "body");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert!(recorder.contents()[0].starts_with("<p>Error executing pandoc:</p>"));
    assert!(recorder.contents()[0].contains("missing.md"));

    Ok(())
}

#[tokio::test]
async fn base_tag_points_at_document() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(
        dir.path(),
        r#"for arg in "$@"; do
  case "$arg" in
    --metadata=header-includes:*) printf '<head>%s</head>' "${arg#--metadata=header-includes:}" ;;
  esac
done
cat
"#,
    ));

    let document = workspace.open(Some(dir.path().join("doc.md")), "body");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert_eq!(
        recorder.contents(),
        [r#"<head><base href="https://preview.test/root/0/doc.md"></head>body"#]
    );

    let surfaces = recorder.surfaces();
    assert_eq!(surfaces[0].title, "Preview doc.md");
    assert_eq!(surfaces[0].local_resource_roots, [dir.path().to_owned()]);

    Ok(())
}

#[tokio::test]
async fn workspace_folders_are_resource_roots() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let folder = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));
    workspace.add_folder(folder.path());

    let document = workspace.open(Some(dir.path().join("doc.md")), "body");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.surfaces().len() == 1).await);
    assert_eq!(
        recorder.surfaces()[0].local_resource_roots,
        [folder.path().to_owned(), dir.path().to_owned()]
    );

    Ok(())
}

#[tokio::test]
async fn converter_runs_in_document_directory() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("sibling.txt"), "next to the document")?;

    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), "cat sibling.txt\n"));

    let document = workspace.open(Some(dir.path().join("doc.md")), "");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    assert!(wait_for(|| recorder.contents().len() == 1).await);
    assert_eq!(recorder.contents(), ["next to the document"]);

    Ok(())
}

#[tokio::test]
async fn previewer_replaces_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let mut previewer = Previewer::new(Arc::new(workspace.clone()));
    assert!(previewer.open_preview(())?.is_none());

    let first = workspace.open(None, "first");
    let id = previewer.open_preview(())?.unwrap().document();
    assert_eq!(id, first.id());

    let second = workspace.open(None, "second");
    let id = previewer.open_preview(())?.unwrap().document();
    assert_eq!(id, second.id());

    assert!(wait_for(|| recorder.closes() == 1).await);
    assert_eq!(recorder.surfaces().len(), 2);
    assert!(previewer.session(&()).unwrap().is_active());

    previewer.deactivate();
    assert!(previewer.session(&()).is_none());
    assert!(wait_for(|| recorder.closes() == 2).await);

    Ok(())
}

#[tokio::test]
async fn previewer_keys_are_independent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let mut previewer = Previewer::new(Arc::new(workspace.clone()));

    workspace.open(None, "left");
    previewer.open_preview("left")?;
    workspace.open(None, "right");
    previewer.open_preview("right")?;

    assert!(wait_for(|| recorder.contents().len() == 2).await);
    assert_eq!(recorder.closes(), 0);

    assert!(previewer.close(&"left"));
    assert!(!previewer.close(&"left"));
    assert!(wait_for(|| recorder.closes() == 1).await);
    assert!(previewer.session(&"right").is_some());

    Ok(())
}

/// A host whose event channel is already gone.
struct DetachedHost(Workspace);

impl Host for DetachedHost {
    fn active_document(&self) -> Option<Arc<dyn Document>> {
        self.0.active_document()
    }

    fn settings(&self) -> Settings {
        self.0.settings()
    }

    fn workspace_folders(&self) -> Vec<PathBuf> {
        self.0.workspace_folders()
    }

    fn subscribe(&self) -> Subscription {
        let (_, rx) = broadcast::channel(1);
        Subscription::new(rx)
    }

    fn create_surface(&self, options: SurfaceOptions) -> std::io::Result<Box<dyn Surface>> {
        self.0.create_surface(options)
    }
}

#[tokio::test]
async fn host_going_away_ends_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, recorder) = recording_workspace();
    workspace.set_settings(fake_converter(dir.path(), ECHO));

    let document = workspace.open(None, "text");
    let session = PreviewSession::open(Arc::new(DetachedHost(workspace.clone())), document)?;

    timeout(Duration::from_secs(5), session.closed()).await?;

    assert!(!session.is_active());
    assert_eq!(recorder.closes(), 1);

    Ok(())
}
