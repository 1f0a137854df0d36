#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_tungstenite::tungstenite::Message;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::net::lookup_host;
use tokio::time::timeout;
use url::Url;

use pandoc_preview::{BrowserSurface, Document, PreviewSession, Surface, Workspace};

use crate::{fake_converter, wait_for};

/// A workspace that serves its previews over HTTP, and the URL of the latest one.
async fn browser_workspace() -> anyhow::Result<(Workspace, Arc<Mutex<Option<Url>>>)> {
    let addr: SocketAddr = lookup_host("localhost:0").await?.next().unwrap();
    let url = Arc::new(Mutex::new(None));

    let workspace = Workspace::new({
        let url = Arc::clone(&url);
        move |options| {
            let surface = BrowserSurface::bind(&addr, options)?;
            *url.lock().unwrap() = Some(surface.url().clone());
            Ok(Box::new(surface) as Box<dyn Surface>)
        }
    });

    Ok((workspace, url))
}

#[tokio::test]
async fn live_preview_over_websocket() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, url) = browser_workspace().await?;
    workspace.set_settings(fake_converter(
        dir.path(),
        "printf '<p>'; cat; printf '</p>'\n",
    ));

    let document = workspace.open(Some(dir.path().join("notes.md")), "first");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document.clone())?;

    let url = url.lock().unwrap().clone().unwrap();

    let page = reqwest::get(url.as_str()).await?.text().await?;
    assert!(page.contains("<title>Preview notes.md</title>"));

    let mut ws_url = url.clone();
    ws_url.set_scheme("ws").unwrap();
    let (mut websocket, _) = async_tungstenite::tokio::connect_async(ws_url.as_str()).await?;

    let message = timeout(Duration::from_secs(5), websocket.next())
        .await?
        .unwrap()?;
    assert_eq!(message.to_text()?, "<p>first</p>");

    workspace.edit(document.id(), "second");

    let message = timeout(Duration::from_secs(5), websocket.next())
        .await?
        .unwrap()?;
    assert_eq!(message.to_text()?, "<p>second</p>");

    session.dispose();
    timeout(Duration::from_secs(5), session.closed()).await?;

    let message = timeout(Duration::from_secs(5), websocket.next()).await?;
    assert!(matches!(message, Some(Ok(Message::Close(_))) | None));

    Ok(())
}

#[tokio::test]
async fn document_directory_is_served() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("figure.svg"), "<svg/>")?;

    let (workspace, url) = browser_workspace().await?;
    workspace.set_settings(fake_converter(dir.path(), "cat\n"));

    let document = workspace.open(Some(dir.path().join("notes.md")), "");
    let _session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    let url = url.lock().unwrap().clone().unwrap();

    let res = reqwest::get(url.join("__root/0/figure.svg")?).await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "<svg/>");

    let res = reqwest::get(url.join("__root/1/figure.svg")?).await?;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn closing_the_page_ends_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (workspace, url) = browser_workspace().await?;
    workspace.set_settings(fake_converter(dir.path(), "cat\n"));

    let document = workspace.open(None, "text");
    let session = PreviewSession::open(Arc::new(workspace.clone()), document)?;

    let mut ws_url = url.lock().unwrap().clone().unwrap();
    ws_url.set_scheme("ws").unwrap();
    let (mut websocket, _) = async_tungstenite::tokio::connect_async(ws_url.as_str()).await?;

    websocket.send(Message::Text(String::from("close"))).await?;

    timeout(Duration::from_secs(5), session.closed()).await?;
    assert!(wait_for(|| !session.is_active()).await);

    Ok(())
}
