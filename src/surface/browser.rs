//! A surface that displays previews in a web browser.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::{Component, Path};
use std::process::Stdio;
use std::sync::Arc;

use axum::{extract::Extension, routing::get, Router};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::watch::{self, Sender};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use url::Url;

use super::{Surface, SurfaceOptions};
use crate::service::{self, Page};

/// Live preview page served over HTTP.
///
/// Listens for HTTP connections and serves a page that displays the latest rendered HTML. The
/// page opens a websocket connection back to the surface, which pushes every new rendering to it.
/// Bundled assets are served under `/__/`, and files below the local resource roots under
/// `/__root/{n}/`. Nothing else on the filesystem is reachable.
///
/// The surface is asynchronous, and assumes that a `tokio` runtime is in use.
#[derive(Debug)]
pub struct BrowserSurface {
    addr: SocketAddr,
    base: Url,
    page: Arc<Page>,
    tx: Option<Sender<String>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl BrowserSurface {
    /// Binds the surface to a specified address `addr`.
    ///
    /// Binding to port 0 will request a port assignment from the OS. Use [`addr()`][Self::addr]
    /// to determine what port was assigned.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: &SocketAddr, options: SurfaceOptions) -> io::Result<BrowserSurface> {
        let (tx, rx) = watch::channel(String::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let page = Arc::new(Page {
            title: options.title,
            roots: options.local_resource_roots,
            closed_by_user: CancellationToken::new(),
        });

        let app = Router::new()
            .route("/", get(service::websocket_handler))
            .route("/__/*path", get(service::serve_asset))
            .route("/__root/:index/*path", get(service::serve_local_file))
            .layer(Extension(Arc::clone(&page)))
            .layer(Extension(rx))
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let http_server = axum::Server::from_tcp(listener)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .serve(app.into_make_service());

        let addr = http_server.local_addr();
        let base = Url::parse(&format!("http://{}/", addr))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        info!(%addr, title = %page.title, "preview surface listening");

        let http_server = http_server.with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });

        tokio::spawn(http_server);

        Ok(BrowserSurface {
            addr,
            base,
            page,
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Returns the socket address that the surface is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the URL of the preview page.
    pub fn url(&self) -> &Url {
        &self.base
    }

    /// Returns `true` until the surface is closed.
    pub fn is_open(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Opens the user's default browser with the surface's URL in the background.
    ///
    /// This function uses platform-specific utilities to determine the browser. The following
    /// platforms are supported:
    ///
    /// | Platform | Program    |
    /// | -------- | ---------- |
    /// | Linux    | `xdg-open` |
    /// | OS X     | `open -g`  |
    /// | Windows  | `explorer` |
    pub fn open_browser(&self) -> io::Result<()> {
        let command = if cfg!(target_os = "macos") {
            let mut command = Command::new("open");
            command.arg("-g");
            command
        } else if cfg!(target_os = "windows") {
            Command::new("explorer")
        } else {
            Command::new("xdg-open")
        };

        self.open_specific_browser(command)
    }

    /// Opens a browser with a specified command. The URL of the surface will be appended to the
    /// command as an argument.
    pub fn open_specific_browser(&self, mut command: Command) -> io::Result<()> {
        command.arg(self.base.as_str());

        command.stdout(Stdio::null()).stderr(Stdio::null());

        info!("spawning browser: {:?}", command);
        command.spawn()?;
        Ok(())
    }

    fn uri_with_segments<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();

        if let Ok(mut path) = url.path_segments_mut() {
            path.clear().extend(segments);
        }

        url
    }
}

impl Surface for BrowserSurface {
    fn set_content(&mut self, html: String) {
        if let Some(tx) = &self.tx {
            debug!(html_bytes = html.len(), "publishing html");
            tx.send_replace(html);
        }
    }

    fn closed_by_user(&self) -> CancellationToken {
        self.page.closed_by_user.clone()
    }

    fn close(&mut self) {
        // Dropping the sender ends every websocket connection.
        self.tx = None;

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            info!(addr = %self.addr, "closing preview surface");
            let _ = shutdown_tx.send(());
        }
    }

    fn resource_uri(&self, path: &Path) -> Option<Url> {
        let (index, relative) = self
            .page
            .roots
            .iter()
            .enumerate()
            .find_map(|(index, root)| path.strip_prefix(root).ok().map(|rel| (index, rel)))?;

        let index = index.to_string();
        let mut segments = vec![String::from("__root"), index];

        for component in relative.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                _ => return None,
            }
        }

        Some(self.uri_with_segments(segments.iter().map(String::as_str)))
    }

    fn asset_uri(&self, asset: &str) -> Url {
        self.uri_with_segments(
            std::iter::once("__").chain(asset.split('/').filter(|part| !part.is_empty())),
        )
    }
}
