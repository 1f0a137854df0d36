use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        self,
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Extension,
    },
    http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use handlebars::Handlebars;
use include_dir::{include_dir, Dir};
use serde::Serialize;
use tokio::sync::watch::Receiver;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

static STATIC_FILES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/static");

/// Message the preview page sends when the user closes it.
const CLOSE_MESSAGE: &str = "close";

/// State shared by every request to a browser surface.
#[derive(Debug)]
pub(crate) struct Page {
    pub(crate) title: String,
    pub(crate) roots: Vec<PathBuf>,
    pub(crate) closed_by_user: CancellationToken,
}

pub(crate) async fn serve_asset(extract::Path(path): extract::Path<PathBuf>) -> impl IntoResponse {
    let path = path.strip_prefix("/").unwrap_or(&path);

    let file = match STATIC_FILES.get_file(path) {
        Some(file) => file,
        None => return Err((StatusCode::NOT_FOUND, "file not found")),
    };

    let mime = mime_guess::from_path(path);
    let content_type = match HeaderValue::from_str(mime.first_or_octet_stream().as_ref()) {
        Ok(content_type) => content_type,
        Err(_) => return Err((StatusCode::INTERNAL_SERVER_ERROR, "invalid content type")),
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, content_type);

    Ok((headers, file.contents()))
}

pub(crate) async fn websocket_handler(
    ws: Option<WebSocketUpgrade>,
    Extension(page): Extension<Arc<Page>>,
    Extension(html_rx): Extension<Receiver<String>>,
) -> Response {
    if let Some(ws) = ws {
        let closed_by_user = page.closed_by_user.clone();
        ws.on_upgrade(|ws| handle_websocket(ws, html_rx, closed_by_user))
    } else {
        let html = Handlebars::new().render_template(
            include_str!("../templates/preview.html"),
            &TemplateData { title: &page.title },
        );

        match html {
            Ok(html) => (StatusCode::OK, Html(html)).into_response(),
            Err(e) => {
                warn!(error = %e, "failed to render preview page");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

async fn handle_websocket(
    socket: WebSocket,
    mut html_rx: Receiver<String>,
    closed_by_user: CancellationToken,
) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            changed = html_rx.changed() => {
                if changed.is_err() {
                    break;
                }

                let html = html_rx.borrow().clone();
                debug!(html_bytes = html.len(), "pushing new html");
                if sender.send(AxumMessage::Text(html)).await.is_err() {
                    return;
                }
            }
            message = receiver.next() => match message {
                Some(Ok(AxumMessage::Text(text))) if text == CLOSE_MESSAGE => {
                    info!("preview closed by user");
                    closed_by_user.cancel();
                }
                Some(Ok(_)) => (),
                Some(Err(_)) | None => return,
            },
        }
    }

    let _ = sender.send(AxumMessage::Close(None)).await;
}

pub(crate) async fn serve_local_file(
    extract::Path((index, _)): extract::Path<(usize, String)>,
    Extension(page): Extension<Arc<Page>>,
    mut req: Request<Body>,
) -> Response {
    let root = match page.roots.get(index) {
        Some(root) => root.clone(),
        None => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };

    // Keep the request's own percent-encoding; only the root prefix is stripped.
    let prefix = format!("/__root/{}", index);
    let uri = match req.uri().path().strip_prefix(&prefix).map(str::parse::<Uri>) {
        Some(Ok(uri)) => uri,
        _ => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };
    *req.uri_mut() = uri;

    match ServeDir::new(root).oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct TemplateData<'a> {
    title: &'a str,
}
