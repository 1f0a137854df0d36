//! Preview sessions: one document bound to one surface.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, OptionFuture};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use url::Url;

use crate::config::Settings;
use crate::host::{Document, DocumentEvent, DocumentId, Host, Subscription};
use crate::render::{self, Diagnostic, Invocation, BASE_TAG_PLACEHOLDER};
use crate::schedule::{Action, Scheduler};
use crate::surface::{Surface, SurfaceOptions};

/// Bundled stylesheet applied to every rendering.
const STYLESHEET_ASSET: &str = "css/markdown.css";

/// Static resources referenced by every rendering of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resources {
    /// Base URI of the KaTeX distribution.
    pub katex: Url,
    /// URI of the stylesheet.
    pub stylesheet: Url,
}

/// A live preview of one document.
///
/// The session runs as its own task: it re-renders the document through the converter as the
/// document changes, and pushes the results to its surface. It ends when it is disposed, when the
/// document is closed, or when the user closes the surface. Dropping the handle disposes the
/// session.
#[derive(Debug)]
pub struct PreviewSession {
    document: DocumentId,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl PreviewSession {
    /// Opens a preview of `document` on a new surface created by `host`.
    ///
    /// The first rendering starts right away. Must be called from within a Tokio runtime.
    pub fn open(host: Arc<dyn Host>, document: Arc<dyn Document>) -> io::Result<PreviewSession> {
        let settings = host.settings();
        let path = document.path();
        let directory = path.as_deref().and_then(Path::parent).map(Path::to_owned);

        let mut local_resource_roots = host.workspace_folders();
        local_resource_roots.extend(directory.clone());

        let title = match path.as_deref().and_then(Path::file_name) {
            Some(name) => format!("Preview {}", name.to_string_lossy()),
            None => format!("Preview {}", document.id()),
        };

        let surface = host.create_surface(SurfaceOptions {
            title,
            local_resource_roots,
        })?;

        let base = path.as_deref().and_then(|path| surface.resource_uri(path));
        let resources = Resources {
            katex: settings.katex.clone(),
            stylesheet: surface.asset_uri(STYLESHEET_ASSET),
        };

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let id = document.id();

        let runner = Runner {
            subscription: host.subscribe(),
            closed_by_user: surface.closed_by_user(),
            scheduler: Scheduler::new(settings.minimum_wait_interval),
            host,
            document,
            surface,
            directory,
            base,
            resources,
            cancel: cancel.clone(),
            timer: None,
            in_flight: None,
        };

        let done = finished.clone();
        tokio::spawn(
            async move {
                runner.run().await;
                done.cancel();
            }
            .instrument(info_span!("preview", document = %id)),
        );

        Ok(PreviewSession {
            document: id,
            cancel,
            finished,
        })
    }

    /// The previewed document.
    pub fn document(&self) -> DocumentId {
        self.document
    }

    /// Returns `true` until the session is disposed or has ended on its own.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.finished.is_cancelled()
    }

    /// Ends the session and closes its surface. Calling this more than once has no further effect.
    ///
    /// An in-flight converter is killed and its result is never displayed.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            debug!(document = %self.document, "disposing preview");
            self.cancel.cancel();
        }
    }

    /// Waits until the session has ended and released its surface.
    pub async fn closed(&self) {
        self.finished.cancelled().await
    }
}

impl Drop for PreviewSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Reads the runtime's clock, which follows `tokio::time::pause`.
fn now() -> Instant {
    time::Instant::now().into_std()
}

type Render = BoxFuture<'static, Result<Vec<u8>, Diagnostic>>;

/// The task behind a [`PreviewSession`]. All scheduler transitions happen here, one at a time.
struct Runner {
    host: Arc<dyn Host>,
    document: Arc<dyn Document>,
    surface: Box<dyn Surface>,
    subscription: Subscription,
    closed_by_user: CancellationToken,
    cancel: CancellationToken,
    scheduler: Scheduler,
    directory: Option<PathBuf>,
    base: Option<Url>,
    resources: Resources,
    timer: Option<Instant>,
    in_flight: Option<Render>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Disposed,
    DocumentClosed,
    ClosedByUser,
    /// The host dropped its event channel. [`Workspace`](crate::host::Workspace) never does
    /// while a session holds it; other hosts may.
    HostGone,
}

impl Runner {
    async fn run(mut self) {
        info!(path = ?self.document.path(), "preview opened");

        // Nothing has been rendered yet, so the first change is never throttled.
        let action = self.scheduler.document_changed(now());
        self.apply(action);

        let exit = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break Exit::Disposed,
                _ = self.closed_by_user.cancelled() => break Exit::ClosedByUser,
                event = self.subscription.recv() => {
                    if let Some(exit) = self.handle_event(event) {
                        break exit;
                    }
                }
                _ = time::sleep_until(time::Instant::from_std(self.timer.unwrap_or_else(now))),
                    if self.timer.is_some() =>
                {
                    self.timer = None;
                    let action = self.scheduler.timer_fired(now());
                    self.apply(action);
                }
                Some(result) = OptionFuture::from(self.in_flight.as_mut()),
                    if self.in_flight.is_some() =>
                {
                    self.in_flight = None;
                    self.complete(result);
                }
            }
        };

        self.scheduler.dispose();
        self.timer = None;

        if self.in_flight.take().is_some() {
            debug!("discarding in-flight render");
        }

        // A surface the user closed is already gone.
        if exit != Exit::ClosedByUser {
            self.surface.close();
        }

        info!(?exit, "preview closed");
    }

    fn handle_event(&mut self, event: Option<DocumentEvent>) -> Option<Exit> {
        let id = self.document.id();

        match event {
            Some(DocumentEvent::Changed(changed)) if changed == id => {
                let action = self.scheduler.document_changed(now());
                self.apply(action);
            }
            Some(DocumentEvent::Closed(closed)) if closed == id => return Some(Exit::DocumentClosed),
            Some(DocumentEvent::Missed) => {
                if self.document.is_closed() {
                    return Some(Exit::DocumentClosed);
                }

                let action = self.scheduler.document_changed(now());
                self.apply(action);
            }
            Some(_) => (),
            None => return Some(Exit::HostGone),
        }

        None
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::None => (),
            Action::Defer(until) => self.timer = Some(until),
            Action::Start => {
                self.timer = None;
                self.in_flight = Some(self.start_render());
            }
        }
    }

    fn start_render(&mut self) -> Render {
        let settings = self.host.settings();
        self.scheduler
            .set_minimum_interval(settings.minimum_wait_interval);

        // Read the text now rather than when the change arrived, so coalesced changes all make
        // it into this rendering.
        let text = self.document.text();
        let args = converter_args(&settings, &self.resources, self.base.is_some());
        let directory = self.directory.clone();

        info!(text_bytes = text.len(), "starting render");

        async move {
            let args = args?;
            let input = read_input(&settings, directory.as_deref(), text).await?;

            let mut invocation = Invocation::new(&settings.pandoc)
                .args(args)
                .input(input)
                .timeout(settings.timeout);

            if let Some(directory) = directory {
                invocation = invocation.current_dir(directory);
            }

            invocation.run().await
        }
        .boxed()
    }

    fn complete(&mut self, result: Result<Vec<u8>, Diagnostic>) {
        if self.cancel.is_cancelled() || self.closed_by_user.is_cancelled() {
            debug!("discarding render for a closing preview");
            return;
        }

        let action = match self.scheduler.invocation_completed(now()) {
            Some(action) => action,
            None => return,
        };

        let html = match result {
            Ok(output) => {
                debug!(output_bytes = output.len(), "render finished");
                render::transform(&output, self.base.as_ref())
            }
            Err(diagnostic) => {
                info!(kind = ?diagnostic.kind(), error = %diagnostic, "render failed");
                render::render_error(&diagnostic)
            }
        };

        self.surface.set_content(html);
        self.apply(action);
    }
}

/// Builds the converter's argument list.
///
/// Extra arguments from the settings come first, followed by the arguments every preview needs:
/// standalone output, the KaTeX base and the stylesheet. When the rendering gets a base URI, the
/// converter is also asked to emit [`BASE_TAG_PLACEHOLDER`] into the document head.
pub fn converter_args(
    settings: &Settings,
    resources: &Resources,
    with_base: bool,
) -> Result<Vec<String>, Diagnostic> {
    let mut args = settings.extra_arguments().map_err(Diagnostic::Arguments)?;

    let mut katex = resources.katex.to_string();
    if !katex.ends_with('/') {
        katex.push('/');
    }

    args.push(String::from("-s"));
    args.push(format!("--katex={}", katex));
    args.push(format!("--css={}", resources.stylesheet));

    if with_base {
        args.push(format!("--metadata=header-includes:{}", BASE_TAG_PLACEHOLDER));
    }

    Ok(args)
}

/// Resolves an extra input file against the document's directory.
pub fn resolve_input_file(file: &Path, directory: Option<&Path>) -> PathBuf {
    match directory {
        Some(directory) if file.is_relative() => directory.join(file),
        _ => file.to_owned(),
    }
}

/// Assembles the converter input: the extra input files in order, then the document text.
pub async fn read_input(
    settings: &Settings,
    directory: Option<&Path>,
    text: String,
) -> Result<Vec<u8>, Diagnostic> {
    if settings.extra_pandoc_input_files.is_empty() {
        return Ok(text.into_bytes());
    }

    let mut input = vec![];

    for file in &settings.extra_pandoc_input_files {
        let path = resolve_input_file(file, directory);
        match tokio::fs::read(&path).await {
            Ok(contents) => input.extend(contents),
            Err(source) => return Err(Diagnostic::InputFile { path, source }),
        }
    }

    input.extend(text.into_bytes());
    Ok(input)
}

/// The "open preview" command.
///
/// Keeps at most one session per key. Opening a preview under a key that already has one disposes
/// the old session first. Sessions that ended on their own are forgotten the next time a preview
/// is opened.
pub struct Previewer<K = ()> {
    host: Arc<dyn Host>,
    sessions: HashMap<K, PreviewSession>,
}

impl<K> Previewer<K>
where
    K: Eq + Hash + fmt::Debug,
{
    /// Creates a previewer with no open sessions.
    pub fn new(host: Arc<dyn Host>) -> Previewer<K> {
        Previewer {
            host,
            sessions: HashMap::new(),
        }
    }

    /// Opens a preview of the host's active document under `key`.
    ///
    /// Returns `Ok(None)` without touching existing sessions if there is no active document.
    pub fn open_preview(&mut self, key: K) -> io::Result<Option<&PreviewSession>> {
        let document = match self.host.active_document() {
            Some(document) => document,
            None => {
                debug!("no active document to preview");
                return Ok(None);
            }
        };

        self.sessions.retain(|_, session| session.is_active());

        if let Some(previous) = self.sessions.remove(&key) {
            debug!(?key, "replacing existing preview");
            previous.dispose();
        }

        let session = PreviewSession::open(Arc::clone(&self.host), document)?;
        Ok(Some(self.sessions.entry(key).or_insert(session)))
    }

    /// Returns the session open under `key`, if it is still active.
    pub fn session(&self, key: &K) -> Option<&PreviewSession> {
        self.sessions.get(key).filter(|session| session.is_active())
    }

    /// Disposes the session under `key`. Returns `false` if there was none.
    pub fn close(&mut self, key: &K) -> bool {
        match self.sessions.remove(key) {
            Some(session) => {
                session.dispose();
                true
            }
            None => false,
        }
    }

    /// Disposes every session.
    pub fn deactivate(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.dispose();
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for Previewer<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Previewer")
            .field("host", &"(dyn Host)")
            .field("sessions", &self.sessions)
            .finish()
    }
}
