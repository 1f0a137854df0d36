//! The editing host a preview is embedded in.
//!
//! A host owns the document buffers, tells previews when documents change or close, supplies
//! configuration and creates the surfaces previews render into. [`Workspace`] is a small
//! in-process host that is enough for the command line front-end and for tests.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::surface::{Surface, SurfaceOptions};

const EVENT_CAPACITY: usize = 64;

/// Identity of a document, stable for as long as the host keeps it open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Creates an identifier from a raw host-assigned value.
    pub const fn new(raw: u64) -> DocumentId {
        DocumentId(raw)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A document open in the host.
pub trait Document: Send + Sync {
    /// The document's identity.
    fn id(&self) -> DocumentId;

    /// The current text. Called whenever a render starts.
    fn text(&self) -> String;

    /// The local file backing this document, if any. Unsaved and virtual documents have none.
    fn path(&self) -> Option<PathBuf>;

    /// Whether the host has closed the document.
    fn is_closed(&self) -> bool;
}

/// A notification about documents in the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEvent {
    /// The text of the document changed.
    Changed(DocumentId),
    /// The document was closed.
    Closed(DocumentId),
    /// The subscriber fell behind and some notifications were lost. Any document may have changed
    /// or closed in the meantime.
    Missed,
}

/// A live registration for [`DocumentEvent`]s.
///
/// Dropping the subscription releases it.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<DocumentEvent>,
}

impl Subscription {
    /// Wraps the receiving end of a broadcast channel of document events.
    pub fn new(rx: broadcast::Receiver<DocumentEvent>) -> Subscription {
        Subscription { rx }
    }

    /// Waits for the next event. Returns `None` once the host has gone away.
    pub async fn recv(&mut self) -> Option<DocumentEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "document subscription lagged");
                Some(DocumentEvent::Missed)
            }
            Err(RecvError::Closed) => None,
        }
    }
}

/// Everything a preview needs from its host.
pub trait Host: Send + Sync {
    /// The document the user is currently working in.
    fn active_document(&self) -> Option<Arc<dyn Document>>;

    /// The current preview settings.
    fn settings(&self) -> Settings;

    /// Local directories the user has opened. Surfaces may expose files under them.
    fn workspace_folders(&self) -> Vec<PathBuf>;

    /// Registers for document change and close notifications.
    fn subscribe(&self) -> Subscription;

    /// Creates a new surface to display a preview in.
    fn create_surface(&self, options: SurfaceOptions) -> io::Result<Box<dyn Surface>>;
}

/// A document held in memory by a [`Workspace`].
#[derive(Debug)]
pub struct TextDocument {
    id: DocumentId,
    path: Option<PathBuf>,
    text: RwLock<String>,
    closed: AtomicBool,
}

impl Document for TextDocument {
    fn id(&self) -> DocumentId {
        self.id
    }

    fn text(&self) -> String {
        self.text.read().unwrap().clone()
    }

    fn path(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

type SurfaceFactory = dyn Fn(SurfaceOptions) -> io::Result<Box<dyn Surface>> + Send + Sync;

/// An in-process [`Host`].
///
/// Cloning a workspace yields another handle to the same documents.
///
/// ```
/// use pandoc_preview::host::{Document, Workspace};
///
/// let workspace = Workspace::new(|_options| {
///     Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no surfaces here"))
/// });
///
/// let document = workspace.open(None, "# Draft");
/// workspace.edit(document.id(), "# Final");
/// assert_eq!(document.text(), "# Final");
/// ```
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<Inner>,
}

struct Inner {
    documents: RwLock<HashMap<DocumentId, Arc<TextDocument>>>,
    active: RwLock<Option<DocumentId>>,
    folders: RwLock<Vec<PathBuf>>,
    settings: RwLock<Settings>,
    events: broadcast::Sender<DocumentEvent>,
    next_id: AtomicU64,
    surfaces: Box<SurfaceFactory>,
}

impl Workspace {
    /// Creates an empty workspace that builds surfaces with `surfaces`.
    pub fn new<F>(surfaces: F) -> Workspace
    where
        F: Fn(SurfaceOptions) -> io::Result<Box<dyn Surface>> + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Workspace {
            inner: Arc::new(Inner {
                documents: RwLock::default(),
                active: RwLock::default(),
                folders: RwLock::default(),
                settings: RwLock::default(),
                events,
                next_id: AtomicU64::new(1),
                surfaces: Box::new(surfaces),
            }),
        }
    }

    /// Opens a document with the given text and makes it the active one.
    ///
    /// `path` is the local file backing the document, if there is one.
    pub fn open(&self, path: Option<PathBuf>, text: impl Into<String>) -> Arc<TextDocument> {
        let id = DocumentId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        let document = Arc::new(TextDocument {
            id,
            path,
            text: RwLock::new(text.into()),
            closed: AtomicBool::new(false),
        });

        debug!(document = %id, path = ?document.path, "document opened");

        self.inner
            .documents
            .write()
            .unwrap()
            .insert(id, Arc::clone(&document));
        *self.inner.active.write().unwrap() = Some(id);

        document
    }

    /// Returns an open document.
    pub fn document(&self, id: DocumentId) -> Option<Arc<TextDocument>> {
        self.inner.documents.read().unwrap().get(&id).cloned()
    }

    /// Makes an open document the active one. Returns `false` if it is not open.
    pub fn focus(&self, id: DocumentId) -> bool {
        if !self.inner.documents.read().unwrap().contains_key(&id) {
            return false;
        }

        *self.inner.active.write().unwrap() = Some(id);
        true
    }

    /// Replaces the text of a document and notifies subscribers.
    ///
    /// Returns `false` if the document is not open.
    pub fn edit(&self, id: DocumentId, text: impl Into<String>) -> bool {
        let document = match self.document(id) {
            Some(document) => document,
            None => return false,
        };

        *document.text.write().unwrap() = text.into();
        self.notify(DocumentEvent::Changed(id));
        true
    }

    /// Closes a document and notifies subscribers.
    ///
    /// Returns `false` if the document is not open.
    pub fn close(&self, id: DocumentId) -> bool {
        let document = match self.inner.documents.write().unwrap().remove(&id) {
            Some(document) => document,
            None => return false,
        };

        document.closed.store(true, Ordering::Release);

        {
            let mut active = self.inner.active.write().unwrap();
            if *active == Some(id) {
                *active = None;
            }
        }

        debug!(document = %id, "document closed");
        self.notify(DocumentEvent::Closed(id));
        true
    }

    /// Replaces the preview settings.
    pub fn set_settings(&self, settings: Settings) {
        *self.inner.settings.write().unwrap() = settings;
    }

    /// Adds a local directory to the workspace.
    pub fn add_folder(&self, folder: impl AsRef<Path>) {
        self.inner
            .folders
            .write()
            .unwrap()
            .push(folder.as_ref().to_owned());
    }

    fn notify(&self, event: DocumentEvent) {
        // Sending only fails when nobody is subscribed.
        let _ = self.inner.events.send(event);
    }
}

impl Host for Workspace {
    fn active_document(&self) -> Option<Arc<dyn Document>> {
        let active = (*self.inner.active.read().unwrap())?;
        self.document(active)
            .map(|document| document as Arc<dyn Document>)
    }

    fn settings(&self) -> Settings {
        self.inner.settings.read().unwrap().clone()
    }

    fn workspace_folders(&self) -> Vec<PathBuf> {
        self.inner.folders.read().unwrap().clone()
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.inner.events.subscribe())
    }

    fn create_surface(&self, options: SurfaceOptions) -> io::Result<Box<dyn Surface>> {
        (self.inner.surfaces)(options)
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("documents", &self.inner.documents)
            .field("active", &self.inner.active)
            .field("folders", &self.inner.folders)
            .field("settings", &self.inner.settings)
            .field("surfaces", &"(dyn Fn)")
            .finish()
    }
}
