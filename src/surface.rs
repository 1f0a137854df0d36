//! Where previews are displayed.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use url::Url;

pub mod browser;

pub use browser::BrowserSurface;

/// Parameters for creating a [`Surface`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurfaceOptions {
    /// Human-readable title of the preview.
    pub title: String,

    /// The only local directories whose files the surface may expose to the rendered HTML.
    pub local_resource_roots: Vec<PathBuf>,
}

/// An output sink for rendered HTML, owned by the host.
///
/// A preview session calls these methods from a single task, never concurrently.
pub trait Surface: Send {
    /// Replaces the displayed HTML.
    fn set_content(&mut self, html: String);

    /// A token that is cancelled when the user closes the surface.
    fn closed_by_user(&self) -> CancellationToken;

    /// Closes the surface. Closing an already closed surface does nothing.
    fn close(&mut self);

    /// A URI through which the rendered HTML can load the local file at `path`.
    ///
    /// Returns `None` if `path` is outside the surface's local resource roots.
    fn resource_uri(&self, path: &Path) -> Option<Url>;

    /// A URI for one of the crate's bundled assets, such as `css/markdown.css`.
    fn asset_uri(&self, asset: &str) -> Url;
}
