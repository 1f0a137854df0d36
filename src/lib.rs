//! Live HTML previews of documents rendered through [pandoc](https://pandoc.org).
//!
//! A [`PreviewSession`] binds one document to one [`Surface`]. Whenever the document changes, the
//! session runs the external converter on its text and replaces the surface's content with the
//! result. Bursts of edits are coalesced: at most one conversion runs at a time, and a new one
//! starts no sooner than a minimum interval after the previous one finished. A failed conversion
//! replaces the preview with an error page instead of leaving a stale rendering behind.
//!
//! The editor side is abstracted by the [`Host`] trait. [`Workspace`] is a small in-process host,
//! and [`BrowserSurface`] shows previews in a web browser, pushing new renderings over a
//! websocket without a client-side refresh.
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use pandoc_preview::{BrowserSurface, Document, Previewer, Surface, Workspace};
//!
//! # tokio_test::block_on(async {
//! let addr = "127.0.0.1:1337".parse::<SocketAddr>()?;
//! let workspace = Workspace::new(move |options| {
//!     let surface = BrowserSurface::bind(&addr, options)?;
//!     surface.open_browser()?;
//!     Ok(Box::new(surface) as Box<dyn Surface>)
//! });
//!
//! let document = workspace.open(None, "# Hello, world!");
//!
//! let mut previewer = Previewer::new(Arc::new(workspace.clone()));
//! previewer.open_preview(())?;
//!
//! workspace.edit(document.id(), "# Hello again!");
//! #   Ok::<_, Box<dyn std::error::Error>>(())
//! # });
//! ```

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod config;
pub mod host;
pub mod render;
pub mod schedule;
mod service;
pub mod session;
pub mod surface;

pub use crate::config::Settings;
pub use crate::host::{Document, DocumentEvent, DocumentId, Host, Workspace};
pub use crate::render::Diagnostic;
pub use crate::session::{PreviewSession, Previewer};
pub use crate::surface::{BrowserSurface, Surface, SurfaceOptions};
