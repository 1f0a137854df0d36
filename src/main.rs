use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::net::lookup_host;
use tokio::time;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use url::Url;

use pandoc_preview::config::{self, Settings};
use pandoc_preview::{BrowserSurface, Document, Previewer, Surface, Workspace};

/// Live-updating HTML preview of a document, rendered through pandoc.
///
/// The preview is re-rendered whenever FILE changes on disk, and closes when FILE is deleted.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// The document to preview.
    file: PathBuf,

    /// Address the preview server listens on. Port 0 picks a free port.
    #[arg(long, env = "PANDOC_PREVIEW_ADDR", default_value = "localhost:0")]
    addr: String,

    /// Do not open the preview in a browser.
    #[arg(long)]
    no_browser: bool,

    /// The converter program.
    #[arg(long, default_value = config::DEFAULT_PANDOC)]
    pandoc: PathBuf,

    /// Minimum milliseconds between the end of one render and the start of the next.
    #[arg(long, value_name = "MS", default_value_t = 500)]
    minimum_wait_interval: u64,

    /// Extra converter arguments, quoted as in a shell.
    #[arg(long, value_name = "ARGS", default_value = "", allow_hyphen_values = true)]
    pandoc_args: String,

    /// A file sent to the converter ahead of the document. May be repeated.
    #[arg(long, value_name = "FILE")]
    input_file: Vec<PathBuf>,

    /// Milliseconds a single render may take before it is abandoned.
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    timeout: u64,

    /// Base URI of the KaTeX distribution.
    #[arg(long, value_name = "URL", default_value = config::DEFAULT_KATEX)]
    katex: Url,

    /// Milliseconds between checks of FILE for changes.
    #[arg(long, value_name = "MS", default_value_t = 200)]
    poll_interval: u64,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            minimum_wait_interval: Duration::from_millis(self.minimum_wait_interval),
            extra_pandoc_arguments: self.pandoc_args.clone(),
            extra_pandoc_input_files: self.input_file.clone(),
            pandoc: self.pandoc.clone(),
            timeout: Duration::from_millis(self.timeout),
            katex: self.katex.clone(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .compact()
        .init();

    let args = Args::parse();

    let path = args
        .file
        .canonicalize()
        .with_context(|| format!("cannot open {}", args.file.display()))?;
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;

    let addr = lookup_host(&args.addr)
        .await?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve to an address", args.addr))?;

    let open_browser = !args.no_browser;
    let workspace = Workspace::new(move |options| {
        let surface = BrowserSurface::bind(&addr, options)?;
        info!(url = %surface.url(), "serving preview");

        if open_browser {
            surface.open_browser()?;
        }

        Ok(Box::new(surface) as Box<dyn Surface>)
    });
    workspace.set_settings(args.settings());

    let document = workspace.open(Some(path.clone()), text);

    let mut previewer = Previewer::new(Arc::new(workspace.clone()));
    let session = previewer
        .open_preview(())?
        .ok_or_else(|| anyhow!("no document to preview"))?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut interval = time::interval(Duration::from_millis(args.poll_interval));
    let mut modified = modified_time(&path).await?;

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!("interrupted");
                break;
            }
            _ = session.closed() => break,
            _ = interval.tick() => match modified_time(&path).await {
                Ok(current) if current != modified => {
                    modified = current;
                    match tokio::fs::read_to_string(&path).await {
                        Ok(text) => {
                            debug!("file changed on disk");
                            workspace.edit(document.id(), text);
                        }
                        Err(e) => warn!(error = %e, "cannot read document"),
                    }
                }
                Ok(_) => (),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "document deleted");
                    workspace.close(document.id());
                    break;
                }
                Err(e) => warn!(error = %e, "cannot check document for changes"),
            },
        }
    }

    // Let the session release its surface before the runtime goes away.
    session.dispose();
    session.closed().await;

    previewer.deactivate();

    Ok(())
}

async fn modified_time(path: &std::path::Path) -> io::Result<SystemTime> {
    tokio::fs::metadata(path).await?.modified()
}
