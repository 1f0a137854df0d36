//! Preview configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use url::Url;

use crate::render::Invocation;

/// Default minimum time between the end of one render and the start of the next.
pub const DEFAULT_MINIMUM_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Default converter program, looked up on `PATH`.
pub const DEFAULT_PANDOC: &str = "pandoc";

/// Default KaTeX distribution handed to the converter for math rendering.
pub const DEFAULT_KATEX: &str = "https://cdn.jsdelivr.net/npm/katex@0.16.11/dist/";

/// Settings for a preview session.
///
/// Hosts hand these out through [`Host::settings`](crate::host::Host::settings). Sessions look
/// them up again for every render, so changes apply from the next render on. Durations are
/// written as milliseconds when deserialized, and keys use the host's camel-case naming:
///
/// ```json
/// { "minimumWaitInterval": 250, "extraPandocArguments": "--toc" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Minimum time between the end of one render and the start of the next.
    #[serde(deserialize_with = "deserialize_millis")]
    pub minimum_wait_interval: Duration,

    /// Extra converter arguments, quoted as in a shell. They are passed before the arguments the
    /// preview always supplies.
    pub extra_pandoc_arguments: String,

    /// Files whose contents are sent to the converter ahead of the document text. Relative paths
    /// are resolved against the document's directory.
    pub extra_pandoc_input_files: Vec<PathBuf>,

    /// The converter program.
    pub pandoc: PathBuf,

    /// Wall-clock bound for a single converter run.
    #[serde(deserialize_with = "deserialize_millis")]
    pub timeout: Duration,

    /// Base URI of the KaTeX distribution used for math.
    pub katex: Url,
}

impl Settings {
    /// The extra converter arguments, split the way a POSIX shell splits words.
    ///
    /// Quotes and backslashes group words as in a shell, but nothing is expanded.
    pub fn extra_arguments(&self) -> Result<Vec<String>, shell_words::ParseError> {
        shell_words::split(&self.extra_pandoc_arguments)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            minimum_wait_interval: DEFAULT_MINIMUM_WAIT_INTERVAL,
            extra_pandoc_arguments: String::new(),
            extra_pandoc_input_files: vec![],
            pandoc: PathBuf::from(DEFAULT_PANDOC),
            timeout: Invocation::DEFAULT_TIMEOUT,
            katex: Url::parse(DEFAULT_KATEX).expect("default KaTeX URL is valid"),
        }
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
