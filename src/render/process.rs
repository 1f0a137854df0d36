use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time;
use tracing::{debug, warn};

use super::Diagnostic;

/// A single run of the external converter.
///
/// The converter is expected to read its whole input from stdin and print HTML on stdout. An
/// `Invocation` is consumed by [`run`](Invocation::run); build a new one for every render.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use pandoc_preview::render::Invocation;
///
/// # tokio_test::block_on(async {
/// let html = Invocation::new("pandoc")
///     .args(["-f", "markdown", "-t", "html"])
///     .input("# Hello, world!")
///     .timeout(Duration::from_secs(5))
///     .run()
///     .await?;
/// #   Ok::<_, pandoc_preview::render::Diagnostic>(())
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    input: Vec<u8>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl Invocation {
    /// Default wall-clock bound for a converter run.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates an invocation of `program` with no arguments and empty input.
    pub fn new(program: impl Into<PathBuf>) -> Invocation {
        Invocation {
            program: program.into(),
            args: vec![],
            input: vec![],
            cwd: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the bytes written to the converter's stdin.
    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = input.into();
        self
    }

    /// Sets the working directory. Without one, the converter inherits ours.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Sets the wall-clock bound after which the converter is killed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The program that will be spawned.
    pub fn get_program(&self) -> &Path {
        &self.program
    }

    /// The arguments passed to the program.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// The bytes written to stdin.
    pub fn get_input(&self) -> &[u8] {
        &self.input
    }

    /// The working directory, if one was set.
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Spawns the converter, feeds it the input and collects its output.
    ///
    /// Stdin is closed as soon as the input is written. The result is delivered exactly once:
    /// either the complete stdout of a successful run, or a [`Diagnostic`]. If the timeout expires
    /// the child is killed. Dropping the returned future also kills the child.
    pub async fn run(self) -> Result<Vec<u8>, Diagnostic> {
        let started_at = Instant::now();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        debug!(
            program = %self.program.display(),
            args = ?self.args,
            input_bytes = self.input.len(),
            "spawning converter"
        );

        let mut child = command.spawn().map_err(|err| {
            warn!(program = %self.program.display(), error = %err, "failed to spawn converter");
            Diagnostic::Spawn(err)
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let input = self.input;

        let write_input = async move {
            match stdin {
                // Dropping stdin at the end of this block signals end of input.
                Some(mut stdin) => stdin.write_all(&input).await,
                None => Ok(()),
            }
        };

        let completion = async {
            tokio::join!(
                write_input,
                read_pipe(stdout),
                read_pipe(stderr),
                child.wait()
            )
        };
        let result = time::timeout(self.timeout, completion).await;

        let (written, stdout, stderr, status) = match result {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    program = %self.program.display(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "converter timed out"
                );

                // Kill and reap, so the converter is gone by the time the timeout is reported.
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill converter");
                }

                return Err(Diagnostic::Timeout(self.timeout));
            }
        };

        let output = Output {
            status: status.map_err(Diagnostic::Io)?,
            stdout: stdout.map_err(Diagnostic::Io)?,
            stderr: stderr.map_err(Diagnostic::Io)?,
        };
        let elapsed_ms = started_at.elapsed().as_millis() as u64;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            warn!(
                program = %self.program.display(),
                status = %output.status,
                elapsed_ms,
                stderr = %stderr,
                "converter failed"
            );
            return Err(Diagnostic::Exit {
                status: output.status,
                stderr,
            });
        }

        // A converter that succeeds without reading all of its input is not an error worth
        // reporting, unless the write failed for a reason other than the pipe closing.
        if let Err(err) = written {
            if err.kind() != io::ErrorKind::BrokenPipe {
                return Err(Diagnostic::Io(err));
            }
        }

        debug!(
            program = %self.program.display(),
            elapsed_ms,
            output_bytes = output.stdout.len(),
            "converter finished"
        );

        Ok(output.stdout)
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = vec![];

    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }

    Ok(buf)
}
