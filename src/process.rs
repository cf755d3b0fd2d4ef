//! Spawning and supervising the external programs (`yt-dlp`, `ffmpeg`) that
//! do the actual YouTube work.
//!
//! Every child is spawned with `kill_on_drop`, so whoever owns a
//! [`ProcessPipeline`] also owns the cleanup: dropping it (for example when a
//! client disconnects mid-download and hyper drops the response body)
//! terminates every stage.

use std::{
    ffi::OsString,
    io,
    path::PathBuf,
    process::{Output, Stdio},
};

use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::debug;

// Only the end of stderr is kept; that is where yt-dlp and ffmpeg put the
// actual error.
const STDERR_TAIL_BYTES: usize = 2048;

/// One program in a pipeline. Pure data so plans can be inspected in tests
/// without spawning anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Stage {
    pub fn new<I, S>(name: &'static str, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            name,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Lossy view of the arguments, handy for assertions and logs.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }
}

/// A chain of running processes, each stage's stdout feeding the next stage's
/// stdin. The last stage's stdout is handed to the caller by [`spawn`].
///
/// [`spawn`]: ProcessPipeline::spawn
pub struct ProcessPipeline {
    running: Vec<RunningStage>,
}

struct RunningStage {
    name: &'static str,
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl ProcessPipeline {
    /// Starts every stage. If a later stage fails to start, the earlier ones
    /// are dropped and therefore killed.
    pub fn spawn(stages: &[Stage]) -> io::Result<(ChildStdout, Self)> {
        let mut running = Vec::with_capacity(stages.len());
        let mut upstream: Option<ChildStdout> = None;

        for stage in stages {
            let stdin: Stdio = match upstream.take() {
                Some(stdout) => stdout.try_into()?,
                None => Stdio::null(),
            };
            let mut child = Command::new(&stage.program)
                .args(&stage.args)
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| {
                    io::Error::new(
                        err.kind(),
                        format!("spawning {} ({}): {err}", stage.name, stage.program.display()),
                    )
                })?;
            debug!(stage = stage.name, pid = child.id(), "spawned pipeline stage");

            upstream = child.stdout.take();
            let stderr = child.stderr.take().map(|err| tokio::spawn(collect_tail(err)));
            running.push(RunningStage {
                name: stage.name,
                child,
                stderr,
            });
        }

        let stdout = upstream
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty pipeline"))?;
        Ok((stdout, Self { running }))
    }

    /// Waits for every stage and reports the first one that exited
    /// unsuccessfully, with the tail of its stderr.
    pub async fn wait(self) -> io::Result<()> {
        let mut failure = None;
        for mut stage in self.running {
            let status = stage.child.wait().await?;
            let tail = match stage.stderr.take() {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };
            debug!(stage = stage.name, %status, "pipeline stage exited");
            if !status.success() && failure.is_none() {
                failure = Some(io::Error::other(format!(
                    "{} exited with {status}: {}",
                    stage.name,
                    tail.trim()
                )));
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Runs a single program to completion and captures its output. The child is
/// killed if the returned future is dropped first.
pub async fn run_captured(stage: &Stage) -> io::Result<Output> {
    Command::new(&stage.program)
        .args(&stage.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("running {} ({}): {err}", stage.name, stage.program.display()),
            )
        })
}

/// Last lines of a captured stderr buffer, for error messages.
pub fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

async fn collect_tail(mut stderr: ChildStderr) -> String {
    let mut tail = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                tail.extend_from_slice(&buf[..read]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}
