//! External process supervision
//!
//! A capture is a chain of at most two processes: the capture tool and an
//! optional converter fed the capture's stdout on its stdin. The chain's
//! final stdout is the output. Every child is spawned with `kill_on_drop`, so
//! dropping a [`RunningChain`] (cancellation, timeout) reaps the processes.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::MirrorError;
use crate::relay::CaptureParams;

/// Lines of stderr kept per process for error reports
const STDERR_TAIL_LINES: usize = 4;

/// Capture pipeline failure; every variant is retryable
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("{program} exited with {}: {stderr}", exit_label(.code))]
    ExitedNonZero {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("capture timed out after {0:?}")]
    TimedOut(Duration),

    #[error("capture produced no output")]
    OutputEmpty,

    #[error("pipe error: {0}")]
    Io(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

impl From<CaptureError> for MirrorError {
    fn from(e: CaptureError) -> Self {
        MirrorError::ProcessFailure(e.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Io(e.to_string())
    }
}

/// One program plus arguments, placeholders already substituted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Render a configured argv, replacing `{width}`, `{height}` and `{fps}`
    ///
    /// Returns `None` for an empty template.
    pub fn render(template: &[String], params: &CaptureParams) -> Option<Self> {
        let mut argv = template.iter().map(|arg| {
            arg.replace("{width}", &params.width.to_string())
                .replace("{height}", &params.height.to_string())
                .replace("{fps}", &params.fps.to_string())
        });
        let program = argv.next()?;
        Some(Self {
            program,
            args: argv.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Capture command with optional converter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessChain {
    capture: CommandLine,
    convert: Option<CommandLine>,
}

impl ProcessChain {
    pub fn new(capture: CommandLine, convert: Option<CommandLine>) -> Self {
        Self { capture, convert }
    }

    /// Build from configured templates; an empty convert template means none
    pub fn from_templates(
        capture: &[String],
        convert: &[String],
        params: &CaptureParams,
    ) -> Result<Self, CaptureError> {
        let capture = CommandLine::render(capture, params).ok_or_else(|| {
            CaptureError::SpawnFailed {
                program: String::new(),
                reason: "capture command is empty".into(),
            }
        })?;
        Ok(Self::new(capture, CommandLine::render(convert, params)))
    }

    pub fn has_convert(&self) -> bool {
        self.convert.is_some()
    }

    /// Spawn every process and connect the pipes
    pub fn spawn(&self) -> Result<RunningChain, CaptureError> {
        debug!("Spawning {}", self.capture);
        let mut capture = self
            .capture
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_failed(&self.capture, e))?;

        let mut stages = Vec::with_capacity(2);
        let capture_out = take_stdout(&mut capture)?;
        stages.push(Stage::new(&self.capture, capture));

        let Some(convert_cmd) = &self.convert else {
            return Ok(RunningChain {
                stages,
                output: capture_out,
                pump: None,
            });
        };

        debug!("Spawning {}", convert_cmd);
        let mut convert = convert_cmd
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_failed(convert_cmd, e))?;

        let mut convert_in = convert
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Io("converter stdin not captured".into()))?;
        let output = take_stdout(&mut convert)?;
        stages.push(Stage::new(convert_cmd, convert));

        // dropping convert_in at the end closes the converter's stdin
        let mut capture_out = capture_out;
        let pump = tokio::spawn(async move {
            tokio::io::copy(&mut capture_out, &mut convert_in).await
        });

        Ok(RunningChain {
            stages,
            output,
            pump: Some(pump),
        })
    }

    /// Run the chain to completion and return its output
    ///
    /// `on_capture_exit` fires when the capture process exits successfully
    /// while a converter is still running. On timeout both processes are
    /// killed.
    pub async fn run_once<F>(&self, timeout: Duration, on_capture_exit: F) -> Result<Bytes, CaptureError>
    where
        F: FnMut(),
    {
        let mut chain = self.spawn()?;
        let outcome = tokio::time::timeout(timeout, chain.collect(on_capture_exit)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}, killing", self.capture.program, timeout);
                chain.kill().await;
                Err(CaptureError::TimedOut(timeout))
            }
        }
    }
}

fn spawn_failed(cmd: &CommandLine, e: std::io::Error) -> CaptureError {
    CaptureError::SpawnFailed {
        program: cmd.program.clone(),
        reason: e.to_string(),
    }
}

fn take_stdout(child: &mut Child) -> Result<ChildStdout, CaptureError> {
    child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Io("stdout not captured".into()))
}

struct Stage {
    program: String,
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl Stage {
    fn new(cmd: &CommandLine, mut child: Child) -> Self {
        let stderr = child.stderr.take().map(|err| {
            let program = cmd.program.clone();
            tokio::spawn(collect_stderr(program, err))
        });
        Self {
            program: cmd.program.clone(),
            child,
            stderr,
        }
    }

    async fn check(&mut self, status: ExitStatus) -> Result<(), CaptureError> {
        if status.success() {
            return Ok(());
        }
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Err(CaptureError::ExitedNonZero {
            program: self.program.clone(),
            code: status.code(),
            stderr,
        })
    }
}

/// Log a process's stderr and keep its last few lines
async fn collect_stderr<R: AsyncRead + Unpin>(program: String, reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail: Vec<String> = Vec::with_capacity(STDERR_TAIL_LINES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!("[{}] {}", program, line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("[{}] stderr read failed: {}", program, e);
                break;
            }
        }
    }
    tail.join(" | ")
}

/// A spawned process chain
pub struct RunningChain {
    stages: Vec<Stage>,
    output: ChildStdout,
    pump: Option<JoinHandle<std::io::Result<u64>>>,
}

impl RunningChain {
    /// Read whatever output is available into `buf`; 0 means end of stream
    pub async fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<usize, CaptureError> {
        Ok(self.output.read_buf(buf).await?)
    }

    /// Read all output and wait for every process
    async fn collect<F: FnMut()>(&mut self, mut on_capture_exit: F) -> Result<Bytes, CaptureError> {
        let has_convert = self.stages.len() > 1;
        let output = &mut self.output;
        let stages = &mut self.stages;

        let read = async {
            let mut buf = Vec::new();
            output.read_to_end(&mut buf).await.map(|_| buf)
        };
        let wait = async {
            let mut statuses = Vec::with_capacity(stages.len());
            for (index, stage) in stages.iter_mut().enumerate() {
                let status = stage.child.wait().await;
                if index == 0 && has_convert && status.as_ref().is_ok_and(|s| s.success()) {
                    on_capture_exit();
                }
                statuses.push(status);
            }
            statuses
        };
        let (read, statuses) = tokio::join!(read, wait);

        for (stage, status) in self.stages.iter_mut().zip(statuses) {
            stage.check(status?).await?;
        }
        self.join_pump().await;

        let buf = read?;
        if buf.is_empty() {
            return Err(CaptureError::OutputEmpty);
        }
        Ok(Bytes::from(buf))
    }

    /// Wait for every process after the output reached end of stream
    pub async fn wait(&mut self) -> Result<(), CaptureError> {
        for stage in self.stages.iter_mut() {
            let status = stage.child.wait().await?;
            stage.check(status).await?;
        }
        self.join_pump().await;
        Ok(())
    }

    async fn join_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            match pump.await {
                Ok(Ok(bytes)) => trace!("Piped {} bytes to converter", bytes),
                // converter exiting early closes the pipe; its exit status says more
                Ok(Err(e)) => debug!("Pipe to converter closed: {}", e),
                Err(e) => debug!("Pipe task failed: {}", e),
            }
        }
    }

    /// Kill every process and reap it
    pub async fn kill(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.child.kill().await {
                debug!("Failed to kill {}: {}", stage.program, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn chain(capture: &[&str], convert: &[&str]) -> ProcessChain {
        ProcessChain::from_templates(&argv(capture), &argv(convert), &CaptureParams::default())
            .unwrap()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let params = CaptureParams {
            width: 540,
            height: 960,
            fps: 24,
        };
        let cmd = CommandLine::render(
            &argv(&["screenrecord", "--size", "{width}x{height}", "-r", "{fps}"]),
            &params,
        )
        .unwrap();
        assert_eq!(cmd.program, "screenrecord");
        assert_eq!(cmd.args, argv(&["--size", "540x960", "-r", "24"]));
        assert!(CommandLine::render(&[], &params).is_none());
    }

    #[tokio::test]
    async fn test_chain_pipes_capture_into_convert() {
        let mut converting = false;
        let out = chain(&["printf", "hello"], &["tr", "a-z", "A-Z"])
            .run_once(Duration::from_secs(5), || converting = true)
            .await
            .unwrap();
        assert_eq!(&out[..], b"HELLO");
        assert!(converting);
    }

    #[tokio::test]
    async fn test_single_stage_output() {
        let mut converting = false;
        let out = chain(&["printf", "frame"], &[])
            .run_once(Duration::from_secs(5), || converting = true)
            .await
            .unwrap();
        assert_eq!(&out[..], b"frame");
        assert!(!converting);
    }

    #[tokio::test]
    async fn test_timeout_kills_chain() {
        let started = std::time::Instant::now();
        let err = chain(&["sleep", "30"], &["cat"])
            .run_once(Duration::from_millis(100), || {})
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::TimedOut(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_nonzero_exit_and_empty_output() {
        let err = chain(&["sh", "-c", "echo broken >&2; exit 3"], &[])
            .run_once(Duration::from_secs(5), || {})
            .await
            .unwrap_err();
        match err {
            CaptureError::ExitedNonZero { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = chain(&["true"], &[])
            .run_once(Duration::from_secs(5), || {})
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::OutputEmpty);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = chain(&["/nonexistent/capture-tool"], &[])
            .run_once(Duration::from_secs(1), || {})
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::SpawnFailed { .. }));
        assert!(matches!(
            MirrorError::from(err),
            MirrorError::ProcessFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_streaming_read() {
        let mut running = chain(&["printf", "abcdef"], &["cat"]).spawn().unwrap();
        let mut buf = BytesMut::with_capacity(64);
        let mut total = Vec::new();
        loop {
            let n = running.read_chunk(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            total.extend_from_slice(&buf.split());
        }
        assert_eq!(total, b"abcdef");
        running.wait().await.unwrap();
    }
}
