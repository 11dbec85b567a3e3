use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader, Split};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::config::ToolCommand;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

pub trait LogSink {
    fn line(&self, stage: &str, stream: OutputStream, text: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn line(&self, stage: &str, stream: OutputStream, text: &str) {
        info!(target: "cutover::tool", stage, stream = stream.as_str(), "{text}");
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub tail: Vec<String>,
}

impl StageOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn check(self) -> Result<Self, PipelineError> {
        if self.success() {
            Ok(self)
        } else {
            Err(PipelineError::StageFailed {
                stage: self.stage,
                code: self.exit_code,
                tail: self.tail,
            })
        }
    }
}

type StdoutSegments = Split<BufReader<ChildStdout>>;
type StderrSegments = Split<BufReader<ChildStderr>>;

pub struct StageProcess {
    stage: String,
    child: Child,
    stdout: Option<StdoutSegments>,
    stderr: Option<StderrSegments>,
    started_at: Instant,
    runtime: Runtime,
}

impl StageProcess {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn lines(&mut self) -> OutputLines<'_> {
        OutputLines { process: self }
    }

    pub fn wait(mut self) -> std::io::Result<(Option<i32>, Duration)> {
        // Unread pipes would block a chatty child forever.
        self.stdout = None;
        self.stderr = None;
        let status = self.runtime.block_on(self.child.wait())?;
        Ok((status.code(), self.started_at.elapsed()))
    }
}

/// Lines from stdout and stderr in arrival order. Ends once both streams
/// are closed.
pub struct OutputLines<'a> {
    process: &'a mut StageProcess,
}

impl Iterator for OutputLines<'_> {
    type Item = OutputLine;

    fn next(&mut self) -> Option<Self::Item> {
        let process = &mut *self.process;
        process
            .runtime
            .block_on(next_line(&mut process.stdout, &mut process.stderr))
    }
}

async fn next_line(
    stdout: &mut Option<StdoutSegments>,
    stderr: &mut Option<StderrSegments>,
) -> Option<OutputLine> {
    loop {
        let read = match (stdout.as_mut(), stderr.as_mut()) {
            (None, None) => return None,
            (Some(out), None) => decode(out.next_segment().await, OutputStream::Stdout),
            (None, Some(err)) => decode(err.next_segment().await, OutputStream::Stderr),
            (Some(out), Some(err)) => tokio::select! {
                segment = out.next_segment() => decode(segment, OutputStream::Stdout),
                segment = err.next_segment() => decode(segment, OutputStream::Stderr),
            },
        };
        match read {
            Ok(line) => return Some(line),
            Err(OutputStream::Stdout) => *stdout = None,
            Err(OutputStream::Stderr) => *stderr = None,
        }
    }
}

fn decode(
    segment: std::io::Result<Option<Vec<u8>>>,
    stream: OutputStream,
) -> Result<OutputLine, OutputStream> {
    match segment {
        Ok(Some(bytes)) => Ok(OutputLine {
            stream,
            text: String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_string(),
        }),
        Ok(None) | Err(_) => Err(stream),
    }
}

#[derive(Debug, Clone)]
pub struct StageRunner {
    tail_lines: usize,
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new(20)
    }
}

impl StageRunner {
    pub fn new(tail_lines: usize) -> Self {
        Self { tail_lines }
    }

    pub fn spawn(
        &self,
        stage: &str,
        command: &ToolCommand,
        extra_args: &[String],
        working_dir: &Path,
    ) -> Result<StageProcess, PipelineError> {
        debug!(
            stage,
            program = command.program.as_str(),
            args = ?command.args.iter().chain(extra_args).collect::<Vec<_>>(),
            working_dir = %working_dir.display(),
            "Spawning stage tool"
        );
        let spawn_failed = |source: std::io::Error| PipelineError::Spawn {
            stage: stage.to_string(),
            program: command.program.clone(),
            source,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(spawn_failed)?;
        let mut child = {
            let _context = runtime.enter();
            Command::new(&command.program)
                .args(&command.args)
                .args(extra_args)
                .current_dir(working_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(spawn_failed)?
        };

        let stdout = child
            .stdout
            .take()
            .map(|pipe| BufReader::new(pipe).split(b'\n'));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| BufReader::new(pipe).split(b'\n'));

        Ok(StageProcess {
            stage: stage.to_string(),
            child,
            stdout,
            stderr,
            started_at: Instant::now(),
            runtime,
        })
    }

    pub fn run(
        &self,
        stage: &str,
        command: &ToolCommand,
        extra_args: &[String],
        working_dir: &Path,
        sink: &dyn LogSink,
    ) -> Result<StageOutcome, PipelineError> {
        let mut process = self.spawn(stage, command, extra_args, working_dir)?;
        let mut tail = VecDeque::with_capacity(self.tail_lines);
        for line in process.lines() {
            sink.line(stage, line.stream, &line.text);
            if self.tail_lines > 0 {
                if tail.len() == self.tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line.text);
            }
        }

        let (exit_code, elapsed) = process.wait().map_err(|source| PipelineError::Spawn {
            stage: stage.to_string(),
            program: command.program.clone(),
            source,
        })?;

        Ok(StageOutcome {
            stage: stage.to_string(),
            exit_code,
            elapsed,
            tail: tail.into_iter().collect(),
        })
    }
}
