//! Subprocess script engine.
//!
//! The function's code runs under an external interpreter (default `node`).
//! The child talks to the host over stdio, one JSON object per line:
//!
//! ```text
//! child → host   {"call": "get", "args": ["https://..."]}
//! host  → child  {"ok": <value>}
//! child → host   {"return": <value>}     or   {"error": "message"}
//! ```
//!
//! Any other stdout line is treated as script output and logged.
//!
//! Child I/O is async on the engine's runtime handle. Capability calls run
//! between reads on the calling thread, so they may `block_on` themselves.

use bustrack_core::Value;
use bustrack_core::config::SandboxConfig;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;

use crate::cancel::block_on_cancellable;
use crate::error::ScriptError;
use crate::sandbox::{Program, RunContext, ScriptEngine};
use crate::wire::{from_wire, to_wire};

/// Comma-separated capability names, exported to the child.
pub const CAPABILITIES_ENV: &str = "BUSTRACK_CAPABILITIES";

const EXIT_WAIT: Duration = Duration::from_secs(2);
const STDERR_WAIT: Duration = Duration::from_millis(500);
const STDERR_TAIL: usize = 2000;

pub struct ProcessEngine {
    command: String,
    args: Vec<String>,
    check_args: Vec<String>,
    extension: String,
    inherit_path: bool,
    scratch_dir: PathBuf,
    handle: Handle,
}

impl ProcessEngine {
    /// `handle` drives child I/O. Compile and run must be called from a
    /// thread outside its async workers.
    pub fn new(config: &SandboxConfig, handle: Handle) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            check_args: config.check_args.clone(),
            extension: config.extension.trim_start_matches('.').to_string(),
            inherit_path: config.inherit_path,
            scratch_dir: std::env::temp_dir().join("bustrack_exec"),
            handle,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    fn syntax_check(&self, path: &Path) -> Result<(), ScriptError> {
        if self.check_args.is_empty() {
            return Ok(());
        }
        let mut check = Command::new(&self.command);
        check
            .args(&self.check_args)
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let _runtime = self.handle.enter();
        let output = self
            .handle
            .block_on(check.output())
            .map_err(|e| ScriptError::Compile(format!("cannot start '{}': {e}", self.command)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = tail(stderr.trim(), STDERR_TAIL);
        Err(ScriptError::Compile(if message.is_empty() {
            format!("syntax check failed ({})", output.status)
        } else {
            message.to_string()
        }))
    }
}

impl ScriptEngine for ProcessEngine {
    fn name(&self) -> &str {
        &self.command
    }

    fn compile(&self, code: &str) -> Result<Box<dyn Program>, ScriptError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let file_name = format!(
            "fn_{}.{}",
            &uuid::Uuid::new_v4().simple().to_string()[..12],
            self.extension
        );
        let file = ScratchFile(self.scratch_dir.join(file_name));
        std::fs::write(&file.0, code)?;

        self.syntax_check(&file.0)?;

        Ok(Box::new(ProcessProgram {
            file,
            command: self.command.clone(),
            args: self.args.clone(),
            inherit_path: self.inherit_path,
            handle: self.handle.clone(),
        }))
    }
}

/// Script source on disk, removed on drop.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

struct ProcessProgram {
    file: ScratchFile,
    command: String,
    args: Vec<String>,
    inherit_path: bool,
    handle: Handle,
}

enum Message {
    Call { name: String, args: Vec<serde_json::Value> },
    Return(serde_json::Value),
    Error(String),
}

enum Conversation {
    Returned(Value),
    Eof,
}

impl ProcessProgram {
    fn spawn(&self, ctx: &RunContext<'_>) -> Result<Child, ScriptError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).arg(&self.file.0).env_clear();
        if self.inherit_path {
            if let Some(path) = std::env::var_os("PATH") {
                cmd.env("PATH", path);
            }
        }
        cmd.envs(ctx.env)
            .env(CAPABILITIES_ENV, ctx.capabilities.names().join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let _runtime = self.handle.enter();
        cmd.spawn()
            .map_err(|e| ScriptError::Runtime(format!("cannot start '{}': {e}", self.command)))
    }
}

impl Program for ProcessProgram {
    fn run(&mut self, ctx: &RunContext<'_>) -> Result<Value, ScriptError> {
        let mut child = self.spawn(ctx)?;
        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(ScriptError::Protocol("child stdio unavailable".into()));
        };

        let stderr_tail = self.handle.spawn(read_tail(stderr));
        let mut lines = BufReader::new(stdout).lines();

        let outcome = converse(&self.handle, &mut lines, &mut stdin, ctx);
        drop(stdin);
        if outcome.is_err() {
            let _ = child.start_kill();
        }
        let status = self.handle.block_on(wait_for_exit(&mut child, EXIT_WAIT));

        if ctx.cancel.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        match outcome? {
            Conversation::Returned(value) => Ok(value),
            Conversation::Eof => match status {
                Some(status) if status.success() => Ok(Value::Null),
                Some(status) => {
                    let _runtime = self.handle.enter();
                    let stderr = match self.handle.block_on(tokio::time::timeout(STDERR_WAIT, stderr_tail)) {
                        Ok(Ok(text)) => text,
                        _ => String::new(),
                    };
                    Err(ScriptError::Runtime(if stderr.is_empty() {
                        format!("script exited with {status}")
                    } else {
                        format!("script exited with {status}: {stderr}")
                    }))
                }
                None => Err(ScriptError::Runtime("script did not exit".into())),
            },
        }
    }
}

fn converse(
    handle: &Handle,
    lines: &mut Lines<BufReader<ChildStdout>>,
    stdin: &mut ChildStdin,
    ctx: &RunContext<'_>,
) -> Result<Conversation, ScriptError> {
    loop {
        let next = block_on_cancellable(handle, ctx.cancel, async {
            lines.next_line().await.map_err(ScriptError::from)
        })?;
        let Some(line) = next else {
            return Ok(Conversation::Eof);
        };

        match parse_message(&line) {
            Some(Message::Return(value)) => return Ok(Conversation::Returned(from_wire(value)?)),
            Some(Message::Error(message)) => return Err(ScriptError::Runtime(message)),
            Some(Message::Call { name, args }) => {
                let args = args
                    .into_iter()
                    .map(from_wire)
                    .collect::<Result<Vec<_>, _>>()?;
                let value = ctx.capabilities.call(&name, args, ctx.cancel)?;
                let reply = format!("{}\n", json!({ "ok": to_wire(&value)? }));
                let written = block_on_cancellable(handle, ctx.cancel, async {
                    stdin.write_all(reply.as_bytes()).await?;
                    stdin.flush().await?;
                    Ok::<_, ScriptError>(())
                });
                match written {
                    Ok(()) => {}
                    Err(ScriptError::Cancelled) => return Err(ScriptError::Cancelled),
                    Err(e) => tracing::debug!(capability = %name, "child stopped reading replies: {e}"),
                }
            }
            None => {
                let text = line.trim();
                if !text.is_empty() {
                    tracing::debug!(output = text, "script output");
                }
            }
        }
    }
}

fn parse_message(line: &str) -> Option<Message> {
    let serde_json::Value::Object(mut map) = serde_json::from_str::<serde_json::Value>(line.trim()).ok()? else {
        return None;
    };
    if let Some(name) = map.get("call").and_then(|v| v.as_str()).map(str::to_string) {
        let args = match map.remove("args") {
            Some(serde_json::Value::Array(args)) => args,
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(single) => vec![single],
        };
        return Some(Message::Call { name, args });
    }
    if let Some(value) = map.remove("return") {
        return Some(Message::Return(value));
    }
    match map.remove("error") {
        Some(serde_json::Value::String(message)) => Some(Message::Error(message)),
        Some(other) => Some(Message::Error(other.to_string())),
        None => None,
    }
}

/// Stderr until the stream closes, keeping only its tail.
async fn read_tail(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let _ = stderr.read_to_end(&mut buf).await;
    let text = String::from_utf8_lossy(&buf);
    tail(text.trim(), STDERR_TAIL).to_string()
}

async fn wait_for_exit(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!("waiting for script process failed: {e}");
            None
        }
        Err(_) => {
            tracing::warn!("script still running after it finished talking, killing it");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    }
}

/// Last `max` bytes of `s`, cut on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
