use std::io::{self, Read, Write};
use std::process::Stdio;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{
    Engine, ExecStream, KillGuard, SandboxHandle, SandboxStats, SandboxStatus, TerminalControl,
    TerminalSize,
};
use crate::error::{EngineError, EngineResult};
use crate::spec::SandboxSpec;

const CPU_PERIOD: u64 = 100_000;
const KILLED_EXIT_CODE: i64 = 137;
const READ_CHUNK: usize = 8 * 1024;
const OUTPUT_CAPACITY: usize = 256;

static SIZE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([0-9]+(?:\.[0-9]+)?)\s*([kKMGT]?i?B)\s*$").expect("size regex")
});

/// Drives the local engine through its command-line client.
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run<I, S>(&self, operation: &'static str, args: I) -> EngineResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| EngineError::Unavailable(format!("failed to spawn {}: {err}", self.bin)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(operation, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[async_trait]
impl Engine for DockerCli {
    async fn ping(&self) -> EngineResult<()> {
        let version = self
            .run("ping", ["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|err| match err {
                EngineError::Unavailable(_) => err,
                other => EngineError::Unavailable(other.to_string()),
            })?;
        tracing::debug!(version = %version, "engine reachable");
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> EngineResult<SandboxHandle> {
        let id = self
            .run("create", create_args(spec))
            .await
            .map_err(|err| match err {
                EngineError::Operation { message, .. } if is_pull_failure(&message) => {
                    EngineError::ImagePullFailure {
                        image: spec.image().to_owned(),
                        message,
                    }
                }
                other => other,
            })?;
        let id = id.lines().last().unwrap_or_default().trim().to_owned();
        if id.is_empty() {
            return Err(EngineError::Operation {
                operation: "create",
                message: "engine returned no sandbox id".to_owned(),
            });
        }
        Ok(SandboxHandle::new(id, spec.name()))
    }

    async fn start(&self, target: &str) -> EngineResult<()> {
        if self.inspect(target).await?.running {
            return Err(EngineError::AlreadyStarted(target.to_owned()));
        }
        self.run("start", ["start", target]).await.map(|_| ())
    }

    async fn exec_interactive(&self, target: &str, command: &[String]) -> EngineResult<ExecStream> {
        if !self.inspect(target).await?.running {
            return Err(EngineError::NotRunning(target.to_owned()));
        }
        let pty = native_pty_system()
            .openpty(pty_size(TerminalSize::default()))
            .map_err(|err| exec_failure(format!("failed to open terminal: {err}")))?;
        let mut builder = CommandBuilder::new(&self.bin);
        builder.args(exec_args(target, command));
        let mut child = pty
            .slave
            .spawn_command(builder)
            .map_err(|err| EngineError::Unavailable(format!("failed to spawn {}: {err}", self.bin)))?;
        // Our copy of the slave must close so the reader sees EOF on exit.
        drop(pty.slave);
        let reader = pty
            .master
            .try_clone_reader()
            .map_err(|err| exec_failure(format!("terminal reader: {err}")))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|err| exec_failure(format!("terminal writer: {err}")))?;
        let mut killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        tokio::task::spawn_blocking(move || pump_terminal(reader, output_tx));
        let (input, terminal_input) = tokio::io::duplex(READ_CHUNK);
        tokio::spawn(feed_terminal(terminal_input, writer));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let target = target.to_owned();
        let mut waiting = tokio::task::spawn_blocking(move || child.wait());
        tokio::spawn(async move {
            let code = tokio::select! {
                status = &mut waiting => match status {
                    Ok(Ok(status)) => i64::from(status.exit_code()),
                    Ok(Err(err)) => {
                        tracing::warn!(sandbox = %target, error = %err, "failed waiting on exec");
                        KILLED_EXIT_CODE
                    }
                    Err(err) => {
                        tracing::warn!(sandbox = %target, error = %err, "exec waiter panicked");
                        KILLED_EXIT_CODE
                    }
                },
                _ = kill_rx => {
                    if let Err(err) = killer.kill() {
                        tracing::debug!(sandbox = %target, error = %err, "exec already gone");
                    }
                    let _ = waiting.await;
                    KILLED_EXIT_CODE
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(ExecStream {
            input: Box::new(input),
            output: output_rx,
            exit: exit_rx,
            terminal: Box::new(PtyTerminal {
                master: Mutex::new(pty.master),
            }),
            kill: KillGuard::new(kill_tx),
        })
    }

    async fn inspect(&self, target: &str) -> EngineResult<SandboxStatus> {
        let raw = self
            .run(
                "inspect",
                ["inspect", "--type", "container", "--format", "{{json .}}", target],
            )
            .await?;
        parse_inspect(&raw)
    }

    async fn stats(&self, target: &str, storage_path: &str) -> EngineResult<SandboxStats> {
        let raw = self
            .run(
                "stats",
                ["stats", "--no-stream", "--format", "{{json .}}", target],
            )
            .await?;
        let mut stats = parse_stats(&raw)?;
        // Storage is best effort; minimal images may lack df.
        stats.storage_used_bytes = match self
            .run(
                "stats",
                ["exec", target, "df", "-B1", "--output=used", storage_path],
            )
            .await
        {
            Ok(raw) => parse_df_used(&raw),
            Err(err) => {
                tracing::debug!(sandbox = target, error = %err, "storage usage unavailable");
                None
            }
        };
        Ok(stats)
    }

    async fn stop(&self, target: &str, grace: Duration) -> EngineResult<()> {
        let seconds = grace.as_secs().to_string();
        self.run("stop", ["stop", "--time", seconds.as_str(), target])
            .await
            .map(|_| ())
    }

    async fn remove(&self, target: &str) -> EngineResult<()> {
        self.run("remove", ["rm", "--force", "--volumes", target])
            .await
            .map(|_| ())
    }
}

fn create_args(spec: &SandboxSpec) -> Vec<String> {
    let memory = spec.memory_limit_bytes().to_string();
    let mut args = vec![
        "create".to_owned(),
        "--name".to_owned(),
        spec.name().to_owned(),
        "--interactive".to_owned(),
        "--tty".to_owned(),
        "--memory".to_owned(),
        memory.clone(),
        "--memory-swap".to_owned(),
        memory,
        "--cpu-period".to_owned(),
        CPU_PERIOD.to_string(),
        "--cpu-quota".to_owned(),
        spec.cpu_quota(CPU_PERIOD).to_string(),
        "--tmpfs".to_owned(),
        format!(
            "{}:size={}",
            spec.storage_path(),
            spec.storage_limit_bytes()
        ),
    ];
    for (key, value) in spec.labels() {
        args.push("--label".to_owned());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image().to_owned());
    args.extend(spec.command().iter().cloned());
    args
}

fn exec_args(target: &str, command: &[String]) -> Vec<String> {
    let mut args: Vec<String> = ["exec", "--interactive", "--tty", "--env", "TERM=xterm-256color"]
        .into_iter()
        .map(str::to_owned)
        .collect();
    args.push(target.to_owned());
    args.extend(command.iter().cloned());
    args
}

fn exec_failure(message: String) -> EngineError {
    EngineError::Operation {
        operation: "exec",
        message,
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct PtyTerminal {
    master: Mutex<Box<dyn MasterPty + Send>>,
}

impl TerminalControl for PtyTerminal {
    fn resize(&self, size: TerminalSize) -> io::Result<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master.resize(pty_size(size)).map_err(io::Error::other)
    }
}

fn pump_terminal(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // Linux reports EIO once the last slave handle closes.
                tracing::debug!(error = %err, "terminal closed");
                break;
            }
        }
    }
}

async fn feed_terminal(mut input: DuplexStream, mut writer: Box<dyn Write + Send>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = buf[..n].to_vec();
        let written = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&chunk).and_then(|()| writer.flush());
            (writer, result)
        })
        .await;
        match written {
            Ok((returned, Ok(()))) => writer = returned,
            Ok((_, Err(err))) => {
                tracing::debug!(error = %err, "terminal stopped accepting input");
                break;
            }
            Err(err) => {
                tracing::debug!(error = %err, "terminal writer panicked");
                break;
            }
        }
    }
}

fn classify(operation: &'static str, stderr: &str) -> EngineError {
    let lower = stderr.to_ascii_lowercase();
    let message = if stderr.is_empty() {
        format!("{operation} exited unsuccessfully")
    } else {
        stderr.to_owned()
    };
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        EngineError::Unavailable(message)
    } else if lower.contains("no such container") || lower.contains("no such object") {
        EngineError::NotFound(message)
    } else if lower.contains("is already in use") || lower.contains("conflict") {
        EngineError::NameConflict(message)
    } else if lower.contains("is not running") {
        EngineError::NotRunning(message)
    } else {
        EngineError::Operation { operation, message }
    }
}

fn is_pull_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "unable to find image",
        "pull access denied",
        "manifest unknown",
        "repository does not exist",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    id: String,
    name: String,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
    exit_code: Option<i64>,
}

fn parse_inspect(raw: &str) -> EngineResult<SandboxStatus> {
    let parsed: InspectOutput = serde_json::from_str(raw).map_err(|err| EngineError::Operation {
        operation: "inspect",
        message: format!("unexpected inspect output: {err}"),
    })?;
    Ok(SandboxStatus {
        id: parsed.id,
        name: parsed.name.trim_start_matches('/').to_owned(),
        status: parsed.state.status,
        running: parsed.state.running,
        exit_code: parsed.state.exit_code,
    })
}

#[derive(Debug, Deserialize)]
struct StatsOutput {
    #[serde(rename = "MemUsage")]
    mem_usage: String,
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
}

fn parse_stats(raw: &str) -> EngineResult<SandboxStats> {
    let line = raw.lines().next().unwrap_or_default();
    let parsed: StatsOutput = serde_json::from_str(line).map_err(|err| EngineError::Operation {
        operation: "stats",
        message: format!("unexpected stats output: {err}"),
    })?;
    let (used, limit) = parsed
        .mem_usage
        .split_once('/')
        .unwrap_or((parsed.mem_usage.as_str(), "0B"));
    Ok(SandboxStats {
        memory_used_bytes: parse_size(used).unwrap_or(0),
        memory_limit_bytes: parse_size(limit).unwrap_or(0),
        cpu_percent: parsed
            .cpu_perc
            .trim()
            .trim_end_matches('%')
            .parse()
            .unwrap_or(0.0),
        storage_used_bytes: None,
    })
}

/// Parses sizes like `1.5MiB`, `256MB` or `0B` into bytes.
fn parse_size(raw: &str) -> Option<u64> {
    let captures = SIZE_PATTERN.captures(raw)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2)?.as_str();
    let binary = unit.contains('i');
    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    let exponent = match unit.chars().next()? {
        'k' | 'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        _ => 0,
    };
    Some((value * base.powi(exponent)).round() as u64)
}

fn parse_df_used(raw: &str) -> Option<u64> {
    raw.lines().skip(1).find_map(|line| line.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::config::SandboxPolicy;
    use crate::spec::SandboxSpecBuilder;

    #[test]
    fn exec_allocates_a_tty_before_the_command() {
        let shell = vec!["/bin/bash".to_owned(), "-l".to_owned()];
        let args = exec_args("web-shell-container-1", &shell);
        assert_eq!(
            args,
            [
                "exec",
                "--interactive",
                "--tty",
                "--env",
                "TERM=xterm-256color",
                "web-shell-container-1",
                "/bin/bash",
                "-l",
            ]
        );
        assert_eq!(
            pty_size(TerminalSize { cols: 132, rows: 43 }).cols,
            132
        );
    }

    #[test]
    fn create_args_carry_resource_limits() {
        let spec = SandboxSpecBuilder::new(SandboxPolicy::default()).build(&Uuid::new_v4());
        let args = create_args(&spec).join(" ");
        assert!(args.contains("--memory 268435456 --memory-swap 268435456"));
        assert!(args.contains("--cpu-period 100000 --cpu-quota 50000"));
        assert!(args.contains("--tmpfs /tmp:size=1073741824"));
        assert!(args.contains("--label webshell.managed=true"));
        assert!(args.ends_with("debian:12.12 /bin/bash"));
    }

    #[test]
    fn classify_maps_daemon_messages() {
        assert!(matches!(
            classify(
                "ping",
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
            ),
            EngineError::Unavailable(_)
        ));
        assert!(matches!(
            classify("inspect", "Error: No such container: web-shell-container-x"),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            classify(
                "create",
                "Conflict. The container name \"/web-shell-container\" is already in use"
            ),
            EngineError::NameConflict(_)
        ));
        assert!(is_pull_failure(
            "Unable to find image 'nope:1' locally\nmanifest unknown"
        ));
    }

    #[test]
    fn parse_inspect_strips_leading_slash() {
        let raw = r#"{"Id":"abc123","Name":"/web-shell-container","State":{"Status":"running","Running":true,"ExitCode":0}}"#;
        let status = parse_inspect(raw).unwrap();
        assert_eq!(status.name, "web-shell-container");
        assert!(status.running);
        assert_eq!(status.exit_code, Some(0));
    }

    #[test]
    fn parse_stats_reads_memory_and_cpu() {
        let raw = r#"{"CPUPerc":"12.50%","MemUsage":"1.5MiB / 256MiB","Name":"x"}"#;
        let stats = parse_stats(raw).unwrap();
        assert_eq!(stats.memory_used_bytes, 1_572_864);
        assert_eq!(stats.memory_limit_bytes, 268_435_456);
        assert_eq!(stats.cpu_percent, 12.5);
    }

    #[test]
    fn parse_size_handles_decimal_units() {
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("2kB"), Some(2000));
        assert_eq!(parse_size("1GiB"), Some(1_073_741_824));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_df_used("    Used\n  40960\n"), Some(40960));
    }
}
