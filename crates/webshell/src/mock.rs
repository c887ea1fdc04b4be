//! In-memory engine for tests and local demos.
//!
//! Sandboxes are plain records and the interactive shell is a tiny line
//! interpreter that understands `echo`, `pwd`, `sleep <secs>` and
//! `exit [code]`. It behaves like a shell behind a terminal: ETX only
//! cuts short a running `sleep`, and window sizes are recorded. Faults can
//! be injected per operation to exercise timeout and failure paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::engine::{
    Engine, ExecStream, KillGuard, SandboxHandle, SandboxStats, SandboxStatus, TerminalControl,
    TerminalSize,
};
use crate::error::{EngineError, EngineResult};
use crate::spec::SandboxSpec;

const KILLED_EXIT_CODE: i64 = 137;
const INTERRUPT: u8 = 0x03;
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Ping,
    Create,
    Start,
    Exec,
    Inspect,
    Stats,
    Stop,
    Remove,
}

impl MockOperation {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Create => "create",
            Self::Start => "start",
            Self::Exec => "exec",
            Self::Inspect => "inspect",
            Self::Stats => "stats",
            Self::Stop => "stop",
            Self::Remove => "remove",
        }
    }
}

struct MockSandbox {
    id: String,
    name: String,
    memory_limit_bytes: u64,
    running: bool,
    started: bool,
    exit_code: Option<i64>,
    alive: watch::Sender<bool>,
}

impl MockSandbox {
    fn new(id: String, name: String, memory_limit_bytes: u64) -> Self {
        let (alive, _) = watch::channel(false);
        Self {
            id,
            name,
            memory_limit_bytes,
            running: false,
            started: false,
            exit_code: None,
            alive,
        }
    }

    fn status(&self) -> SandboxStatus {
        let status = if self.running {
            "running"
        } else if self.started {
            "exited"
        } else {
            "created"
        };
        SandboxStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            status: status.to_owned(),
            running: self.running,
            exit_code: self.exit_code,
        }
    }

    fn halt(&mut self) {
        if self.running {
            self.running = false;
            self.exit_code = Some(KILLED_EXIT_CODE);
        }
        self.alive.send_replace(false);
    }
}

#[derive(Default)]
struct MockState {
    sandboxes: HashMap<String, MockSandbox>,
    names: HashMap<String, String>,
    created: usize,
    removed: usize,
    unavailable: bool,
    missing_images: HashSet<String>,
    hangs: HashMap<MockOperation, usize>,
    failures: HashMap<MockOperation, VecDeque<EngineError>>,
    inputs: Vec<String>,
    interrupts: usize,
    resizes: Vec<TerminalSize>,
    calls: HashMap<MockOperation, usize>,
}

impl MockState {
    fn resolve(&self, target: &str) -> EngineResult<String> {
        if self.sandboxes.contains_key(target) {
            return Ok(target.to_owned());
        }
        self.names
            .get(target)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(target.to_owned()))
    }

    fn sandbox_mut(&mut self, target: &str) -> EngineResult<&mut MockSandbox> {
        let id = self.resolve(target)?;
        self.sandboxes
            .get_mut(&id)
            .ok_or(EngineError::NotFound(id))
    }
}

/// Shared, cloneable in-memory engine.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    /// Makes every operation fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Makes `create` for `image` fail as if the pull was rejected.
    pub fn missing_image(&self, image: &str) {
        self.lock().missing_images.insert(image.to_owned());
    }

    /// The next `count` calls of `operation` never complete.
    pub fn hang_next(&self, operation: MockOperation, count: usize) {
        *self.lock().hangs.entry(operation).or_default() += count;
    }

    /// The next call of `operation` fails with `error`. Calls queue up.
    pub fn fail_next(&self, operation: MockOperation, error: EngineError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Inserts a running sandbox that nobody created through this engine,
    /// as left behind by an earlier process.
    pub fn seed_running(&self, name: &str) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let mut sandbox = MockSandbox::new(id.clone(), name.to_owned(), 0);
        sandbox.running = true;
        sandbox.started = true;
        sandbox.alive.send_replace(true);
        let mut state = self.lock();
        state.names.insert(name.to_owned(), id.clone());
        state.sandboxes.insert(id.clone(), sandbox);
        id
    }

    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    pub fn removed_count(&self) -> usize {
        self.lock().removed
    }

    pub fn live_count(&self) -> usize {
        self.lock().sandboxes.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().sandboxes.values().filter(|s| s.running).count()
    }

    pub fn exists(&self, target: &str) -> bool {
        self.lock().resolve(target).is_ok()
    }

    /// Lines received by every shell, in arrival order.
    pub fn inputs(&self) -> Vec<String> {
        self.lock().inputs.clone()
    }

    pub fn interrupts(&self) -> usize {
        self.lock().interrupts
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.lock().resizes.clone()
    }

    /// Attempts of `operation`, including injected failures and hangs.
    pub fn calls(&self, operation: MockOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    async fn enter(&self, operation: MockOperation) -> EngineResult<()> {
        let hang = {
            let mut state = self.lock();
            *state.calls.entry(operation).or_default() += 1;
            if state.unavailable {
                return Err(EngineError::Unavailable(
                    "Cannot connect to the mock engine".to_owned(),
                ));
            }
            if let Some(err) = state
                .failures
                .get_mut(&operation)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            match state.hangs.get_mut(&operation) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if hang {
            tracing::debug!(operation = operation.as_str(), "mock engine hanging");
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.enter(MockOperation::Ping).await
    }

    async fn create(&self, spec: &SandboxSpec) -> EngineResult<SandboxHandle> {
        self.enter(MockOperation::Create).await?;
        let mut state = self.lock();
        if state.missing_images.contains(spec.image()) {
            return Err(EngineError::ImagePullFailure {
                image: spec.image().to_owned(),
                message: "manifest unknown".to_owned(),
            });
        }
        if state.names.contains_key(spec.name()) {
            return Err(EngineError::NameConflict(spec.name().to_owned()));
        }
        let id = Uuid::new_v4().simple().to_string();
        let sandbox = MockSandbox::new(id.clone(), spec.name().to_owned(), spec.memory_limit_bytes());
        state.names.insert(spec.name().to_owned(), id.clone());
        state.sandboxes.insert(id.clone(), sandbox);
        state.created += 1;
        Ok(SandboxHandle::new(id, spec.name()))
    }

    async fn start(&self, target: &str) -> EngineResult<()> {
        self.enter(MockOperation::Start).await?;
        let mut state = self.lock();
        let sandbox = state.sandbox_mut(target)?;
        if sandbox.running {
            return Err(EngineError::AlreadyStarted(target.to_owned()));
        }
        sandbox.running = true;
        sandbox.started = true;
        sandbox.exit_code = None;
        sandbox.alive.send_replace(true);
        Ok(())
    }

    async fn exec_interactive(&self, target: &str, _command: &[String]) -> EngineResult<ExecStream> {
        self.enter(MockOperation::Exec).await?;
        let alive = {
            let mut state = self.lock();
            let sandbox = state.sandbox_mut(target)?;
            if !sandbox.running {
                return Err(EngineError::NotRunning(target.to_owned()));
            }
            sandbox.alive.subscribe()
        };

        let (input, shell_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let shell = MockShell {
            state: self.state.clone(),
            input: shell_side,
            output: output_tx,
            kill: kill_rx,
            alive,
            pending: VecDeque::new(),
        };
        tokio::spawn(async move {
            let code = shell.run().await;
            let _ = exit_tx.send(code);
        });
        Ok(ExecStream {
            input: Box::new(input),
            output: output_rx,
            exit: exit_rx,
            terminal: Box::new(MockTerminal {
                state: self.state.clone(),
            }),
            kill: KillGuard::new(kill_tx),
        })
    }

    async fn inspect(&self, target: &str) -> EngineResult<SandboxStatus> {
        self.enter(MockOperation::Inspect).await?;
        let mut state = self.lock();
        Ok(state.sandbox_mut(target)?.status())
    }

    async fn stats(&self, target: &str, _storage_path: &str) -> EngineResult<SandboxStats> {
        self.enter(MockOperation::Stats).await?;
        let mut state = self.lock();
        let sandbox = state.sandbox_mut(target)?;
        if !sandbox.running {
            return Err(EngineError::NotRunning(target.to_owned()));
        }
        Ok(SandboxStats {
            memory_used_bytes: 1024 * 1024,
            memory_limit_bytes: sandbox.memory_limit_bytes,
            cpu_percent: 0.0,
            storage_used_bytes: Some(4096),
        })
    }

    async fn stop(&self, target: &str, _grace: Duration) -> EngineResult<()> {
        self.enter(MockOperation::Stop).await?;
        let mut state = self.lock();
        state.sandbox_mut(target)?.halt();
        Ok(())
    }

    async fn remove(&self, target: &str) -> EngineResult<()> {
        self.enter(MockOperation::Remove).await?;
        let mut state = self.lock();
        let id = state.resolve(target)?;
        if let Some(mut sandbox) = state.sandboxes.remove(&id) {
            sandbox.halt();
            state.names.remove(&sandbox.name);
            state.removed += 1;
        }
        Ok(())
    }
}

struct MockTerminal {
    state: Arc<Mutex<MockState>>,
}

impl TerminalControl for MockTerminal {
    fn resize(&self, size: TerminalSize) -> std::io::Result<()> {
        lock_state(&self.state).resizes.push(size);
        Ok(())
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Line {
    Output(String),
    Sleep(Duration),
    Exit(i64),
}

fn interpret(line: &str) -> Line {
    let line = line.trim();
    let (command, rest) = line
        .split_once(char::is_whitespace)
        .map(|(command, rest)| (command, rest.trim()))
        .unwrap_or((line, ""));
    match command {
        "" => Line::Output(String::new()),
        "echo" => Line::Output(format!("{rest}\n")),
        "pwd" => Line::Output("/root\n".to_owned()),
        "sleep" => match rest.parse::<f64>().map(Duration::try_from_secs_f64) {
            Ok(Ok(duration)) => Line::Sleep(duration),
            _ => Line::Output(format!("sleep: invalid time interval '{rest}'\n")),
        },
        "exit" => Line::Exit(rest.parse().unwrap_or(0)),
        other => Line::Output(format!("bash: {other}: command not found\n")),
    }
}

enum Wake {
    Input,
    Eof,
    Killed,
}

enum Slept {
    Done,
    Interrupted,
    Killed,
}

struct MockShell {
    state: Arc<Mutex<MockState>>,
    input: DuplexStream,
    output: mpsc::Sender<Vec<u8>>,
    kill: oneshot::Receiver<()>,
    alive: watch::Receiver<bool>,
    pending: VecDeque<u8>,
}

impl MockShell {
    async fn run(mut self) -> i64 {
        let mut line = Vec::new();
        loop {
            let Some(byte) = self.pending.pop_front() else {
                match self.fill().await {
                    Wake::Input => continue,
                    Wake::Eof => return 0,
                    Wake::Killed => return KILLED_EXIT_CODE,
                }
            };
            match byte {
                INTERRUPT => {
                    line.clear();
                    if !self.interrupted().await {
                        return KILLED_EXIT_CODE;
                    }
                }
                b'\n' => {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    line.clear();
                    lock_state(&self.state).inputs.push(text.clone());
                    match interpret(&text) {
                        Line::Exit(code) => return code,
                        Line::Output(text) => {
                            if !text.is_empty() && !self.say(text.as_bytes()).await {
                                return KILLED_EXIT_CODE;
                            }
                        }
                        Line::Sleep(duration) => match self.sleep(duration).await {
                            Slept::Done => {}
                            Slept::Interrupted => {
                                if !self.interrupted().await {
                                    return KILLED_EXIT_CODE;
                                }
                            }
                            Slept::Killed => return KILLED_EXIT_CODE,
                        },
                    }
                }
                b'\r' => {}
                other => line.push(other),
            }
        }
    }

    async fn fill(&mut self) -> Wake {
        let mut buf = [0u8; 1024];
        tokio::select! {
            read = self.input.read(&mut buf) => match read {
                Ok(0) | Err(_) => Wake::Eof,
                Ok(n) => {
                    self.pending.extend(&buf[..n]);
                    Wake::Input
                }
            },
            _ = &mut self.kill => Wake::Killed,
            _ = self.alive.wait_for(|alive| !*alive) => Wake::Killed,
        }
    }

    /// Foreground command; ETX ends it early and discards typeahead before it.
    async fn sleep(&mut self, duration: Duration) -> Slept {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            if let Some(at) = self.pending.iter().position(|&byte| byte == INTERRUPT) {
                self.pending.drain(..=at);
                return Slept::Interrupted;
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Slept::Done,
                wake = self.fill() => match wake {
                    Wake::Input => {}
                    Wake::Eof => return Slept::Done,
                    Wake::Killed => return Slept::Killed,
                },
            }
        }
    }

    async fn interrupted(&self) -> bool {
        lock_state(&self.state).interrupts += 1;
        self.say(b"^C\n").await
    }

    async fn say(&self, bytes: &[u8]) -> bool {
        self.output.send(bytes.to_vec()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::config::SandboxPolicy;
    use crate::spec::SandboxSpecBuilder;

    async fn running(mock: &MockEngine) -> SandboxHandle {
        let spec = SandboxSpecBuilder::new(SandboxPolicy::default()).build(&Uuid::new_v4());
        let handle = mock.create(&spec).await.unwrap();
        mock.start(handle.id()).await.unwrap();
        handle
    }

    #[test]
    fn interpret_handles_known_commands() {
        assert!(matches!(interpret("echo hi there"), Line::Output(out) if out == "hi there\n"));
        assert!(matches!(interpret("exit 7"), Line::Exit(7)));
        assert!(matches!(interpret("exit"), Line::Exit(0)));
        assert!(matches!(interpret("ls"), Line::Output(out) if out.contains("command not found")));
        assert!(matches!(interpret("sleep 0.5"), Line::Sleep(d) if d == Duration::from_millis(500)));
        assert!(matches!(interpret("sleep -1"), Line::Output(out) if out.starts_with("sleep:")));
    }

    #[tokio::test]
    async fn shell_echoes_and_exits_with_code() {
        let mock = MockEngine::new();
        let handle = running(&mock).await;
        let ExecStream {
            mut input,
            mut output,
            exit,
            kill: _kill,
            ..
        } = mock.exec_interactive(handle.id(), &[]).await.unwrap();

        input.write_all(b"echo hello\nexit 3\n").await.unwrap();
        assert_eq!(output.recv().await.unwrap(), b"hello\n");
        assert!(output.recv().await.is_none());
        assert_eq!(exit.await.unwrap(), 3);
        assert_eq!(mock.inputs(), vec!["echo hello", "exit 3"]);
    }

    #[tokio::test]
    async fn stop_kills_attached_shell() {
        let mock = MockEngine::new();
        let handle = running(&mock).await;
        let ExecStream {
            input: _input,
            exit,
            kill: _kill,
            ..
        } = mock.exec_interactive(handle.id(), &[]).await.unwrap();

        mock.stop(handle.id(), Duration::ZERO).await.unwrap();
        assert_eq!(exit.await.unwrap(), KILLED_EXIT_CODE);
        assert_eq!(mock.running_count(), 0);
        assert!(mock.exists(handle.name()));
    }

    #[tokio::test]
    async fn etx_cuts_short_a_running_command() {
        let mock = MockEngine::new();
        let handle = running(&mock).await;
        let ExecStream {
            mut input,
            mut output,
            exit,
            kill: _kill,
            ..
        } = mock.exec_interactive(handle.id(), &[]).await.unwrap();

        let started = tokio::time::Instant::now();
        input.write_all(b"sleep 30\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        input.write_all(&[INTERRUPT]).await.unwrap();
        input.write_all(b"echo after\nexit\n").await.unwrap();

        assert_eq!(output.recv().await.unwrap(), b"^C\n");
        assert_eq!(output.recv().await.unwrap(), b"after\n");
        assert_eq!(exit.await.unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(mock.interrupts(), 1);
    }

    #[tokio::test]
    async fn typeahead_waits_for_the_running_command() {
        let mock = MockEngine::new();
        let handle = running(&mock).await;
        let ExecStream {
            mut input,
            mut output,
            exit,
            kill: _kill,
            ..
        } = mock.exec_interactive(handle.id(), &[]).await.unwrap();

        input.write_all(b"sleep 0.1\necho done\nexit 2\n").await.unwrap();
        assert_eq!(output.recv().await.unwrap(), b"done\n");
        assert_eq!(exit.await.unwrap(), 2);
        assert_eq!(mock.interrupts(), 0);
    }

    #[tokio::test]
    async fn terminal_records_window_sizes() {
        let mock = MockEngine::new();
        let handle = running(&mock).await;
        let exec = mock.exec_interactive(handle.id(), &[]).await.unwrap();
        let size = TerminalSize {
            cols: 120,
            rows: 40,
        };
        exec.terminal.resize(size).unwrap();
        assert_eq!(mock.resizes(), vec![size]);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let mock = MockEngine::new();
        let spec = SandboxSpecBuilder::new(SandboxPolicy::default()).build(&Uuid::new_v4());
        mock.create(&spec).await.unwrap();
        assert!(matches!(
            mock.create(&spec).await,
            Err(EngineError::NameConflict(_))
        ));
        assert_eq!(mock.created_count(), 1);
    }
}
