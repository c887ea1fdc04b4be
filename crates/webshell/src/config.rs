use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "debian:12.12";
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_CPU_SHARE: f64 = 0.5;
pub const DEFAULT_STORAGE_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_STORAGE_PATH: &str = "/tmp";
pub const DEFAULT_NAME_PREFIX: &str = "web-shell-container";
pub const DEFAULT_ENTRY_COMMAND: &[&str] = &["/bin/bash"];
pub const DEFAULT_SHELL_COMMAND: &[&str] = &["/bin/bash", "-i"];
pub const DEFAULT_DOCKER_BIN: &str = "docker";

const DEFAULT_OPERATION_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_PROVISION_TIMEOUT_SECONDS: u64 = 120;
const DEFAULT_STOP_TIMEOUT_SECONDS: u64 = 2;
const DEFAULT_RELAY_GRACE_MILLIS: u64 = 2_000;
const DEFAULT_ATTACH_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_MAX_SESSIONS: usize = 64;

/// Resource policy applied to every sandbox. Never varies per session.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxPolicy {
    pub image: String,
    pub memory_limit_bytes: u64,
    pub cpu_share: f64,
    pub storage_limit_bytes: u64,
    pub storage_path: String,
    pub entry_command: Vec<String>,
    pub shell_command: Vec<String>,
    pub name_prefix: String,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_owned(),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            cpu_share: DEFAULT_CPU_SHARE,
            storage_limit_bytes: DEFAULT_STORAGE_LIMIT_BYTES,
            storage_path: DEFAULT_STORAGE_PATH.to_owned(),
            entry_command: owned(DEFAULT_ENTRY_COMMAND),
            shell_command: owned(DEFAULT_SHELL_COMMAND),
            name_prefix: DEFAULT_NAME_PREFIX.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    /// Bound on create/start, which may include an image pull.
    pub provision: Duration,
    /// Bound on every other engine call.
    pub operation: Duration,
    /// Grace the engine gives the sandbox before killing it on stop.
    pub stop: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            provision: Duration::from_secs(DEFAULT_PROVISION_TIMEOUT_SECONDS),
            operation: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECONDS),
            stop: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECONDS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub relay_grace: Duration,
    pub attach_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            relay_grace: Duration::from_millis(DEFAULT_RELAY_GRACE_MILLIS),
            attach_timeout: Duration::from_secs(DEFAULT_ATTACH_TIMEOUT_SECONDS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub docker_bin: String,
    pub policy: SandboxPolicy,
    pub timeouts: EngineTimeouts,
    pub session: SessionOptions,
    pub max_sessions: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            docker_bin: DEFAULT_DOCKER_BIN.to_owned(),
            policy: SandboxPolicy::default(),
            timeouts: EngineTimeouts::default(),
            session: SessionOptions::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ShellConfig {
    /// Reads `WEBSHELL_*` overrides. Unparseable values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let policy = SandboxPolicy {
            image: env_string("WEBSHELL_IMAGE").unwrap_or(defaults.policy.image),
            memory_limit_bytes: env_parse(
                "WEBSHELL_MEMORY_BYTES",
                defaults.policy.memory_limit_bytes,
            ),
            cpu_share: env_parse("WEBSHELL_CPU_SHARE", defaults.policy.cpu_share),
            storage_limit_bytes: env_parse(
                "WEBSHELL_STORAGE_BYTES",
                defaults.policy.storage_limit_bytes,
            ),
            storage_path: env_string("WEBSHELL_STORAGE_PATH")
                .unwrap_or(defaults.policy.storage_path),
            entry_command: defaults.policy.entry_command,
            shell_command: env_string("WEBSHELL_SHELL")
                .map(|value| value.split_whitespace().map(str::to_owned).collect())
                .unwrap_or(defaults.policy.shell_command),
            name_prefix: env_string("WEBSHELL_NAME_PREFIX").unwrap_or(defaults.policy.name_prefix),
        };
        let timeouts = EngineTimeouts {
            provision: Duration::from_secs(env_parse(
                "WEBSHELL_PROVISION_TIMEOUT_SECS",
                defaults.timeouts.provision.as_secs(),
            )),
            operation: Duration::from_secs(env_parse(
                "WEBSHELL_OPERATION_TIMEOUT_SECS",
                defaults.timeouts.operation.as_secs(),
            )),
            stop: Duration::from_secs(env_parse(
                "WEBSHELL_STOP_TIMEOUT_SECS",
                defaults.timeouts.stop.as_secs(),
            )),
        };
        let session = SessionOptions {
            relay_grace: Duration::from_millis(env_parse(
                "WEBSHELL_RELAY_GRACE_MS",
                DEFAULT_RELAY_GRACE_MILLIS,
            )),
            attach_timeout: Duration::from_secs(env_parse(
                "WEBSHELL_ATTACH_TIMEOUT_SECS",
                defaults.session.attach_timeout.as_secs(),
            )),
        };
        Self {
            docker_bin: env_string("WEBSHELL_DOCKER_BIN").unwrap_or(defaults.docker_bin),
            policy,
            timeouts,
            session,
            max_sessions: env_parse("WEBSHELL_MAX_SESSIONS", defaults.max_sessions).max(1),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    let Some(raw) = env_string(key) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}
