//! Configuration types.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::dispatcher::MAX_TIMEOUT;
use crate::error::ConfigError;
use crate::process::{EnvPolicy, ProgramRef, SpawnConfig};

/// Default worker binary name, looked up next to the running executable.
pub const DEFAULT_WORKER_BINARY: &str = "offload-worker";

/// What `dispatch` does when every worker slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Reject immediately with `CapacityExceeded`.
    #[default]
    FailFast,
    /// Wait in FIFO order; callers beyond `max_waiting` are rejected.
    Queue { max_waiting: usize },
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker program; one process is spawned per request.
    pub program: ProgramRef,
    /// How worker processes are created.
    pub spawn: SpawnConfig,
    /// Maximum number of concurrently live worker processes.
    pub max_workers: usize,
    pub admission: AdmissionPolicy,
    /// Timeout used when the caller does not pick one.
    pub default_timeout: Duration,
    /// How long to wait for a killed or finished worker to exit.
    pub reap_timeout: Duration,
}

impl DispatcherConfig {
    pub fn new(program: ProgramRef) -> Self {
        Self {
            program,
            spawn: SpawnConfig::default(),
            max_workers: 4,
            admission: AdmissionPolicy::FailFast,
            default_timeout: Duration::from_secs(30),
            reap_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_spawn(mut self, spawn: SpawnConfig) -> Self {
        self.spawn = spawn;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }
}

/// Full service configuration (gateway + dispatcher).
#[derive(Debug, Clone)]
pub struct OffloadConfig {
    /// Address the HTTP gateway listens on.
    pub bind: SocketAddr,
    pub dispatcher: DispatcherConfig,
}

impl OffloadConfig {
    /// Build configuration from `OFFLOAD_*` environment variables.
    ///
    /// Unset variables fall back to defaults; set but unparseable values are
    /// errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind = parse_or(&lookup, "OFFLOAD_BIND", SocketAddr::from(([0, 0, 0, 0], 3000)))?;

        let program = match lookup("OFFLOAD_WORKER_PROGRAM") {
            Some(program) => ProgramRef::new(program),
            None => ProgramRef::new(default_worker_program()?.to_string_lossy()),
        };
        let program = program.args(
            lookup("OFFLOAD_WORKER_ARGS")
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string),
        );

        let max_workers: usize = parse_or(&lookup, "OFFLOAD_MAX_WORKERS", 4)?;
        if max_workers == 0 {
            return Err(invalid("OFFLOAD_MAX_WORKERS", "must be at least 1"));
        }

        let queue_depth: usize = parse_or(&lookup, "OFFLOAD_QUEUE_DEPTH", 16)?;
        let admission = match lookup("OFFLOAD_ADMISSION").as_deref() {
            None | Some("fail-fast") => AdmissionPolicy::FailFast,
            Some("queue") => AdmissionPolicy::Queue {
                max_waiting: queue_depth,
            },
            Some(other) => {
                return Err(invalid(
                    "OFFLOAD_ADMISSION",
                    &format!("expected 'fail-fast' or 'queue', got '{other}'"),
                ));
            }
        };

        let timeout_ms = parse_millis(&lookup, "OFFLOAD_TIMEOUT_MS", 30_000)?;
        if timeout_ms == 0 {
            return Err(invalid("OFFLOAD_TIMEOUT_MS", "must be positive"));
        }
        let grace_ms = parse_millis(&lookup, "OFFLOAD_KILL_GRACE_MS", 2_000)?;
        let isolate_env: bool = parse_or(&lookup, "OFFLOAD_WORKER_ISOLATE_ENV", false)?;

        let mut spawn = SpawnConfig::default().with_kill_grace(Duration::from_millis(grace_ms));
        if let Some(dir) = lookup("OFFLOAD_WORKER_CWD") {
            spawn = spawn.with_working_dir(dir);
        }
        if isolate_env {
            spawn = spawn.with_env(EnvPolicy::Isolated(BTreeMap::new()));
        }

        let dispatcher = DispatcherConfig::new(program)
            .with_spawn(spawn)
            .with_max_workers(max_workers)
            .with_admission(admission)
            .with_default_timeout(Duration::from_millis(timeout_ms))
            .with_reap_timeout(Duration::from_millis(grace_ms));

        Ok(Self { bind, dispatcher })
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        let program = default_worker_program()
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_WORKER_BINARY));
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            dispatcher: DispatcherConfig::new(ProgramRef::new(program.to_string_lossy())),
        }
    }
}

/// `offload-worker` in the directory of the current executable.
pub fn default_worker_program() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| ConfigError::WorkerProgram(format!("{} has no parent", exe.display())))?;
    Ok(dir.join(format!("{DEFAULT_WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX)))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
    }
}

/// A millisecond count no larger than [`MAX_TIMEOUT`].
fn parse_millis<F>(lookup: &F, key: &str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: u64 = parse_or(lookup, key, default)?;
    let max = MAX_TIMEOUT.as_millis() as u64;
    if ms > max {
        return Err(invalid(key, &format!("must be at most {max}")));
    }
    Ok(ms)
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = OffloadConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind.port(), 3000);
        assert_eq!(config.dispatcher.max_workers, 4);
        assert_eq!(config.dispatcher.admission, AdmissionPolicy::FailFast);
        assert_eq!(config.dispatcher.default_timeout, Duration::from_secs(30));
        assert!(
            config
                .dispatcher
                .program
                .program
                .contains(DEFAULT_WORKER_BINARY)
        );
        assert_eq!(config.dispatcher.spawn.env, EnvPolicy::Inherit);
    }

    #[test]
    fn default_matches_empty_environment() {
        let from_env = OffloadConfig::from_lookup(lookup(&[])).unwrap();
        let default = OffloadConfig::default();
        assert_eq!(default.bind, from_env.bind);
        assert_eq!(default.dispatcher.max_workers, from_env.dispatcher.max_workers);
        assert_eq!(default.dispatcher.program, from_env.dispatcher.program);
    }

    #[test]
    fn overrides() {
        let config = OffloadConfig::from_lookup(lookup(&[
            ("OFFLOAD_BIND", "127.0.0.1:8080"),
            ("OFFLOAD_WORKER_PROGRAM", "/usr/bin/python3"),
            ("OFFLOAD_WORKER_ARGS", "worker.py  --fast"),
            ("OFFLOAD_MAX_WORKERS", "8"),
            ("OFFLOAD_ADMISSION", "queue"),
            ("OFFLOAD_QUEUE_DEPTH", "3"),
            ("OFFLOAD_TIMEOUT_MS", "500"),
            ("OFFLOAD_KILL_GRACE_MS", "100"),
            ("OFFLOAD_WORKER_CWD", "/tmp"),
            ("OFFLOAD_WORKER_ISOLATE_ENV", "true"),
        ]))
        .unwrap();

        assert_eq!(config.bind.to_string(), "127.0.0.1:8080");
        assert_eq!(config.dispatcher.program.program, "/usr/bin/python3");
        assert_eq!(config.dispatcher.program.args, ["worker.py", "--fast"]);
        assert_eq!(config.dispatcher.max_workers, 8);
        assert_eq!(
            config.dispatcher.admission,
            AdmissionPolicy::Queue { max_waiting: 3 }
        );
        assert_eq!(config.dispatcher.default_timeout, Duration::from_millis(500));
        assert_eq!(config.dispatcher.spawn.kill_grace, Duration::from_millis(100));
        assert_eq!(
            config.dispatcher.spawn.working_dir,
            Some(PathBuf::from("/tmp"))
        );
        assert_eq!(
            config.dispatcher.spawn.env,
            EnvPolicy::Isolated(BTreeMap::new())
        );
    }

    #[test]
    fn invalid_values_are_errors() {
        for (key, value) in [
            ("OFFLOAD_MAX_WORKERS", "lots"),
            ("OFFLOAD_MAX_WORKERS", "0"),
            ("OFFLOAD_ADMISSION", "sometimes"),
            ("OFFLOAD_TIMEOUT_MS", "-1"),
            ("OFFLOAD_TIMEOUT_MS", "0"),
            ("OFFLOAD_TIMEOUT_MS", "18446744073709551615"),
            ("OFFLOAD_KILL_GRACE_MS", "18446744073709551615"),
            ("OFFLOAD_BIND", "nowhere"),
        ] {
            let err = OffloadConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            match err {
                ConfigError::InvalidValue { key: k, .. } => assert_eq!(k, key),
                other => panic!("unexpected error for {key}: {other}"),
            }
        }
    }
}
