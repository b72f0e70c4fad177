//! Options shared by every way of starting a child process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// Default grace period between a polite termination request and a forced kill.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// A program to run plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramRef {
    pub program: String,
    pub args: Vec<String>,
}

impl ProgramRef {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command line as a shell would see it (program and args joined by spaces).
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for ProgramRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Environment visible to the child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EnvPolicy {
    /// The creator's environment, unchanged.
    #[default]
    Inherit,
    /// The creator's environment plus (or overridden by) these variables.
    Extend(BTreeMap<String, String>),
    /// Only these variables. An empty map isolates completely.
    Isolated(BTreeMap<String, String>),
}

/// What to do with a child's output descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the creator's descriptors.
    #[default]
    Inherit,
    /// Capture through pipes.
    Piped,
    /// Discard.
    Ignored,
}

impl StdioMode {
    pub(crate) fn to_stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Piped => Stdio::piped(),
            Self::Ignored => Stdio::null(),
        }
    }
}

/// How to create a child process.
///
/// When `shell` is set the program reference is handed to `sh -c` (or
/// `cmd /C` on Windows), which enables pipes and redirects. The command line
/// is then interpreted by the shell, so any externally influenced text must
/// be validated by the caller first; `;`, `$(...)` and friends all work.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Working directory (if None, the creator's).
    pub working_dir: Option<PathBuf>,
    pub env: EnvPolicy,
    pub stdio: StdioMode,
    pub shell: bool,
    /// Time between SIGTERM and SIGKILL when a worker is asked to stop.
    pub kill_grace: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: EnvPolicy::Inherit,
            stdio: StdioMode::Inherit,
            shell: false,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl SpawnConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn with_shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Build a command for `program` honouring this config.
    ///
    /// Stdio is left to the caller since each entry point wires it differently.
    pub(crate) fn command(&self, program: &ProgramRef) -> Command {
        self.build_command(program, self.shell)
    }

    pub(crate) fn build_command(&self, program: &ProgramRef, shell: bool) -> Command {
        let mut command = if shell {
            let line = program.command_line();
            if cfg!(target_os = "windows") {
                let mut c = Command::new("cmd");
                c.args(["/C", line.as_str()]);
                c
            } else {
                let mut c = Command::new("sh");
                c.args(["-c", line.as_str()]);
                c
            }
        } else {
            let mut c = Command::new(&program.program);
            c.args(&program.args);
            c
        };

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        match &self.env {
            EnvPolicy::Inherit => {}
            EnvPolicy::Extend(vars) => {
                command.envs(vars);
            }
            EnvPolicy::Isolated(vars) => {
                command.env_clear().envs(vars);
            }
        }

        command
    }
}
