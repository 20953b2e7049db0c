//! Interactive bridge between the local terminal and a ready session.
//!
//! The bridge only builds and launches the local client: `ssh` for sessions
//! with a network endpoint and `gh codespace ssh` for hosted containers. It
//! holds no lifecycle state and rejects sessions that are not ready.

use std::ffi::OsString;
use std::process::{Command, Stdio};
use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, info};

use crate::session::{Endpoint, ProviderKind, Session, SessionStatus};

/// Exit status `ssh` uses for connection failures.
pub const SSH_CONNECTION_FAILURE: i32 = 255;
/// How long `ssh` waits for the TCP connection unless configured otherwise.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const SSH_INSTALL_HINT: &str = "install an OpenSSH client (for example `apt install openssh-client`) or set HATCH_SSH_BIN";
const GH_INSTALL_HINT: &str =
    "install the GitHub CLI from https://cli.github.com or set HATCH_CODESPACES_GH_BIN";

/// A local client invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientCommand {
    /// Program to run.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl ClientCommand {
    /// Returns a shell-like command string for logs and assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Errors raised by a [`ClientLauncher`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LaunchError {
    /// The program is not installed or not on `PATH`.
    #[error("{program} not found")]
    NotFound {
        /// Program that was looked up.
        program: String,
    },
    /// The program exists but could not be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program being started.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Runs a local client with the caller's terminal attached.
pub trait ClientLauncher {
    /// Runs `command` to completion, returning its exit code (`None` when it
    /// was killed by a signal).
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] when the program cannot be found or started.
    fn launch(&self, command: &ClientCommand) -> Result<Option<i32>, LaunchError>;
}

/// Launcher that spawns real processes with inherited stdio.
#[derive(Clone, Debug, Default)]
pub struct ProcessLauncher;

impl ClientLauncher for ProcessLauncher {
    fn launch(&self, command: &ClientCommand) -> Result<Option<i32>, LaunchError> {
        let resolved = which::which(&command.program).map_err(|_| LaunchError::NotFound {
            program: command.program.clone(),
        })?;
        let status = Command::new(resolved)
            .args(&command.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| LaunchError::Spawn {
                program: command.program.clone(),
                message: err.to_string(),
            })?;
        Ok(status.code())
    }
}

/// Errors raised while bridging to a session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BridgeError {
    /// The session has no endpoint to connect to.
    #[error("session {id} is {status}, not ready")]
    NotReady {
        /// Session identifier.
        id: String,
        /// Current status.
        status: SessionStatus,
    },
    /// The local client is missing.
    #[error("{program} is not installed: {hint}")]
    LocalToolMissing {
        /// Missing program.
        program: String,
        /// How to install it.
        hint: &'static str,
    },
    /// The client could not reach the endpoint.
    #[error("could not connect to session {id} at {endpoint}")]
    ConnectionError {
        /// Session identifier.
        id: String,
        /// Endpoint that was tried.
        endpoint: Endpoint,
    },
    /// The client could not be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program being started.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The client was terminated by a signal.
    #[error("{program} was terminated by a signal")]
    Signalled {
        /// Program that was running.
        program: String,
    },
}

/// Builds and launches local clients for ready sessions.
#[derive(Clone, Debug)]
pub struct Bridge<L: ClientLauncher> {
    launcher: L,
    ssh_bin: String,
    gh_bin: String,
    connect_timeout: Duration,
}

impl Bridge<ProcessLauncher> {
    /// Creates a bridge that spawns real processes.
    #[must_use]
    pub fn with_process_launcher(ssh_bin: impl Into<String>, gh_bin: impl Into<String>) -> Self {
        Self::new(ProcessLauncher, ssh_bin, gh_bin)
    }
}

impl<L: ClientLauncher> Bridge<L> {
    /// Creates a bridge using `launcher`.
    #[must_use]
    pub fn new(launcher: L, ssh_bin: impl Into<String>, gh_bin: impl Into<String>) -> Self {
        Self {
            launcher,
            ssh_bin: ssh_bin.into(),
            gh_bin: gh_bin.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bounds how long `ssh` waits to reach the endpoint. Rounded up to
    /// whole seconds.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Opens an interactive shell and blocks until it exits.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] when the session is not ready, the client is
    /// missing, or the connection fails.
    pub fn attach(&self, session: &Session) -> Result<i32, BridgeError> {
        let command = self.client_command(session, None)?;
        self.run(session, &command)
    }

    /// Runs `command` non-interactively and returns its exit code.
    ///
    /// Each argument is shell-escaped before it reaches the remote shell.
    ///
    /// # Errors
    ///
    /// See [`Bridge::attach`].
    pub fn execute(&self, session: &Session, command: &[String]) -> Result<i32, BridgeError> {
        let remote = remote_command_line(command);
        let client = self.client_command(session, Some(&remote))?;
        self.run(session, &client)
    }

    /// Builds the client invocation for `session`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] when the session has no endpoint.
    pub fn client_command(
        &self,
        session: &Session,
        remote: Option<&str>,
    ) -> Result<ClientCommand, BridgeError> {
        let endpoint = ready_endpoint(session)?;
        if session.provider == ProviderKind::HostedContainer {
            return Ok(self.gh_command(endpoint, remote));
        }
        Ok(self.ssh_command(session, endpoint, remote))
    }

    fn ssh_command(&self, session: &Session, endpoint: &Endpoint, remote: Option<&str>) -> ClientCommand {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(key) = &session.key {
            args.push(OsString::from("-i"));
            args.push(OsString::from(key.private_key.as_str()));
        }
        args.push(OsString::from("-p"));
        args.push(OsString::from(endpoint.port.to_string()));
        let connect_secs = self
            .connect_timeout
            .as_secs()
            .saturating_add(u64::from(self.connect_timeout.subsec_nanos() > 0))
            .max(1);
        let mut options = vec![
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("IdentitiesOnly=yes"),
            String::from("LogLevel=ERROR"),
            format!("ConnectTimeout={connect_secs}"),
        ];
        if remote.is_some() {
            options.push(String::from("BatchMode=yes"));
        } else {
            args.push(OsString::from("-t"));
        }
        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        let destination = session.login_user.as_deref().map_or_else(
            || endpoint.host.clone(),
            |user| format!("{user}@{}", endpoint.host),
        );
        args.push(OsString::from(destination));
        if let Some(line) = remote {
            args.push(OsString::from(line));
        }
        ClientCommand {
            program: self.ssh_bin.clone(),
            args,
        }
    }

    fn gh_command(&self, endpoint: &Endpoint, remote: Option<&str>) -> ClientCommand {
        let mut args: Vec<OsString> = ["codespace", "ssh", "-c"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(OsString::from(endpoint.host.as_str()));
        if let Some(line) = remote {
            args.push(OsString::from("--"));
            args.push(OsString::from(line));
        }
        ClientCommand {
            program: self.gh_bin.clone(),
            args,
        }
    }

    fn run(&self, session: &Session, command: &ClientCommand) -> Result<i32, BridgeError> {
        debug!(session = %session.id, command = %command.command_string(), "launching client");
        let code = self
            .launcher
            .launch(command)
            .map_err(|err| self.launch_error(err))?;
        match code {
            Some(SSH_CONNECTION_FAILURE) => Err(BridgeError::ConnectionError {
                id: session.id.clone(),
                endpoint: ready_endpoint(session)?.clone(),
            }),
            Some(exit) => {
                info!(session = %session.id, exit, "client exited");
                Ok(exit)
            }
            None => Err(BridgeError::Signalled {
                program: command.program.clone(),
            }),
        }
    }

    fn launch_error(&self, err: LaunchError) -> BridgeError {
        match err {
            LaunchError::NotFound { program } => {
                let hint = if program == self.gh_bin {
                    GH_INSTALL_HINT
                } else {
                    SSH_INSTALL_HINT
                };
                BridgeError::LocalToolMissing { program, hint }
            }
            LaunchError::Spawn { program, message } => BridgeError::Spawn { program, message },
        }
    }
}

fn ready_endpoint(session: &Session) -> Result<&Endpoint, BridgeError> {
    session.endpoint().ok_or_else(|| BridgeError::NotReady {
        id: session.id.clone(),
        status: session.status(),
    })
}

/// Joins command arguments into one shell-escaped command line.
#[must_use]
pub fn remote_command_line(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
