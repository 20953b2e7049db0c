//! Binary entry point for the Hatch CLI.

use std::future::Future;
use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;

use hatch::logging::{self, LoggingError};
use hatch::{
    Bridge, ConfigError, CreateRequest, HatchConfig, KeyProvisioner, ProcessLauncher,
    ProviderFactory, ProviderKind, ProvidersConfig, ReconcileReport, Session, SessionError,
    SessionFilter, SessionManager, SessionRegistry, SessionSpec,
};

mod cli;

use cli::{Cli, Command, CreateCommand, ExecCommand, ListCommand};

/// Exit status used when the user interrupts a command.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to write output: {0}")]
    Output(String),
    #[error("{0} provider(s) could not be reconciled")]
    ReconcileIncomplete(usize),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Session(err) if err.is_cancelled() => INTERRUPTED_EXIT_CODE,
            _ => 1,
        }
    }
}

impl From<io::Error> for CliError {
    fn from(err: io::Error) -> Self {
        Self::Output(err.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        Self::Output(err.to_string())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.verbose) {
        report_logging_error(&err);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let exit_code = match dispatch(cli.command, &mut out).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };
    out.flush().ok();

    process::exit(exit_code);
}

async fn dispatch(command: Command, out: &mut impl Write) -> Result<i32, CliError> {
    let (config, mut manager) = build_manager()?;
    let outcome = match command {
        Command::Create(args) => {
            let cancel = interrupt_listener();
            let request = create_request(&args, &config)?;
            let session = manager.create(&request, cancel).await?;
            write_created(out, &session)?;
            Ok(0)
        }
        Command::List(args) => {
            let sessions = manager.list(&list_filter(&args)?)?;
            if args.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&sessions)?)?;
            } else {
                write_sessions(out, &sessions)?;
            }
            Ok(0)
        }
        Command::Connect(args) => Ok(manager.connect(&args.id)?),
        Command::Exec(ExecCommand { id, command }) => {
            validate_command_args(&command)?;
            Ok(manager.exec(&id, &command)?)
        }
        Command::Stop(args) => {
            let stopped = manager.stop(&args.id).await?;
            writeln!(out, "stopped {}", stopped.id)?;
            Ok(0)
        }
        Command::Reconcile(args) => {
            let report = manager.reconcile(args.terminate_untracked).await?;
            write_report(out, &report)?;
            if report.failures.is_empty() {
                Ok(0)
            } else {
                Err(CliError::ReconcileIncomplete(report.failures.len()))
            }
        }
    };
    manager.shutdown();
    outcome
}

fn build_manager() -> Result<(HatchConfig, SessionManager<ProcessLauncher>), CliError> {
    let config = HatchConfig::load_without_cli_args()?;
    let providers = ProvidersConfig::load_without_cli_args(config.request_timeout())?;
    let registry = SessionRegistry::new(config.state_dir()?);
    let keys = KeyProvisioner::new(config.key_dir()?);
    let bridge = Bridge::with_process_launcher(
        config.ssh_bin.clone(),
        providers.codespaces.gh_bin.clone(),
    )
    .with_connect_timeout(config.request_timeout());
    let manager = SessionManager::new(ProviderFactory::initialize(&providers), registry, keys, bridge)
        .with_poll_policy(config.poll_policy())
        .with_cleanup_on_failure(config.cleanup_on_failure);
    Ok((config, manager))
}

fn create_request(args: &CreateCommand, config: &HatchConfig) -> Result<CreateRequest, CliError> {
    let provider = match args.provider.as_deref() {
        Some(name) => parse_provider(name)?,
        None => config.default_provider()?,
    };
    let spec = SessionSpec::builder(args.name.clone())
        .image(args.image.clone())
        .instance_type(args.instance_type.clone())
        .cpu(args.cpu.clone())
        .memory(args.memory.clone())
        .machine(args.machine.clone())
        .build()
        .map_err(|err| CliError::InvalidArgument(err.to_string()))?;
    Ok(CreateRequest::new(provider, spec).keep_on_failure(args.keep_on_failure))
}

fn parse_provider(name: &str) -> Result<ProviderKind, CliError> {
    name.parse()
        .map_err(|err: hatch::session::UnknownProvider| CliError::InvalidArgument(err.to_string()))
}

fn list_filter(args: &ListCommand) -> Result<SessionFilter, CliError> {
    let provider = args.provider.as_deref().map(parse_provider).transpose()?;
    let status = args
        .status
        .as_deref()
        .map(|raw| {
            raw.parse()
                .map_err(|err: hatch::session::UnknownStatus| {
                    CliError::InvalidArgument(err.to_string())
                })
        })
        .transpose()?;
    Ok(SessionFilter { provider, status })
}

/// Registers a Ctrl-C handler and returns a future that resolves on the
/// first interrupt after registration. Never resolves when the handler cannot
/// be installed.
#[cfg(unix)]
fn interrupt_listener() -> impl Future<Output = ()> {
    use tokio::signal::unix::{SignalKind, signal};

    let registered = signal(SignalKind::interrupt());
    async move {
        match registered {
            Ok(mut interrupts) => {
                if interrupts.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
}

/// Resolves on Ctrl-C. Never resolves when the handler cannot be installed.
#[cfg(not(unix))]
fn interrupt_listener() -> impl Future<Output = ()> {
    async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidArgument(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn write_created(out: &mut impl Write, session: &Session) -> io::Result<()> {
    let endpoint = session
        .endpoint()
        .map_or_else(|| String::from("-"), ToString::to_string);
    writeln!(out, "{} ready at {endpoint}", session.id)?;
    writeln!(out, "connect with: hatch connect {}", session.id)
}

fn write_sessions(out: &mut impl Write, sessions: &[Session]) -> io::Result<()> {
    if sessions.is_empty() {
        return writeln!(out, "no sessions");
    }
    writeln!(
        out,
        "{:<12}  {:<20}  {:<16}  {:<12}  {:<21}  HANDLE",
        "ID", "NAME", "PROVIDER", "STATUS", "ENDPOINT"
    )?;
    for session in sessions {
        let endpoint = session
            .endpoint()
            .map_or_else(|| String::from("-"), ToString::to_string);
        let handle = session
            .handle
            .as_ref()
            .map_or_else(|| String::from("-"), ToString::to_string);
        writeln!(
            out,
            "{:<12}  {:<20}  {:<16}  {:<12}  {:<21}  {handle}",
            session.id,
            session.name,
            session.provider,
            session.status(),
            endpoint
        )?;
    }
    Ok(())
}

fn write_report(out: &mut impl Write, report: &ReconcileReport) -> io::Result<()> {
    if report.is_clean() {
        return writeln!(out, "registry matches every available provider");
    }
    for session in &report.stale {
        writeln!(out, "dropped stale session {} ({})", session.id, session.provider)?;
    }
    for handle in &report.untracked {
        writeln!(out, "untracked {handle} (rerun with --terminate-untracked to remove)")?;
    }
    for handle in &report.terminated {
        writeln!(out, "terminated untracked {handle}")?;
    }
    for session in &report.unlisted {
        let handle = session
            .handle
            .as_ref()
            .map_or_else(|| String::from("-"), ToString::to_string);
        writeln!(
            out,
            "unchecked session {} ({handle} is outside the configured scope)",
            session.id
        )?;
    }
    for failure in &report.failures {
        writeln!(out, "{}: {}", failure.provider, failure.message)?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn report_logging_error(err: &LoggingError) {
    writeln!(io::stderr(), "warning: {err}").ok();
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
