//! Command-line interface definitions for the `hatch` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. It
//! depends on nothing but clap for that reason; values are parsed into
//! library types by the binary.

use clap::{ArgAction, Args, Parser, Subcommand};

/// Top-level CLI for the `hatch` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hatch",
    version,
    about = "Provision ephemeral remote sessions and connect to them over SSH",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). `HATCH_LOG`
    /// overrides this.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub(crate) verbose: u8,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `hatch`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Provision a session and wait until it accepts connections.
    #[command(name = "create")]
    Create(CreateCommand),
    /// List recorded sessions.
    #[command(name = "list")]
    List(ListCommand),
    /// Open an interactive shell on a ready session.
    #[command(name = "connect")]
    Connect(SessionArgs),
    /// Run a command on a ready session and exit with its status.
    #[command(name = "exec")]
    Exec(ExecCommand),
    /// Terminate a session and release its key.
    #[command(name = "stop")]
    Stop(SessionArgs),
    /// Compare recorded sessions with what each provider reports.
    #[command(name = "reconcile")]
    Reconcile(ReconcileCommand),
}

/// Arguments for `hatch create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Provider to use: vm-instance, container-task, or hosted-container.
    /// Defaults to `HATCH_DEFAULT_PROVIDER`.
    #[arg(long, short = 'p', value_name = "PROVIDER")]
    pub(crate) provider: Option<String>,
    /// Logical session name (lowercase letters, digits, hyphens).
    #[arg(long, short = 'n', value_name = "NAME", default_value = "session")]
    pub(crate) name: String,
    /// Image label (VMs) or container image reference (cluster pods).
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// Commercial instance type for VM sessions.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// CPU request for cluster sessions, for example `500m`.
    #[arg(long, value_name = "CPU")]
    pub(crate) cpu: Option<String>,
    /// Memory request for cluster sessions, for example `512Mi`.
    #[arg(long, value_name = "MEMORY")]
    pub(crate) memory: Option<String>,
    /// Machine type for hosted-container sessions.
    #[arg(long, value_name = "MACHINE")]
    pub(crate) machine: Option<String>,
    /// Keep a session that never becomes ready so it can be inspected.
    #[arg(long)]
    pub(crate) keep_on_failure: bool,
}

/// Arguments for `hatch list`.
#[derive(Debug, Args)]
pub(crate) struct ListCommand {
    /// Only sessions on this provider.
    #[arg(long, value_name = "PROVIDER")]
    pub(crate) provider: Option<String>,
    /// Only sessions with this status.
    #[arg(long, value_name = "STATUS")]
    pub(crate) status: Option<String>,
    /// Print records as JSON.
    #[arg(long)]
    pub(crate) json: bool,
}

/// A session identifier or unique prefix.
#[derive(Debug, Args)]
pub(crate) struct SessionArgs {
    /// Session id or unique id prefix.
    #[arg(value_name = "ID")]
    pub(crate) id: String,
}

/// Arguments for `hatch exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Session id or unique id prefix.
    #[arg(value_name = "ID")]
    pub(crate) id: String,
    /// Command to execute on the remote host (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `hatch reconcile`.
#[derive(Debug, Args)]
pub(crate) struct ReconcileCommand {
    /// Terminate backend resources that have no local record.
    #[arg(long)]
    pub(crate) terminate_untracked: bool,
}
