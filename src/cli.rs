use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "topoplay")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Turn service topologies into ordered playbooks and run them", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level; also lists operation outputs in `state show`
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Translate a topology and optionally run it against the executor
    Translate(TranslateArgs),

    /// Inspect or clear recorded cluster state
    #[command(subcommand)]
    State(StateCommand),

    /// Show the resolved configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Translate
// ============================================================================

#[derive(Args)]
pub struct TranslateArgs {
    /// Topology template (YAML)
    pub template: PathBuf,

    /// Cluster name, used to key recorded state
    #[arg(short, long)]
    pub cluster: String,

    /// Automation tool to render for
    #[arg(short, long, value_enum, default_value_t = ToolArg::Ansible)]
    pub tool: ToolArg,

    /// Tear the cluster down instead of deploying it
    #[arg(long)]
    pub delete: bool,

    /// Only parse and validate the template
    #[arg(long)]
    pub validate_only: bool,

    /// Extra task arguments as YAML (`global` plus per-resource mappings)
    #[arg(long)]
    pub extra: Option<String>,

    /// Topology input value (repeatable)
    #[arg(short, long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// Address attribute used for host addresses
    #[arg(long, default_value = "public_address", value_parser = ["public_address", "private_address"])]
    pub host_ip_parameter: String,

    /// Concurrently running operations (overrides `main.jobs`)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Render the script without contacting the executor
    #[arg(long)]
    pub render_only: bool,

    /// Executor endpoint (overrides `executor.endpoint`)
    #[arg(long, env = "TOPOPLAY_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Write the rendered script to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Skip confirmation prompts
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ToolArg {
    Ansible,
    Terraform,
}

// ============================================================================
// State Commands
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// Show the latest snapshot of every recorded instance
    Show {
        /// Cluster name
        cluster: String,
    },

    /// Delete the recorded state of a cluster
    Clear {
        /// Cluster name
        cluster: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show directories and the effective settings
    Show,
}
