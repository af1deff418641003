mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand,
    mode::{ModeArg, SubsystemArg},
    policy::PolicySubcommand,
    slm::SlmSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "lifecyclectl",
    about = "Operate index and snapshot lifecycle policies",
    version,
    propagate_version = true
)]
struct Cli {
    /// Lifecycle root (default: nearest directory holding .lifecycle/)
    #[arg(long, global = true, env = "LIFECYCLE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Identity recorded as the execution identity of stored policies
    #[arg(long, global = true, env = "LIFECYCLE_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .lifecycle/ with a default config and an empty store
    Init,

    /// Manage index lifecycle policies
    Policy {
        #[command(subcommand)]
        subcommand: PolicySubcommand,
    },

    /// Put an index under a policy
    Bind {
        index: String,
        policy: String,
    },

    /// Stop managing an index
    Unbind { index: String },

    /// Show lifecycle progress (all managed indices when INDEX is omitted)
    Explain { index: Option<String> },

    /// Re-arm the errored step of an index
    Retry { index: String },

    /// Force an index onto another step of its policy
    Move {
        index: String,
        /// Target step as phase/action/step
        #[arg(long)]
        to: String,
        /// Only move if the index is currently on this step
        #[arg(long)]
        from: Option<String>,
    },

    /// Show or change the operation mode of a loop
    Mode {
        #[arg(value_enum)]
        subsystem: SubsystemArg,
        /// start or stop; omit to show the current mode
        #[arg(value_enum)]
        set: Option<ModeArg>,
    },

    /// Manage snapshot lifecycle policies
    Slm {
        #[command(subcommand)]
        subcommand: SlmSubcommand,
    },

    /// Inspect and validate .lifecycle/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let identity = cli.identity.as_deref();

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Policy { subcommand } => cmd::policy::run(&root, subcommand, identity, cli.json),
        Commands::Bind { index, policy } => {
            cmd::index::bind(&root, &index, &policy, identity, cli.json)
        }
        Commands::Unbind { index } => cmd::index::unbind(&root, &index),
        Commands::Explain { index } => cmd::index::explain(&root, index.as_deref(), cli.json),
        Commands::Retry { index } => cmd::index::retry(&root, &index, cli.json),
        Commands::Move { index, to, from } => {
            cmd::index::move_to(&root, &index, &to, from.as_deref(), cli.json)
        }
        Commands::Mode { subsystem, set } => cmd::mode::run(&root, subsystem, set, cli.json),
        Commands::Slm { subcommand } => cmd::slm::run(&root, subcommand, identity, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
