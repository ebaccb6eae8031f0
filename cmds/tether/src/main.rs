use anyhow::Result;
use clap::{Parser, Subcommand};
use tether::{
	commands::{self, util::BrokenPipeGuard},
	telemetry,
};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Apply Kubernetes manifests and prune what is no longer declared", long_about = None)]
#[command(version)]
struct Cli {
	/// Log level (trace, debug, info, warn, error). Overrides RUST_LOG.
	#[arg(long, global = true)]
	log_level: Option<tracing::Level>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Apply manifests, grouped into instances, and prune removed resources
	Apply(commands::apply::ApplyArgs),

	/// Delete instances and the resources they own
	Delete(commands::delete::DeleteArgs),

	/// Install the Instance custom resource definition
	Install(commands::install::InstallArgs),
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	telemetry::init(cli.log_level)?;

	let stdout = BrokenPipeGuard::new(std::io::stdout());

	match cli.command {
		Commands::Apply(args) => commands::apply::run(args, stdout),
		Commands::Delete(args) => commands::delete::run(args, stdout),
		Commands::Install(args) => commands::install::run(args, stdout),
	}
}
