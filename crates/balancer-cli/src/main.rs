use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "balance",
    about = "Grid balancer — op model selection and core placement",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Balance a workload and place it on the core grid.
    ///
    /// The workload is a JSON file with the graph, the legal op models of
    /// every op keyed by op name, and optional buffering instructions.
    Place {
        /// Workload JSON file
        #[arg(short, long)]
        workload: String,
        /// Balancer config TOML (default: built-in wormhole config)
        #[arg(short, long)]
        config: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Run only the ribbon pass and show the chosen windows and models
    Ribbon {
        /// Workload JSON file
        #[arg(short, long)]
        workload: String,
        /// Balancer config TOML (default: built-in wormhole config)
        #[arg(short, long)]
        config: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print a default config as TOML
    Config {
        /// Device architecture: wormhole or grayskull
        #[arg(short, long, default_value = "wormhole")]
        arch: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("balance=info".parse()?)
        )
        .init();

    let cli = Cli::parse();

    let output = match cli.command {
        Commands::Place { workload, config, format } => {
            commands::place::place(&workload, config.as_deref(), &format)?
        }
        Commands::Ribbon { workload, config, format } => {
            commands::ribbon::ribbon(&workload, config.as_deref(), &format)?
        }
        Commands::Config { arch } => commands::config::default_config(&arch)?,
    };
    print!("{output}");
    Ok(())
}
