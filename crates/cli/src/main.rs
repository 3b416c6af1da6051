mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tagcache")]
#[command(about = "Operational tooling for the Redis-backed tagged cache engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep stale tag references and report cleanup counters
    PruneStaleTags {
        /// Store to prune (must be Redis-backed); defaults to CACHE_DRIVER
        store: Option<String>,
    },

    /// Run the functional assertion suite against the configured store
    Doctor {
        /// Store to check; defaults to CACHE_DRIVER
        store: Option<String>,
    },

    /// Run write/read/flush/bulk benchmark scenarios
    Bench {
        /// Store to benchmark; defaults to CACHE_DRIVER
        store: Option<String>,

        /// Operations per scenario
        #[arg(long, default_value_t = 1000)]
        iterations: u64,

        /// Payload size in bytes
        #[arg(long, default_value_t = 64)]
        value_size: usize,

        /// Abort when resident memory crosses this percentage
        #[arg(long, default_value_t = 90.0)]
        memory_limit: f64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::PruneStaleTags { store } => commands::prune::run(store.as_deref()).await,
        Commands::Doctor { store } => commands::doctor::run(store.as_deref()).await,
        Commands::Bench {
            store,
            iterations,
            value_size,
            memory_limit,
        } => commands::bench::run(store.as_deref(), iterations, value_size, memory_limit).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
