/// CLI argument parsing

use clap::{Parser, Subcommand};

// Build timestamp injected at compile time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "dockmon")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Compose project directory (defaults to the current directory)
    #[arg(short, long, global = true)]
    pub project_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List services and containers
    Ps {
        /// Also list containers that back a service
        #[arg(short, long)]
        all: bool,

        /// Show exited containers (overrides the config)
        #[arg(short, long)]
        exited: bool,
    },

    /// Stream live CPU and memory usage
    Stats {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print the compose project's resolved configuration
    ComposeConfig,

    /// Show the effective configuration
    Config {
        /// Print the config file path only
        #[arg(long)]
        path: bool,

        /// Write the effective configuration to the config file
        #[arg(long, conflicts_with = "path")]
        init: bool,
    },
}
