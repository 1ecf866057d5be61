use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-lifecycle")]
#[command(about = "Application lifecycle control plane for managed Kubernetes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the control API server and background loops
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
        #[arg(long, default_value = "config.yaml")]
        config: String,
        /// Use the in-memory store instead of DynamoDB (local development)
        #[arg(long)]
        memory_store: bool,
    },

    /// Run one discovery scan and print what was projected
    Discover {
        #[arg(long, default_value = "config.yaml")]
        config: String,
    },

    /// List registered applications from the store
    List {
        #[arg(long, default_value = "config.yaml")]
        config: String,
    },

    /// Check connectivity to the cluster, AWS, and the registry table
    Check {
        #[arg(long, default_value = "config.yaml")]
        config: String,
    },
}
