mod service;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "conveyor",
    about = "Pipeline execution controller for cluster-managed CI/CD",
    version
)]
pub struct Cli {
    /// Path to the controller configuration file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage the controller service.
    #[command(subcommand)]
    Service(ServiceCommands),
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommands {
    /// Start the pipeline execution controller.
    Start,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Service(ServiceCommands::Start) => service::start(&self.config).await,
        }
    }
}
