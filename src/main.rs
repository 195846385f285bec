mod cli;
mod conf;
mod constraints;
mod deploy;
mod engine;
mod events;
mod lifecycle;
mod logstore;
mod models;
mod provider;
mod repository;
mod service;
mod syncer;

#[cfg(test)]
mod testutil;

use human_panic::setup_panic;

#[tokio::main]
async fn main() {
    setup_panic!();

    let cli = cli::Cli::new();

    if let Err(e) = cli.run().await {
        eprintln!("{:?}", e);
        std::process::exit(1)
    }
}
