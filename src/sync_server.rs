//! Rendezvous coordinator. Every round waits for the configured number of nodes to announce
//! themselves and then broadcasts one SYNC.

use clap::Parser;
use failure::Error;
use phase_sync::args::init_logging;
use phase_sync::config::Config;
use phase_sync::rendezvous::Coordinator;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON config. Only the rendezvous section is used
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Overrides the number of distinct nodes to wait for
    #[clap(short, long)]
    nodes: Option<usize>,
    /// Stop after this many rounds instead of serving forever
    #[clap(short, long)]
    rounds: Option<usize>,
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_logging(&args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(nodes) = args.nodes {
        config.rendezvous.expected_nodes = nodes;
    }

    let mut coordinator = Coordinator::bind(&config.rendezvous)?;
    let mut round = 0;
    while args.rounds.map_or(true, |max| round < max) {
        round += 1;
        info!(round, expected = config.rendezvous.expected_nodes, "waiting for nodes");
        let report = coordinator.run_round()?;
        info!(round, nodes = ?report.nodes, delivered = report.delivered, "round complete");
    }
    Ok(())
}
