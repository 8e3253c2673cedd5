//! Walks a directory of captures and writes the circular phase statistics of every gain
//! configuration as CSV.

use clap::Parser;
use failure::{Error, ResultExt};
use phase_sync::aggregate::{process_directory, write_csv};
use phase_sync::args::init_logging;
use std::fs::File;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Directory searched (recursively) for data_*.iq captures
    dir: PathBuf,
    /// CSV output file. Written to stdout if not given
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Sample rate to assume instead of the one stored in the metadata
    #[clap(short, long)]
    sample_rate: Option<f64>,
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_logging(&args.verbose);

    let report = process_directory(&args.dir, args.sample_rate)?;
    if report.summaries.is_empty() {
        warn!(dir = %args.dir.display(), "no usable captures found");
    }
    for row in &report.summaries {
        info!(
            tx_gain = ?[row.tx_gain_a, row.tx_gain_b],
            rx_gain = ?[row.rx_gain_a, row.rx_gain_b],
            mean_deg = row.mean_degrees,
            std_deg = row.std_degrees,
            samples = row.samples,
            "group"
        );
    }

    match &args.output {
        Some(path) => {
            let file =
                File::create(path).with_context(|_| format!("creating {}", path.display()))?;
            write_csv(&report.summaries, file)?;
            info!(path = %path.display(), rows = report.summaries.len(), "table written");
        }
        None => write_csv(&report.summaries, std::io::stdout())?,
    }
    Ok(())
}
