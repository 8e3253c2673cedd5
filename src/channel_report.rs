//! Aligns captures of the Zadoff-Chu frame train and writes the per-frame phase of every capture
//! relative to the first one as CSV.

use clap::Parser;
use failure::{Error, ResultExt};
use phase_sync::align::PeakPolicy;
use phase_sync::args::init_logging;
use phase_sync::channel_est::{frame_phases, load_captures, write_frame_phases};
use phase_sync::config::Config;
use phase_sync::radio::Sample;
use std::fs::File;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Raw IQ files (little-endian f32 pairs). The first capture is the phase reference
    #[clap(required = true)]
    files: Vec<PathBuf>,
    /// Channels stored in each file, one after the other
    #[clap(long, default_value_t = 1)]
    channels: usize,
    /// JSON config. Only the reference section is used
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Keep only local correlation maxima within this many samples instead of every sample
    /// above the threshold
    #[clap(long)]
    peak_radius: Option<usize>,
    /// CSV output file. Written to stdout if not given
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_logging(&args.verbose);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let reference = config.reference.generate()?;
    let policy = match args.peak_radius {
        Some(radius) => PeakPolicy::LocalMaximum { radius },
        None => PeakPolicy::default(),
    };

    let captures = load_captures(&args.files, args.channels)?;
    if captures.len() < 2 {
        warn!(captures = captures.len(), "need at least two captures for a relative phase");
    }
    let views: Vec<&[Sample]> = captures.iter().map(|c| c.as_slice()).collect();
    let rows = frame_phases(&views, &reference, config.reference.threshold, policy)?;
    if rows.is_empty() {
        warn!(threshold = config.reference.threshold, "no complete frames found");
    }
    for row in &rows {
        info!(
            frame = row.frame,
            offset = row.offset,
            capture = row.capture,
            phase_deg = row.phase_degrees,
            "relative phase"
        );
    }

    match &args.output {
        Some(path) => {
            let file =
                File::create(path).with_context(|_| format!("creating {}", path.display()))?;
            write_frame_phases(&rows, file)?;
            info!(path = %path.display(), rows = rows.len(), "table written");
        }
        None => write_frame_phases(&rows, std::io::stdout())?,
    }
    Ok(())
}
