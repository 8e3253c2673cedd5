//! Runs one measurement on a node. The radio here is the simulator, configured to echo the
//! configured waveform (a tone, or the Zadoff-Chu frame train) with a chosen phase offset between
//! the two channels, so a whole session (including the rendezvous with `sync_server`) can be
//! exercised without hardware.

use clap::Parser;
use failure::Error;
use phase_sync::args::{init_logging, parse_gain_pair};
use phase_sync::config::{Config, TxWaveform};
use phase_sync::node::{run_node, NodeSettings};
use phase_sync::radio::HardwareClock;
use phase_sync::rendezvous::Participant;
use phase_sync::sim::{SimConfig, SimulatedRadio};
use phase_sync::stream::Waveform;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON config. Missing sections keep their defaults
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Experiment identifier stored with the capture
    #[clap(short, long, default_value = "0")]
    experiment: String,
    /// Measurement identifier stored with the capture
    #[clap(short, long, default_value = "0")]
    measurement: String,
    /// TX gains of channels A and B ("A,B" or one value for both)
    #[clap(long, value_parser = parse_gain_pair, default_value = "40")]
    tx_gain: [f64; 2],
    /// RX gains of channels A and B ("A,B" or one value for both)
    #[clap(long, value_parser = parse_gain_pair, default_value = "30")]
    rx_gain: [f64; 2],
    /// Directory the data and metadata files are written to
    #[clap(short, long, default_value = ".")]
    out_dir: PathBuf,
    /// Name of this node, used as rendezvous id and in file names
    #[clap(long, default_value = "node")]
    host: String,
    /// Wait for the SYNC of a coordinator before capturing
    #[clap(short, long)]
    rendezvous: bool,
    /// Phase offset (degrees) the simulated radio puts between channels A and B
    #[clap(long, default_value_t = 0.0)]
    sim_phase_deg: f64,
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

    // Ctrl-C before the capture ends the session, during the capture it keeps what was received
    let abort = Arc::new(AtomicBool::new(false));
    let abort_handler = abort.clone();
    ctrlc::set_handler(move || {
        abort_handler.store(true, Ordering::Relaxed);
    })?;

    let rx_frame = match config.stream.tx_waveform {
        TxWaveform::ZadoffChu => {
            let reference = config.reference.generate()?;
            Waveform::reference_frames(&reference, &[1.0], &[0.0], 0)?.channel(0).to_vec()
        }
        TxWaveform::Tone => Vec::new(),
    };
    let mut radio = SimulatedRadio::new(SimConfig {
        num_channels: config.stream.channels.iter().max().map_or(0, |c| c + 1),
        sample_rate: config.stream.sample_rate,
        tone_freq: config.timing.rx_lo_offset_hz,
        channel_phase: vec![args.sim_phase_deg.to_radians(), 0.0],
        rx_frame,
        noise: 1e-3,
        ..SimConfig::default()
    });

    let settings = NodeSettings {
        host: args.host.clone(),
        experiment_id: args.experiment.clone(),
        measurement_id: args.measurement.clone(),
        tx_gain: args.tx_gain,
        rx_gain: args.rx_gain,
        out_dir: args.out_dir.clone(),
    };

    let rendezvous = config.rendezvous.clone();
    let start_base = |radio: &SimulatedRadio| -> Result<f64, Error> {
        if args.rendezvous {
            info!(node = %args.host, coordinator = %rendezvous.request_addr, "joining rendezvous");
            let mut participant = Participant::connect(&args.host, &rendezvous)?;
            participant.wait_for_sync_or_abort(radio, &abort)
        } else {
            Ok(radio.time_now())
        }
    };

    match run_node(&mut radio, &config, &settings, start_base, &abort) {
        Ok(report) => {
            if report.saturated {
                warn!("capture is saturated, consider lowering the gains");
            }
            info!(
                path = %report.data_path.display(),
                samples = report.samples,
                tx_faults = report.tx_faults.total(),
                rx_faults = report.rx_faults.total(),
                "session complete"
            );
            Ok(())
        }
        Err(e) => {
            error!("session failed: {}", e);
            Err(e)
        }
    }
}
