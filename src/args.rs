//! Pieces shared by the command line tools

use clap_verbosity_flag::Verbosity;

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

pub fn init_logging(verbose: &Verbosity) {
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(verbose.log_level_filter()))
        .init();
}

/// Parses "A,B" (or a single value used for both) into per-channel gains
pub fn parse_gain_pair(s: &str) -> Result<[f64; 2], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let parse = |p: &str| p.parse::<f64>().map_err(|e| format!("bad gain {:?}: {}", p, e));
    match parts.as_slice() {
        [both] => {
            let g = parse(both)?;
            Ok([g, g])
        }
        [a, b] => Ok([parse(a)?, parse(b)?]),
        _ => Err(format!("expected one or two gains, got {:?}", s)),
    }
}
