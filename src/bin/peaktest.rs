//! Diagnostic binary: generates a synthetic two-peak master trace through
//! `SimulatedAnalogIo` and reports the peak times `find_peaks` recovers.
//! Useful for sanity-checking a `PeakCriterion` value against a given trace
//! shape without wiring up the full control loop.

use clap::Parser;

use translock::analog_sim::SimulatedAnalogIo;
use translock::peak_finder::find_peaks;
use translock::scan_clock::ScanConfig;
use translock::traits::{AnalogIo, ChannelRole};

#[derive(Parser, Debug)]
#[command(author, version, about = "Peak-detector diagnostic over a simulated master trace")]
struct Args {
    #[arg(long, default_value_t = 1000)]
    samples: usize,

    #[arg(long, default_value_t = 10.0)]
    scan_time_ms: f64,

    #[arg(long, default_value_t = 0.2)]
    criterion: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let config = ScanConfig {
        min_voltage: -5.0,
        max_voltage: 5.0,
        offset: 0.0,
        amplitude: 2.0,
        samples: args.samples,
        scan_time_ms: args.scan_time_ms,
    };

    let mut sim = SimulatedAnalogIo::new(args.seed, &config, 0);
    let traces = sim
        .read_synchronized(&[ChannelRole::Master], args.samples)
        .expect("simulated acquisition should not fail");

    let dx_ms = args.scan_time_ms / (args.samples - 1) as f64;
    let time_grid: Vec<f64> = (0..args.samples).map(|i| i as f64 * dx_ms).collect();

    let peaks = find_peaks(&traces[0], &time_grid, dx_ms, args.criterion);

    println!("criterion={} samples={} scan_time_ms={}", args.criterion, args.samples, args.scan_time_ms);
    println!("found {} peak(s):", peaks.len());
    for (i, peak) in peaks.iter().enumerate() {
        println!("  [{i}] t={:.4}ms amplitude={:.4}", peak.time_ms, peak.amplitude);
    }
    if peaks.len() == 2 {
        let interval = peaks[1].time_ms - peaks[0].time_ms;
        println!("interval={:.4}ms", interval);
    }
}
