// Repeated acquisition example
//
// Takes a series of spectra and writes them as CSV, one file per spectrum.
// Uses the simulated device; swap in an `AvaSpecSdk` implementation for real hardware.

use avaspec_rs::{
    AvaSpectrometer, CommPort, DriverOptions, RegionOfInterest, SimulatedAvaSpec, TriggerMode,
};
use clap::Parser;
use polars::prelude::*;
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "acquire")]
#[command(version = "1.0")]
#[command(about = "Acquire a series of spectra from an Avantes spectrometer")]
#[command(long_about = "Acquire a series of spectra and write each one as a wavelength/intensity CSV file. Useful for checking that the device keeps pace with the configured timing.")]
struct Args {
    /// Serial number of the spectrometer to use
    #[arg(short, long, help = "Serial number; the first device found is used when omitted")]
    serial: Option<String>,

    /// Integration time in milliseconds
    #[arg(short, long, default_value_t = 10.0, help = "Integration time per scan in milliseconds")]
    integration_time: f32,

    /// Number of scans averaged per spectrum
    #[arg(short, long, default_value_t = 20)]
    averages: u32,

    /// Number of spectra to take
    #[arg(short, long, default_value_t = 5)]
    count: usize,

    /// Shortest wavelength to keep (nm)
    #[arg(long, default_value_t = 380.0)]
    min_nm: f64,

    /// Longest wavelength to keep (nm)
    #[arg(long, default_value_t = 1100.0)]
    max_nm: f64,

    /// Wait for an external trigger before each scan
    #[arg(long)]
    hardware_trigger: bool,

    /// Directory to write CSV files to
    #[arg(short, long, help = "Write one CSV per spectrum into this directory")]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut options = DriverOptions::default()
        .with_comm_port(CommPort::Usb)
        .with_region(RegionOfInterest::Wavelengths {
            min_nm: args.min_nm,
            max_nm: args.max_nm,
        })
        .with_integration_time(args.integration_time)
        .with_averages(args.averages)
        .with_timeout_margin(Duration::from_secs(10));
    if let Some(serial) = &args.serial {
        options = options.with_serial_number(serial.clone());
    }

    let mut spectrometer = AvaSpectrometer::open(SimulatedAvaSpec::new(), options)?;
    if args.hardware_trigger {
        spectrometer.set_trigger_mode(TriggerMode::Hardware)?;
    }

    println!("AvaSpec Acquisition");
    println!("===================");
    println!("Device: {}", spectrometer.serial_number()?);
    println!(
        "Integration: {} ms x {} averages",
        args.integration_time, args.averages
    );
    println!();

    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir)?;
    }

    let wavelengths = spectrometer.wavelengths()?;
    let mut overheads = Vec::with_capacity(args.count);

    for i in 0..args.count {
        let timed = spectrometer.measure_with_timing()?;
        overheads.push(timed.overhead_ms);
        println!(
            "Spectrum {:>3}: t={:?} wall={:?} overhead={:.3} ms",
            i + 1,
            timed.spectrum.device_time(),
            timed.wall_time,
            timed.overhead_ms
        );

        if let Some(dir) = &args.output {
            let mut df = timed.spectrum.to_dataframe(&wavelengths.region)?;
            let path = dir.join(format!("spectrum_{:04}.csv", i + 1));
            let mut file = File::create(&path)?;
            CsvWriter::new(&mut file).finish(&mut df)?;
        }
    }

    if !overheads.is_empty() {
        let mean = overheads.iter().sum::<f64>() / overheads.len() as f64;
        println!("\nMean overhead: {:.3} ms", mean);
    }

    Ok(())
}
