// Basic device activation and measurement example
//
// This example activates a spectrometer, takes one spectrum and prints a short summary.
// It runs against the simulated device, so no hardware is needed.

use avaspec_rs::{AvaSpectrometer, DriverOptions, SimulatedAvaSpec};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (optional)
    env_logger::init();

    println!("AvaSpec Measurement Example");
    println!("===========================\n");

    // 1. Activate the first spectrometer with the default configuration
    println!("1. Activating spectrometer...");
    let mut spectrometer = AvaSpectrometer::new(SimulatedAvaSpec::new(), DriverOptions::default());
    let (config, serial) = spectrometer.initialize()?;
    println!("   Serial number: {}", serial);
    println!(
        "   Detector: {} with {} pixels",
        spectrometer.detector_name()?,
        spectrometer.pixel_count()?
    );
    println!(
        "   Default configuration: {} ms x {} averages\n",
        config.integration_time_ms, config.averages
    );

    // 2. Adjust the acquisition
    println!("2. Setting integration time to 2 ms and averaging 50 scans...");
    spectrometer.set_integration_time(2.0)?;
    spectrometer.set_scan_averages(50)?;

    // 3. Measure
    println!("\n3. Measuring...");
    let wavelengths = spectrometer.wavelengths()?;
    let timed = spectrometer.measure_with_timing()?;
    let spectrum = &timed.spectrum;
    println!(
        "   {} pixels from {:.1} nm to {:.1} nm",
        spectrum.len(),
        wavelengths.region.first().copied().unwrap_or_default(),
        wavelengths.region.last().copied().unwrap_or_default()
    );
    println!(
        "   Took {:?} ({:.3} ms over nominal)",
        timed.wall_time, timed.overhead_ms
    );

    let (peak_index, peak) = spectrum
        .intensities()
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
    println!(
        "   Peak intensity {:.0} counts at {:.1} nm",
        peak, wavelengths.region[peak_index]
    );

    // 4. Release the device (also happens on drop)
    spectrometer.close()?;
    println!("\n4. Spectrometer connection closed");

    Ok(())
}
