//! # AvaSpec RS
//!
//! A Rust library for controlling Avantes spectrometers during
//! spectroelectrochemistry experiments.
//!
//! The library sequences calls into the vendor AvaSpec SDK: it activates a
//! spectrometer, commits an acquisition configuration, waits for scans and
//! hands back intensities trimmed to a region of interest. The SDK itself sits
//! behind the [`AvaSpecSdk`] trait; [`SimulatedAvaSpec`] implements it without
//! hardware.
//!
//! ## Features
//!
//! - **Typed lifecycle**: operations before `initialize` or after `close` fail with
//!   [`AvaSpectrometerError::NotInitialized`] instead of talking to a dead handle
//! - **Bounded waits**: every measurement times out, and can be cancelled from another thread
//! - **Typed vendor errors**: SDK status codes become [`AvsError`] values
//! - **Scoped release**: dropping the driver deactivates the device
//! - **DataFrame output**: spectra convert to `polars` DataFrames
//!
//! ## Examples
//!
//! ### Taking a Spectrum
//!
//! ```rust
//! use avaspec_rs::{AvaSpectrometer, DriverOptions, SimulatedAvaSpec};
//!
//! let mut spectrometer = AvaSpectrometer::open(SimulatedAvaSpec::new(), DriverOptions::default())?;
//!
//! spectrometer.set_integration_time(5.0)?;
//! spectrometer.set_scan_averages(10)?;
//!
//! let wavelengths = spectrometer.wavelengths()?;
//! let spectrum = spectrometer.measure()?;
//! assert_eq!(spectrum.len(), wavelengths.region.len());
//!
//! let df = spectrum.to_dataframe(&wavelengths.region)?;
//! println!("{}", df.head(Some(5)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Region of Interest and Triggering
//!
//! ```rust
//! use avaspec_rs::{
//!     AvaSpectrometer, DriverOptions, RegionOfInterest, SimulatedAvaSpec, TriggerMode,
//!     TriggerSourceType,
//! };
//! use std::time::Duration;
//!
//! let options = DriverOptions::default()
//!     .with_region(RegionOfInterest::Wavelengths { min_nm: 400.0, max_nm: 900.0 })
//!     .with_timeout_margin(Duration::from_secs(2));
//! let mut spectrometer = AvaSpectrometer::open(SimulatedAvaSpec::new(), options)?;
//!
//! spectrometer.set_trigger_mode(TriggerMode::Hardware)?;
//! spectrometer.set_source_type(TriggerSourceType::Edge)?;
//!
//! let timed = spectrometer.measure_with_timing()?;
//! println!("{:.3} ms over nominal", timed.overhead_ms);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Cancelling a Wait
//!
//! ```rust
//! use avaspec_rs::{AvaSpectrometer, AvaSpectrometerError, CancelToken, DriverOptions};
//! use avaspec_rs::simulated::{ReadyBehavior, SimulatedAvaSpec};
//!
//! let sim = SimulatedAvaSpec::new().with_ready_behavior(ReadyBehavior::Never);
//! let mut spectrometer = AvaSpectrometer::open(sim, DriverOptions::default())?;
//!
//! let cancel = CancelToken::new();
//! cancel.cancel();
//! assert!(matches!(
//!     spectrometer.measure_cancellable(&cancel),
//!     Err(AvaSpectrometerError::Cancelled)
//! ));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod ava_connector;
pub mod ava_sdk;
pub mod ava_spectrometer;
pub mod meas_config;
pub mod simulated;

// Re-export the main types for convenience
pub use meas_config::{
    AcquisitionConfig, ConfigError, Control, DarkCorrection, PixelRange, RegionOfInterest,
    Smoothing, TriggerMode, TriggerSettings, TriggerSource, TriggerSourceType,
};

pub use ava_sdk::{AvaDevice, AvaSpecSdk, AvsError, CommPort, DeviceHandle, DeviceStatus};

pub use ava_connector::{AvaConnection, AvaConnector, AvaConnectorError};

pub use ava_spectrometer::{
    AvaSpectrometer, AvaSpectrometerError, CancelToken, DriverOptions, PendingMeasurement,
    SpectrometerState, Spectrum, TimedSpectrum, Wavelengths,
};

pub use simulated::{ReadyBehavior, SimProbe, SimulatedAvaSpec};
