use crate::ava_connector::{AvaConnection, AvaConnector, AvaConnectorError};
use crate::ava_sdk::{AvaSpecSdk, AvsError, CommPort, DeviceHandle, RawScan, TIMESTAMP_TICK};
use crate::meas_config::{
    AcquisitionConfig, ConfigError, DarkCorrection, PixelRange, RegionOfInterest, Smoothing,
    TriggerMode, TriggerSource, TriggerSourceType, DEFAULT_AVERAGES, DEFAULT_INTEGRATION_TIME_MS,
};
use polars::prelude::*;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum AvaSpectrometerError {
    #[error("Connection error: {0}")]
    Connector(#[from] AvaConnectorError),

    #[error("Spectrometer is not initialized")]
    NotInitialized,

    #[error("Spectrometer is already initialized")]
    AlreadyInitialized,

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("No scan ready after {waited:?}")]
    AcquisitionTimeout { waited: Duration },

    #[error("Measurement cancelled")]
    Cancelled,

    #[error("Scan holds {actual} pixels, the region of interest needs {expected}")]
    ShortScan { expected: usize, actual: usize },

    #[error("AvaSpec library error: {0}")]
    Sdk(#[from] AvsError),
}

const WAVELENGTH_COLUMN_NAME: &str = "wavelength_nm";
const INTENSITY_COLUMN_NAME: &str = "intensity";

/// How the driver talks to the device and what it hands back.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub comm_port: CommPort,
    /// Activate this device instead of the first one found.
    pub serial_number: Option<String>,
    pub high_res_adc: bool,
    pub region: RegionOfInterest,
    pub poll_interval: Duration,
    /// Added to the nominal acquisition time to bound every wait for a scan.
    pub timeout_margin: Duration,
    pub integration_time_ms: f32,
    pub averages: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            comm_port: CommPort::Usb,
            serial_number: None,
            high_res_adc: true,
            region: RegionOfInterest::default(),
            poll_interval: Duration::from_millis(1),
            timeout_margin: Duration::from_secs(5),
            integration_time_ms: DEFAULT_INTEGRATION_TIME_MS,
            averages: DEFAULT_AVERAGES,
        }
    }
}

impl DriverOptions {
    pub fn with_comm_port(mut self, port: CommPort) -> Self {
        self.comm_port = port;
        self
    }

    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_high_res_adc(mut self, enable: bool) -> Self {
        self.high_res_adc = enable;
        self
    }

    pub fn with_region(mut self, region: RegionOfInterest) -> Self {
        self.region = region;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout_margin(mut self, margin: Duration) -> Self {
        self.timeout_margin = margin;
        self
    }

    pub fn with_integration_time(mut self, ms: f32) -> Self {
        self.integration_time_ms = ms;
        self
    }

    pub fn with_averages(mut self, averages: u32) -> Self {
        self.averages = averages;
        self
    }
}

/// Cooperative cancellation for blocking waits. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One acquisition trimmed to the region of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    timestamp: u32,
    first_pixel: usize,
    intensities: Vec<f64>,
}

impl Spectrum {
    fn from_raw(raw: RawScan, device: &ActiveDevice) -> Result<Self, AvaSpectrometerError> {
        // The device returns pixels starting at the committed start pixel.
        let offset = device.region.start() - usize::from(device.config.start_pixel);
        let expected = offset + device.region.len();
        let intensities = raw
            .intensities
            .get(offset..expected)
            .ok_or(AvaSpectrometerError::ShortScan {
                expected,
                actual: raw.intensities.len(),
            })?
            .to_vec();

        Ok(Self {
            timestamp: raw.timestamp,
            first_pixel: device.region.start(),
            intensities,
        })
    }

    /// Device clock at the end of the scan, in 10 µs ticks.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn device_time(&self) -> Duration {
        TIMESTAMP_TICK * self.timestamp
    }

    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }

    pub fn into_intensities(self) -> Vec<f64> {
        self.intensities
    }

    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }

    /// Detector pixels the intensities belong to.
    pub fn pixels(&self) -> RangeInclusive<usize> {
        self.first_pixel..=self.first_pixel + self.intensities.len().saturating_sub(1)
    }

    /// Pair the intensities with their wavelengths. `wavelengths` must be
    /// trimmed to the same region, see [`Wavelengths::region`].
    pub fn to_dataframe(&self, wavelengths: &[f64]) -> PolarsResult<DataFrame> {
        if wavelengths.len() != self.intensities.len() {
            return Err(PolarsError::ShapeMismatch(
                format!(
                    "{} wavelengths for {} intensities",
                    wavelengths.len(),
                    self.intensities.len()
                )
                .into(),
            ));
        }
        DataFrame::new(vec![
            Series::new(WAVELENGTH_COLUMN_NAME.into(), wavelengths).into(),
            Series::new(INTENSITY_COLUMN_NAME.into(), &self.intensities).into(),
        ])
    }
}

/// A spectrum together with how long it took to get it.
#[derive(Debug, Clone)]
pub struct TimedSpectrum {
    pub spectrum: Spectrum,
    pub wall_time: Duration,
    /// Wall time minus integration time times averages, in ms.
    pub overhead_ms: f64,
}

impl TimedSpectrum {
    fn new(spectrum: Spectrum, wall_time: Duration, nominal_ms: f64) -> Self {
        Self {
            spectrum,
            wall_time,
            overhead_ms: wall_time.as_secs_f64() * 1000.0 - nominal_ms,
        }
    }
}

/// Wavelength calibration, whole detector and region of interest.
#[derive(Debug, Clone, PartialEq)]
pub struct Wavelengths {
    pub full: Vec<f64>,
    pub region: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrometerState {
    Uninitialized,
    Ready,
    Closed,
}

#[derive(Debug)]
struct ActiveDevice {
    handle: DeviceHandle,
    serial_number: String,
    detector_name: String,
    pixel_count: u16,
    wavelengths: Vec<f64>,
    config: AcquisitionConfig,
    region: PixelRange,
}

impl ActiveDevice {
    /// The region of interest has to lie inside the pixels the device reads out.
    fn check_region(&self, config: &AcquisitionConfig) -> Result<(), ConfigError> {
        let scanned = usize::from(config.start_pixel)..=usize::from(config.stop_pixel);
        if scanned.contains(&self.region.start()) && scanned.contains(&self.region.stop()) {
            Ok(())
        } else {
            Err(ConfigError::PixelRange {
                start: config.start_pixel,
                stop: config.stop_pixel,
                pixel_count: self.pixel_count,
            })
        }
    }
}

#[derive(Debug)]
enum Session {
    Uninitialized,
    Ready(ActiveDevice),
    Closed,
}

/// Driver for one Avantes spectrometer.
///
/// Owns the device handle from [`initialize`](Self::initialize) until
/// [`close`](Self::close). Dropping a ready driver closes it.
pub struct AvaSpectrometer<S: AvaSpecSdk> {
    sdk: S,
    options: DriverOptions,
    session: Session,
}

impl<S: AvaSpecSdk> AvaSpectrometer<S> {
    pub fn new(sdk: S, options: DriverOptions) -> Self {
        Self {
            sdk,
            options,
            session: Session::Uninitialized,
        }
    }

    /// Create a driver and initialize it.
    pub fn open(sdk: S, options: DriverOptions) -> Result<Self, AvaSpectrometerError> {
        let mut spectrometer = Self::new(sdk, options);
        spectrometer.initialize()?;
        Ok(spectrometer)
    }

    /// Activate the device and commit the default configuration.
    ///
    /// Returns the committed configuration and the serial number of the
    /// activated device. On failure nothing stays activated.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn initialize(&mut self) -> Result<(AcquisitionConfig, String), AvaSpectrometerError> {
        match self.session {
            Session::Uninitialized => {}
            Session::Ready(_) => return Err(AvaSpectrometerError::AlreadyInitialized),
            Session::Closed => return Err(AvaSpectrometerError::NotInitialized),
        }

        let count = match AvaConnector::init_library(&mut self.sdk, self.options.comm_port) {
            Ok(count) => count,
            Err(e) => {
                self.release_library();
                return Err(e.into());
            }
        };
        if count == 0 {
            self.release_library();
            return Err(AvaConnectorError::NoDeviceFound {
                serial: self.options.serial_number.clone(),
            }
            .into());
        }

        let connection =
            match AvaConnector::connect(&mut self.sdk, self.options.serial_number.as_deref()) {
                Ok(connection) => connection,
                Err(e) => {
                    self.release_library();
                    return Err(e.into());
                }
            };

        let handle = connection.handle;
        let device = match self.setup_device(connection) {
            Ok(device) => device,
            Err(e) => {
                if let Err(deactivate_error) = self.sdk.deactivate(handle) {
                    log::warn!("Failed to deactivate handle {}: {}", handle, deactivate_error);
                }
                self.release_library();
                return Err(e);
            }
        };

        let result = (device.config.clone(), device.serial_number.clone());
        self.session = Session::Ready(device);
        Ok(result)
    }

    fn setup_device(
        &mut self,
        connection: AvaConnection,
    ) -> Result<ActiveDevice, AvaSpectrometerError> {
        let handle = connection.handle;

        let parameters = self.sdk.device_parameters(handle)?;
        log::debug!(
            "Detector {} with {} pixels",
            parameters.detector_name,
            parameters.pixel_count
        );

        let wavelengths = self.sdk.wavelengths(handle)?;
        let region = self.options.region.resolve(&wavelengths)?;
        log::debug!(
            "Region of interest: pixels {}..={}",
            region.start(),
            region.stop()
        );

        log::debug!("High resolution ADC: {}", self.options.high_res_adc);
        self.sdk.use_high_res_adc(handle, self.options.high_res_adc)?;

        let config = AcquisitionConfig::for_detector(parameters.pixel_count)
            .with_integration_time(self.options.integration_time_ms)
            .with_averages(self.options.averages);
        let device = ActiveDevice {
            handle,
            serial_number: connection.device.serial_number,
            detector_name: parameters.detector_name,
            pixel_count: parameters.pixel_count,
            wavelengths,
            config,
            region,
        };
        Self::commit(&mut self.sdk, &device, &device.config)?;
        Ok(device)
    }

    fn commit(
        sdk: &mut S,
        device: &ActiveDevice,
        config: &AcquisitionConfig,
    ) -> Result<(), ConfigError> {
        config.validate(device.pixel_count)?;
        device.check_region(config)?;
        sdk.prepare_measure(device.handle, config)
            .map_err(ConfigError::Rejected)?;
        log::debug!(
            "Committed configuration: {} ms x {} averages, pixels {}..={}, {} trigger",
            config.integration_time_ms,
            config.averages,
            config.start_pixel,
            config.stop_pixel,
            config.trigger.mode.as_str()
        );
        Ok(())
    }

    fn release_library(&mut self) {
        if let Err(e) = self.sdk.done() {
            log::warn!("Failed to release AvaSpec library: {}", e);
        }
    }

    fn ready_parts(&mut self) -> Result<(&mut S, &mut ActiveDevice), AvaSpectrometerError> {
        match &mut self.session {
            Session::Ready(device) => Ok((&mut self.sdk, device)),
            _ => Err(AvaSpectrometerError::NotInitialized),
        }
    }

    fn device(&self) -> Result<&ActiveDevice, AvaSpectrometerError> {
        match &self.session {
            Session::Ready(device) => Ok(device),
            _ => Err(AvaSpectrometerError::NotInitialized),
        }
    }

    pub fn state(&self) -> SpectrometerState {
        match self.session {
            Session::Uninitialized => SpectrometerState::Uninitialized,
            Session::Ready(_) => SpectrometerState::Ready,
            Session::Closed => SpectrometerState::Closed,
        }
    }

    pub fn serial_number(&self) -> Result<&str, AvaSpectrometerError> {
        Ok(&self.device()?.serial_number)
    }

    pub fn detector_name(&self) -> Result<&str, AvaSpectrometerError> {
        Ok(&self.device()?.detector_name)
    }

    pub fn pixel_count(&self) -> Result<u16, AvaSpectrometerError> {
        Ok(self.device()?.pixel_count)
    }

    /// The configuration last accepted by the device.
    pub fn config(&self) -> Result<&AcquisitionConfig, AvaSpectrometerError> {
        Ok(&self.device()?.config)
    }

    /// Wavelength calibration as last read from the device.
    pub fn calibration(&self) -> Result<&[f64], AvaSpectrometerError> {
        Ok(&self.device()?.wavelengths)
    }

    pub fn region(&self) -> Result<PixelRange, AvaSpectrometerError> {
        Ok(self.device()?.region)
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn sdk(&self) -> &S {
        &self.sdk
    }

    /// Re-read the wavelength calibration from the device.
    pub fn wavelengths(&mut self) -> Result<Wavelengths, AvaSpectrometerError> {
        let (sdk, device) = self.ready_parts()?;
        let full = sdk.wavelengths(device.handle)?;
        let region = device
            .region
            .trim(&full)
            .ok_or(AvaSpectrometerError::ShortScan {
                expected: device.region.stop() + 1,
                actual: full.len(),
            })?
            .to_vec();
        device.wavelengths.clone_from(&full);
        Ok(Wavelengths { full, region })
    }

    /// Change the configuration and commit it.
    ///
    /// The change is validated first; if the device rejects it the previous
    /// configuration stays in effect.
    pub fn update_config<F>(&mut self, update: F) -> Result<(), AvaSpectrometerError>
    where
        F: FnOnce(&mut AcquisitionConfig),
    {
        let (sdk, device) = self.ready_parts()?;
        let mut candidate = device.config.clone();
        update(&mut candidate);
        Self::commit(sdk, device, &candidate)?;
        device.config = candidate;
        Ok(())
    }

    pub fn set_integration_time(&mut self, ms: f32) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.integration_time_ms = ms)?;
        log::debug!("Integration time set to {} ms", ms);
        Ok(())
    }

    pub fn set_integration_delay(&mut self, delay: u32) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.integration_delay = delay)
    }

    pub fn set_scan_averages(&mut self, averages: u32) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.averages = averages)?;
        log::debug!("Number of averages set to {}", averages);
        Ok(())
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.trigger.mode = mode)?;
        log::debug!("Trigger mode set to {}", mode.as_str());
        Ok(())
    }

    pub fn set_trigger_source(&mut self, source: TriggerSource) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.trigger.source = source)
    }

    pub fn set_source_type(
        &mut self,
        source_type: TriggerSourceType,
    ) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.trigger.source_type = source_type)?;
        log::debug!("Trigger source type set to {}", source_type.as_str());
        Ok(())
    }

    pub fn set_dark_correction(
        &mut self,
        correction: DarkCorrection,
    ) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.dark_correction = correction)
    }

    pub fn set_smoothing(&mut self, smoothing: Smoothing) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.smoothing = smoothing)
    }

    pub fn set_saturation_detection(&mut self, level: u8) -> Result<(), AvaSpectrometerError> {
        self.update_config(|config| config.saturation_detection = level)
    }

    /// Start one acquisition without waiting for it.
    pub fn start_measurement(&mut self) -> Result<PendingMeasurement<'_, S>, AvaSpectrometerError> {
        let poll_interval = self.options.poll_interval;
        let timeout_margin = self.options.timeout_margin;
        let (sdk, device) = self.ready_parts()?;

        sdk.measure(device.handle, 1)?;
        log::debug!("Measurement started on handle {}", device.handle);

        Ok(PendingMeasurement {
            timeout: timeout_margin + device.config.nominal_acquisition_time(),
            sdk,
            device,
            poll_interval,
            started: Instant::now(),
            settled: false,
        })
    }

    /// Take one spectrum, blocking until the device has it or the wait times out.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn measure(&mut self) -> Result<Spectrum, AvaSpectrometerError> {
        self.start_measurement()?.wait(None)
    }

    /// Like [`measure`](Self::measure), but gives up as soon as `cancel` fires.
    pub fn measure_cancellable(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<Spectrum, AvaSpectrometerError> {
        self.start_measurement()?.wait(Some(cancel))
    }

    /// Take one spectrum and report how far the wall time exceeded the
    /// configured integration time times averages.
    pub fn measure_with_timing(&mut self) -> Result<TimedSpectrum, AvaSpectrometerError> {
        let nominal_ms = self.device()?.config.nominal_acquisition_ms();
        let started = Instant::now();
        let spectrum = self.measure()?;
        let timed = TimedSpectrum::new(spectrum, started.elapsed(), nominal_ms);
        log::debug!(
            "Scan took {:?}, {:.3} ms over nominal",
            timed.wall_time,
            timed.overhead_ms
        );
        Ok(timed)
    }

    /// Release the device. Closing again is a no-op.
    pub fn close(&mut self) -> Result<(), AvaSpectrometerError> {
        match std::mem::replace(&mut self.session, Session::Closed) {
            Session::Ready(device) => {
                let deactivated = self.sdk.deactivate(device.handle);
                let released = self.sdk.done();
                log::info!("Spectrometer {} connection closed", device.serial_number);
                deactivated?;
                released?;
                Ok(())
            }
            Session::Uninitialized | Session::Closed => Ok(()),
        }
    }
}

impl<S: AvaSpecSdk> Drop for AvaSpectrometer<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close spectrometer: {}", e);
        }
    }
}

/// A started acquisition. Dropping it before a spectrum was read stops the
/// acquisition on the device.
pub struct PendingMeasurement<'a, S: AvaSpecSdk> {
    sdk: &'a mut S,
    device: &'a ActiveDevice,
    poll_interval: Duration,
    timeout: Duration,
    started: Instant,
    settled: bool,
}

impl<S: AvaSpecSdk> PendingMeasurement<'_, S> {
    /// Poll once; read the spectrum if the device has it.
    pub fn try_get(&mut self) -> Result<Option<Spectrum>, AvaSpectrometerError> {
        if self.settled || !self.sdk.poll_scan(self.device.handle)? {
            return Ok(None);
        }
        let raw = self.sdk.scope_data(self.device.handle)?;
        self.settled = true;
        Spectrum::from_raw(raw, self.device).map(Some)
    }

    /// Block until the spectrum is read, the timeout passes or `cancel` fires.
    pub fn wait(mut self, cancel: Option<&CancelToken>) -> Result<Spectrum, AvaSpectrometerError> {
        loop {
            if let Some(spectrum) = self.try_get()? {
                log::debug!("Scan ready after {:?}", self.started.elapsed());
                return Ok(spectrum);
            }

            if cancel.is_some_and(CancelToken::is_cancelled) {
                self.stop();
                return Err(AvaSpectrometerError::Cancelled);
            }

            let waited = self.started.elapsed();
            if waited >= self.timeout {
                self.stop();
                return Err(AvaSpectrometerError::AcquisitionTimeout { waited });
            }

            thread::sleep(self.poll_interval.min(self.timeout - waited));
        }
    }

    /// Stop the acquisition on the device.
    pub fn cancel(mut self) -> Result<(), AvaSpectrometerError> {
        self.settled = true;
        self.sdk.stop_measure(self.device.handle)?;
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn stop(&mut self) {
        self.settled = true;
        if let Err(e) = self.sdk.stop_measure(self.device.handle) {
            log::warn!("Failed to stop measurement: {}", e);
        }
    }
}

impl<S: AvaSpecSdk> Drop for PendingMeasurement<'_, S> {
    fn drop(&mut self) {
        if !self.settled {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{ReadyBehavior, SimProbe, SimulatedAvaSpec};

    fn open_simulated(options: DriverOptions) -> (AvaSpectrometer<SimulatedAvaSpec>, SimProbe) {
        let sim = SimulatedAvaSpec::new();
        let probe = sim.probe();
        let spectrometer = AvaSpectrometer::open(sim, options).unwrap();
        (spectrometer, probe)
    }

    fn assert_not_initialized<T>(result: Result<T, AvaSpectrometerError>) {
        assert!(matches!(result, Err(AvaSpectrometerError::NotInitialized)));
    }

    fn assert_every_operation_not_initialized(spectrometer: &mut AvaSpectrometer<SimulatedAvaSpec>) {
        assert_not_initialized(spectrometer.measure());
        assert_not_initialized(spectrometer.measure_with_timing());
        assert_not_initialized(spectrometer.measure_cancellable(&CancelToken::new()));
        assert_not_initialized(spectrometer.start_measurement().map(|_| ()));
        assert_not_initialized(spectrometer.wavelengths());
        assert_not_initialized(spectrometer.set_integration_time(10.0));
        assert_not_initialized(spectrometer.set_trigger_mode(TriggerMode::Hardware));
        assert_not_initialized(spectrometer.set_source_type(TriggerSourceType::Level));
        assert_not_initialized(spectrometer.set_scan_averages(5));
        assert_not_initialized(spectrometer.update_config(|config| config.averages = 2));
        assert_not_initialized(spectrometer.serial_number());
        assert_not_initialized(spectrometer.config());
    }

    #[test]
    fn test_operations_before_initialize() {
        let sim = SimulatedAvaSpec::new();
        let probe = sim.probe();
        let mut spectrometer = AvaSpectrometer::new(sim, DriverOptions::default());

        assert_eq!(spectrometer.state(), SpectrometerState::Uninitialized);
        assert_every_operation_not_initialized(&mut spectrometer);
        assert_eq!(probe.commit_count(), 0);
        assert_eq!(probe.measurements_started(), 0);
    }

    #[test]
    fn test_initialize_commits_defaults() {
        let sim = SimulatedAvaSpec::new();
        let probe = sim.probe();
        let mut spectrometer = AvaSpectrometer::new(sim, DriverOptions::default());

        let (config, serial) = spectrometer.initialize().unwrap();
        assert_eq!(serial, "1102185U1");
        assert_eq!(config.stop_pixel, 2047);
        assert_eq!(config.averages, 200);
        assert_eq!(probe.last_committed(), Some(config));
        assert!(probe.high_res_adc());
        assert_eq!(spectrometer.state(), SpectrometerState::Ready);
        assert_eq!(spectrometer.pixel_count().unwrap(), 2048);
        assert_eq!(spectrometer.detector_name().unwrap(), "HAMS9201");

        assert!(matches!(
            spectrometer.initialize(),
            Err(AvaSpectrometerError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_operations_after_close() {
        let (mut spectrometer, _probe) = open_simulated(DriverOptions::default());
        spectrometer.close().unwrap();

        assert_eq!(spectrometer.state(), SpectrometerState::Closed);
        assert_every_operation_not_initialized(&mut spectrometer);
        assert_not_initialized(spectrometer.initialize());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut spectrometer, probe) = open_simulated(DriverOptions::default());
        spectrometer.close().unwrap();
        spectrometer.close().unwrap();
        drop(spectrometer);

        assert_eq!(probe.deactivate_calls(), 1);
        assert_eq!(probe.done_calls(), 1);
        assert_eq!(probe.active_handles(), 0);
    }

    #[test]
    fn test_drop_releases_device() {
        let sim = SimulatedAvaSpec::new();
        let probe = sim.probe();

        let failing_sequence = || -> Result<(), AvaSpectrometerError> {
            let mut spectrometer = AvaSpectrometer::open(sim, DriverOptions::default())?;
            spectrometer.measure()?;
            spectrometer.set_scan_averages(0)?;
            spectrometer.measure()?;
            Ok(())
        };

        assert!(matches!(
            failing_sequence(),
            Err(AvaSpectrometerError::Configuration(ConfigError::ZeroAverages))
        ));
        assert_eq!(probe.deactivate_calls(), 1);
        assert_eq!(probe.active_handles(), 0);
        assert!(!probe.library_initialized());
    }

    #[test]
    fn test_last_write_wins() {
        let (mut spectrometer, probe) = open_simulated(DriverOptions::default());
        assert_eq!(probe.commit_count(), 1);

        spectrometer.set_scan_averages(5).unwrap();
        spectrometer.set_scan_averages(10).unwrap();

        assert_eq!(probe.commit_count(), 3);
        assert_eq!(probe.last_committed().unwrap().averages, 10);
        assert_eq!(spectrometer.config().unwrap().averages, 10);
    }

    #[test]
    fn test_setters_commit_whole_config() {
        let (mut spectrometer, probe) = open_simulated(DriverOptions::default());

        spectrometer.set_integration_time(4.5).unwrap();
        spectrometer.set_trigger_mode(TriggerMode::Hardware).unwrap();
        spectrometer.set_source_type(TriggerSourceType::Level).unwrap();
        spectrometer
            .set_dark_correction(DarkCorrection {
                enable: true,
                forget_percentage: 50,
            })
            .unwrap();

        let committed = probe.last_committed().unwrap();
        assert_eq!(committed.integration_time_ms, 4.5);
        assert_eq!(committed.trigger.mode, TriggerMode::Hardware);
        assert_eq!(committed.trigger.source_type, TriggerSourceType::Level);
        assert!(committed.dark_correction.enable);
        assert_eq!(&committed, spectrometer.config().unwrap());
    }

    #[test]
    fn test_rejected_commit_keeps_previous_config() {
        let (mut spectrometer, probe) = open_simulated(DriverOptions::default());

        let result = spectrometer.set_integration_time(700_000.0);
        assert!(matches!(
            result,
            Err(AvaSpectrometerError::Configuration(ConfigError::Rejected(
                AvsError::InvalidIntTime
            )))
        ));
        assert_eq!(spectrometer.config().unwrap().integration_time_ms, DEFAULT_INTEGRATION_TIME_MS);
        assert_eq!(probe.commit_count(), 1);

        assert!(matches!(
            spectrometer.set_integration_time(-1.0),
            Err(AvaSpectrometerError::Configuration(ConfigError::InvalidIntegrationTime(_)))
        ));
    }

    #[test]
    fn test_measure_trims_to_region() {
        let (mut spectrometer, probe) = open_simulated(DriverOptions::default());

        let spectrum = spectrometer.measure().unwrap();
        assert_eq!(spectrum.len(), 1265);
        assert_eq!(spectrum.pixels(), 395..=1659);
        assert!(spectrum.timestamp() > 0);
        assert_eq!(probe.measurements_started(), 1);
        assert_eq!(probe.measurements_stopped(), 0);

        let later = spectrometer.measure().unwrap();
        assert!(later.timestamp() > spectrum.timestamp());
        assert!(later.device_time() > spectrum.device_time());
    }

    #[test]
    fn test_narrowed_readout_keeps_pixels_aligned() {
        let (mut spectrometer, _probe) = open_simulated(DriverOptions::default());
        let full = spectrometer.measure().unwrap();

        spectrometer
            .update_config(|config| {
                config.start_pixel = 100;
                config.stop_pixel = 1800;
            })
            .unwrap();
        let narrowed = spectrometer.measure().unwrap();
        assert_eq!(narrowed.intensities(), full.intensities());

        let result = spectrometer.update_config(|config| config.start_pixel = 500);
        assert!(matches!(
            result,
            Err(AvaSpectrometerError::Configuration(ConfigError::PixelRange { start: 500, .. }))
        ));
    }

    #[test]
    fn test_region_from_wavelengths() {
        let options = DriverOptions::default().with_region(RegionOfInterest::Wavelengths {
            min_nm: 380.0,
            max_nm: 1100.0,
        });
        let (mut spectrometer, _probe) = open_simulated(options);

        let wavelengths = spectrometer.wavelengths().unwrap();
        assert_eq!(wavelengths.full.len(), 2048);
        assert_eq!(spectrometer.calibration().unwrap(), &wavelengths.full[..]);
        assert_eq!(wavelengths.region.len(), 1264);
        assert!((wavelengths.region[0] - 380.15).abs() < 1e-6);
        assert_eq!(spectrometer.measure().unwrap().len(), 1264);
    }

    #[test]
    fn test_spectrum_to_dataframe() {
        let (mut spectrometer, _probe) = open_simulated(DriverOptions::default());
        let wavelengths = spectrometer.wavelengths().unwrap();
        let spectrum = spectrometer.measure().unwrap();

        let df = spectrum.to_dataframe(&wavelengths.region).unwrap();
        assert_eq!(df.height(), 1265);
        assert_eq!(df.width(), 2);
        let intensity = df.column(INTENSITY_COLUMN_NAME).unwrap().f64().unwrap();
        assert_eq!(intensity.get(0), Some(spectrum.intensities()[0]));

        assert!(spectrum.to_dataframe(&wavelengths.full).is_err());
    }

    #[test]
    fn test_measure_times_out_when_never_ready() {
        let sim = SimulatedAvaSpec::new().with_ready_behavior(ReadyBehavior::Never);
        let probe = sim.probe();
        let options = DriverOptions::default().with_timeout_margin(Duration::from_millis(50));
        let mut spectrometer = AvaSpectrometer::open(sim, options).unwrap();

        let started = Instant::now();
        let result = spectrometer.measure();
        let elapsed = started.elapsed();

        match result {
            Err(AvaSpectrometerError::AcquisitionTimeout { waited }) => {
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(probe.measurements_stopped(), 1);

        // The device is idle again and accepts new configuration.
        spectrometer.set_scan_averages(1).unwrap();
    }

    #[test]
    fn test_timeout_not_delayed_by_poll_interval() {
        let sim = SimulatedAvaSpec::new().with_ready_behavior(ReadyBehavior::Never);
        let options = DriverOptions::default()
            .with_timeout_margin(Duration::from_millis(50))
            .with_poll_interval(Duration::from_secs(2));
        let mut spectrometer = AvaSpectrometer::open(sim, options).unwrap();

        let started = Instant::now();
        let result = spectrometer.measure();
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(AvaSpectrometerError::AcquisitionTimeout { .. })
        ));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_failed_library_init_releases_library() {
        let sim = SimulatedAvaSpec::new().with_init_error(AvsError::DllInitialisation);
        let probe = sim.probe();
        let mut spectrometer = AvaSpectrometer::new(sim, DriverOptions::default());

        assert!(matches!(
            spectrometer.initialize(),
            Err(AvaSpectrometerError::Connector(AvaConnectorError::Sdk(
                AvsError::DllInitialisation
            )))
        ));
        assert_eq!(probe.done_calls(), 1);
        assert!(!probe.library_initialized());
        assert_eq!(spectrometer.state(), SpectrometerState::Uninitialized);
    }

    #[test]
    fn test_measure_cancelled() {
        let sim = SimulatedAvaSpec::new().with_ready_behavior(ReadyBehavior::Never);
        let probe = sim.probe();
        let mut spectrometer = AvaSpectrometer::open(sim, DriverOptions::default()).unwrap();

        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let started = Instant::now();
        let result = spectrometer.measure_cancellable(&cancel);
        canceller.join().unwrap();

        assert!(matches!(result, Err(AvaSpectrometerError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(probe.measurements_stopped(), 1);
    }

    #[test]
    fn test_pending_measurement() {
        let (mut spectrometer, probe) = open_simulated(DriverOptions::default());

        let mut pending = spectrometer.start_measurement().unwrap();
        assert!(pending.timeout() >= Duration::from_secs(5));
        assert_eq!(pending.try_get().unwrap(), None);
        assert_eq!(pending.try_get().unwrap(), None);
        let spectrum = pending.try_get().unwrap().unwrap();
        assert_eq!(spectrum.len(), 1265);
        drop(pending);
        assert_eq!(probe.measurements_stopped(), 0);

        let pending = spectrometer.start_measurement().unwrap();
        drop(pending);
        assert_eq!(probe.measurements_stopped(), 1);

        spectrometer.start_measurement().unwrap().cancel().unwrap();
        assert_eq!(probe.measurements_stopped(), 2);
    }

    #[test]
    fn test_measure_with_timing() {
        let (mut spectrometer, _probe) = open_simulated(
            DriverOptions::default()
                .with_integration_time(1.0)
                .with_averages(3),
        );
        let nominal_ms = spectrometer.config().unwrap().nominal_acquisition_ms();
        assert!((nominal_ms - 3.0).abs() < 1e-9);

        let timed = spectrometer.measure_with_timing().unwrap();
        assert_eq!(timed.spectrum.len(), 1265);
        let expected = timed.wall_time.as_secs_f64() * 1000.0 - nominal_ms;
        assert!((timed.overhead_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn test_timing_overhead_arithmetic() {
        let spectrum = Spectrum {
            timestamp: 0,
            first_pixel: 0,
            intensities: vec![],
        };
        let timed = TimedSpectrum::new(spectrum, Duration::from_millis(50), 44.0);
        assert!((timed.overhead_ms - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_device_found() {
        let sim = SimulatedAvaSpec::new().with_devices(Vec::<String>::new());
        let probe = sim.probe();
        let mut spectrometer = AvaSpectrometer::new(sim, DriverOptions::default());

        assert!(matches!(
            spectrometer.initialize(),
            Err(AvaSpectrometerError::Connector(AvaConnectorError::NoDeviceFound { .. }))
        ));
        assert_eq!(spectrometer.state(), SpectrometerState::Uninitialized);
        assert_eq!(probe.active_handles(), 0);
        assert!(!probe.library_initialized());
        assert_not_initialized(spectrometer.measure());
    }

    #[test]
    fn test_unknown_serial_number() {
        let sim = SimulatedAvaSpec::new();
        let options = DriverOptions::default().with_serial_number("9999999U9");
        assert!(matches!(
            AvaSpectrometer::open(sim, options),
            Err(AvaSpectrometerError::Connector(AvaConnectorError::NoDeviceFound { .. }))
        ));
    }

    #[test]
    fn test_activation_error() {
        let sim = SimulatedAvaSpec::new().with_failed_activation();
        let probe = sim.probe();
        assert!(matches!(
            AvaSpectrometer::open(sim, DriverOptions::default()),
            Err(AvaSpectrometerError::Connector(AvaConnectorError::Activation { .. }))
        ));
        assert!(!probe.library_initialized());
    }

    #[test]
    fn test_failed_setup_releases_handle() {
        let sim = SimulatedAvaSpec::new().with_pixel_count(1024);
        let probe = sim.probe();
        let mut spectrometer = AvaSpectrometer::new(sim, DriverOptions::default());

        assert!(matches!(
            spectrometer.initialize(),
            Err(AvaSpectrometerError::Configuration(ConfigError::InvalidRegion { pixel_count: 1024, .. }))
        ));
        assert_eq!(probe.deactivate_calls(), 1);
        assert_eq!(probe.active_handles(), 0);
        assert_eq!(probe.commit_count(), 0);

        drop(spectrometer);
        assert_eq!(probe.deactivate_calls(), 1);
    }
}
