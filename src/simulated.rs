//! An in-process spectrometer implementing [`AvaSpecSdk`].
//!
//! Spectra are a deterministic lamp profile so tests can compare scans
//! pixel by pixel. [`SimProbe`] shares the device state and stays usable after
//! the simulator has been moved into a driver.

use crate::ava_sdk::{
    AvaDevice, AvaSpecSdk, AvsError, CommPort, DeviceHandle, DeviceParameters, RawScan,
    INVALID_HANDLE_VALUE,
};
use crate::meas_config::AcquisitionConfig;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DEFAULT_SERIAL: &str = "1102185U1";
const DEFAULT_PIXELS: u16 = 2048;
const DETECTOR_NAME: &str = "HAMS9201";

/// Linear calibration putting pixel 395 near 380 nm and pixel 1658 near 1100 nm.
const CALIBRATION_OFFSET_NM: f64 = 155.0;
const CALIBRATION_STEP_NM: f64 = 0.57;

const MAX_INTEGRATION_TIME_MS: f32 = 600_000.0;
const ADC_FULL_SCALE: f64 = 65535.0;
const DARK_LEVEL: f64 = 1500.0;

/// When a started measurement reports ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyBehavior {
    /// Ready on the n-th poll after `measure`.
    AfterPolls(u32),
    /// Never ready, like a device waiting for a trigger that never comes.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Idle,
    Measuring { polls: u32 },
    Ready,
}

#[derive(Debug)]
struct SimState {
    library_initialized: bool,
    active: Vec<DeviceHandle>,
    current: Option<AcquisitionConfig>,
    committed: Vec<AcquisitionConfig>,
    high_res_adc: bool,
    scan: ScanState,
    clock: u32,
    measurements_started: u32,
    measurements_stopped: u32,
    deactivate_calls: u32,
    done_calls: u32,
}

impl SimState {
    fn new() -> Self {
        Self {
            library_initialized: false,
            active: Vec::new(),
            current: None,
            committed: Vec::new(),
            high_res_adc: false,
            scan: ScanState::Idle,
            clock: 0,
            measurements_started: 0,
            measurements_stopped: 0,
            deactivate_calls: 0,
            done_calls: 0,
        }
    }

    fn check_library(&self) -> Result<(), AvsError> {
        if self.library_initialized {
            Ok(())
        } else {
            Err(AvsError::DllInitialisation)
        }
    }

    fn check_handle(&self, handle: DeviceHandle) -> Result<(), AvsError> {
        self.check_library()?;
        if self.active.contains(&handle) {
            Ok(())
        } else {
            Err(AvsError::InvalidDeviceId)
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedAvaSpec {
    devices: Vec<AvaDevice>,
    pixel_count: u16,
    ready: ReadyBehavior,
    fail_activation: bool,
    init_error: Option<AvsError>,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedAvaSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAvaSpec {
    /// One 2048 pixel spectrometer that is ready on the third poll.
    pub fn new() -> Self {
        Self {
            devices: vec![AvaDevice::new(DEFAULT_SERIAL, "AvaSpec-ULS2048CL-EVO")],
            pixel_count: DEFAULT_PIXELS,
            ready: ReadyBehavior::AfterPolls(3),
            fail_activation: false,
            init_error: None,
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    pub fn with_devices<I, T>(mut self, serials: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.devices = serials
            .into_iter()
            .map(|serial| AvaDevice::new(serial, "AvaSpec-ULS2048CL-EVO"))
            .collect();
        self
    }

    pub fn with_pixel_count(mut self, pixel_count: u16) -> Self {
        self.pixel_count = pixel_count;
        self
    }

    pub fn with_ready_behavior(mut self, ready: ReadyBehavior) -> Self {
        self.ready = ready;
        self
    }

    /// Hand out the vendor's invalid handle on activation.
    pub fn with_failed_activation(mut self) -> Self {
        self.fail_activation = true;
        self
    }

    /// Fail library initialisation with `error`.
    pub fn with_init_error(mut self, error: AvsError) -> Self {
        self.init_error = Some(error);
        self
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn calibration(&self) -> Vec<f64> {
        (0..usize::from(self.pixel_count))
            .map(|pixel| CALIBRATION_OFFSET_NM + CALIBRATION_STEP_NM * pixel as f64)
            .collect()
    }

    /// Counts a lamp would produce at one pixel: a broad band around 650 nm
    /// on top of the dark level, growing with integration time until it saturates.
    fn intensity(pixel: usize, integration_time_ms: f32) -> f64 {
        let wavelength = CALIBRATION_OFFSET_NM + CALIBRATION_STEP_NM * pixel as f64;
        let profile = (-((wavelength - 650.0) / 220.0).powi(2)).exp();
        let signal = 40_000.0 * profile * f64::from(integration_time_ms);
        (DARK_LEVEL + signal).min(ADC_FULL_SCALE)
    }
}

impl AvaSpecSdk for SimulatedAvaSpec {
    fn init(&mut self, _port: CommPort) -> Result<u32, AvsError> {
        if let Some(error) = self.init_error {
            return Err(error);
        }
        lock(&self.state).library_initialized = true;
        Ok(self.devices.len() as u32)
    }

    fn device_list(&mut self) -> Result<Vec<AvaDevice>, AvsError> {
        lock(&self.state).check_library()?;
        Ok(self.devices.clone())
    }

    fn activate(&mut self, device: &AvaDevice) -> Result<DeviceHandle, AvsError> {
        let mut state = lock(&self.state);
        state.check_library()?;
        if self.fail_activation {
            return Ok(DeviceHandle::new(INVALID_HANDLE_VALUE));
        }

        let index = self
            .devices
            .iter()
            .position(|d| d.serial_number == device.serial_number)
            .ok_or(AvsError::DeviceNotFound)?;
        let handle = DeviceHandle::new(index as i32 + 1);
        if state.active.contains(&handle) {
            return Err(AvsError::InvalidState);
        }
        state.active.push(handle);
        Ok(handle)
    }

    fn device_parameters(&mut self, handle: DeviceHandle) -> Result<DeviceParameters, AvsError> {
        lock(&self.state).check_handle(handle)?;
        Ok(DeviceParameters {
            pixel_count: self.pixel_count,
            detector_name: DETECTOR_NAME.to_string(),
        })
    }

    fn wavelengths(&mut self, handle: DeviceHandle) -> Result<Vec<f64>, AvsError> {
        lock(&self.state).check_handle(handle)?;
        Ok(self.calibration())
    }

    fn use_high_res_adc(&mut self, handle: DeviceHandle, enable: bool) -> Result<(), AvsError> {
        let mut state = lock(&self.state);
        state.check_handle(handle)?;
        state.high_res_adc = enable;
        Ok(())
    }

    fn prepare_measure(
        &mut self,
        handle: DeviceHandle,
        config: &AcquisitionConfig,
    ) -> Result<(), AvsError> {
        let mut state = lock(&self.state);
        state.check_handle(handle)?;
        if state.scan != ScanState::Idle {
            return Err(AvsError::OperationPending);
        }
        if !(config.integration_time_ms > 0.0 && config.integration_time_ms <= MAX_INTEGRATION_TIME_MS) {
            return Err(AvsError::InvalidIntTime);
        }
        if config.averages == 0 {
            return Err(AvsError::InvalidParameter);
        }
        if config.start_pixel > config.stop_pixel || config.stop_pixel >= self.pixel_count {
            return Err(AvsError::InvalidPixelRange);
        }

        state.current = Some(config.clone());
        state.committed.push(config.clone());
        Ok(())
    }

    fn measure(&mut self, handle: DeviceHandle, count: u16) -> Result<(), AvsError> {
        let mut state = lock(&self.state);
        state.check_handle(handle)?;
        if count == 0 {
            return Err(AvsError::InvalidParameter);
        }
        if state.current.is_none() {
            return Err(AvsError::InvalidState);
        }
        if state.scan != ScanState::Idle {
            return Err(AvsError::OperationPending);
        }
        state.scan = ScanState::Measuring { polls: 0 };
        state.measurements_started += 1;
        Ok(())
    }

    fn poll_scan(&mut self, handle: DeviceHandle) -> Result<bool, AvsError> {
        let mut state = lock(&self.state);
        state.check_handle(handle)?;
        match state.scan {
            ScanState::Idle => Ok(false),
            ScanState::Ready => Ok(true),
            ScanState::Measuring { polls } => {
                let polls = polls + 1;
                let ready = matches!(self.ready, ReadyBehavior::AfterPolls(n) if polls >= n);
                state.scan = if ready {
                    ScanState::Ready
                } else {
                    ScanState::Measuring { polls }
                };
                Ok(ready)
            }
        }
    }

    fn scope_data(&mut self, handle: DeviceHandle) -> Result<RawScan, AvsError> {
        let mut state = lock(&self.state);
        state.check_handle(handle)?;
        if state.scan != ScanState::Ready {
            return Err(AvsError::InvalidMeasData);
        }
        let config = state.current.clone().ok_or(AvsError::InvalidState)?;

        let ticks = (config.nominal_acquisition_ms() * 100.0).round() as u32;
        state.clock = state.clock.wrapping_add(ticks.max(1));
        state.scan = ScanState::Idle;

        let intensities = (usize::from(config.start_pixel)..=usize::from(config.stop_pixel))
            .map(|pixel| Self::intensity(pixel, config.integration_time_ms))
            .collect();
        Ok(RawScan {
            timestamp: state.clock,
            intensities,
        })
    }

    fn stop_measure(&mut self, handle: DeviceHandle) -> Result<(), AvsError> {
        let mut state = lock(&self.state);
        state.check_handle(handle)?;
        state.scan = ScanState::Idle;
        state.measurements_stopped += 1;
        Ok(())
    }

    fn deactivate(&mut self, handle: DeviceHandle) -> Result<(), AvsError> {
        let mut state = lock(&self.state);
        state.deactivate_calls += 1;
        state.check_handle(handle)?;
        state.active.retain(|h| *h != handle);
        state.scan = ScanState::Idle;
        Ok(())
    }

    fn done(&mut self) -> Result<(), AvsError> {
        let mut state = lock(&self.state);
        state.done_calls += 1;
        state.library_initialized = false;
        state.active.clear();
        Ok(())
    }
}

/// Read-only view on a [`SimulatedAvaSpec`]'s state.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    /// Every configuration the device accepted, oldest first.
    pub fn committed_configs(&self) -> Vec<AcquisitionConfig> {
        lock(&self.state).committed.clone()
    }

    pub fn last_committed(&self) -> Option<AcquisitionConfig> {
        lock(&self.state).committed.last().cloned()
    }

    pub fn commit_count(&self) -> usize {
        lock(&self.state).committed.len()
    }

    pub fn active_handles(&self) -> usize {
        lock(&self.state).active.len()
    }

    pub fn library_initialized(&self) -> bool {
        lock(&self.state).library_initialized
    }

    pub fn high_res_adc(&self) -> bool {
        lock(&self.state).high_res_adc
    }

    pub fn measurements_started(&self) -> u32 {
        lock(&self.state).measurements_started
    }

    pub fn measurements_stopped(&self) -> u32 {
        lock(&self.state).measurements_stopped
    }

    pub fn deactivate_calls(&self) -> u32 {
        lock(&self.state).deactivate_calls
    }

    pub fn done_calls(&self) -> u32 {
        lock(&self.state).done_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activated() -> (SimulatedAvaSpec, DeviceHandle) {
        let mut sim = SimulatedAvaSpec::new();
        sim.init(CommPort::Usb).unwrap();
        let device = sim.device_list().unwrap().remove(0);
        let handle = sim.activate(&device).unwrap();
        (sim, handle)
    }

    #[test]
    fn test_calls_before_init_fail() {
        let mut sim = SimulatedAvaSpec::new();
        assert_eq!(sim.device_list(), Err(AvsError::DllInitialisation));
        assert_eq!(
            sim.poll_scan(DeviceHandle::new(1)),
            Err(AvsError::DllInitialisation)
        );
    }

    #[test]
    fn test_scan_follows_committed_pixels() {
        let (mut sim, handle) = activated();
        let mut config = AcquisitionConfig::for_detector(2048);
        config.start_pixel = 10;
        config.stop_pixel = 19;
        sim.prepare_measure(handle, &config).unwrap();

        sim.measure(handle, 1).unwrap();
        assert!(!sim.poll_scan(handle).unwrap());
        assert!(!sim.poll_scan(handle).unwrap());
        assert!(sim.poll_scan(handle).unwrap());

        let scan = sim.scope_data(handle).unwrap();
        assert_eq!(scan.intensities.len(), 10);
        assert!(scan.timestamp > 0);
        assert_eq!(sim.scope_data(handle), Err(AvsError::InvalidMeasData));
    }

    #[test]
    fn test_measure_requires_config() {
        let (mut sim, handle) = activated();
        assert_eq!(sim.measure(handle, 1), Err(AvsError::InvalidState));
    }

    #[test]
    fn test_rejects_out_of_range_config() {
        let (mut sim, handle) = activated();
        let config = AcquisitionConfig::for_detector(4096);
        assert_eq!(
            sim.prepare_measure(handle, &config),
            Err(AvsError::InvalidPixelRange)
        );
        let config = AcquisitionConfig::for_detector(2048).with_integration_time(700_000.0);
        assert_eq!(
            sim.prepare_measure(handle, &config),
            Err(AvsError::InvalidIntTime)
        );
        assert_eq!(sim.probe().commit_count(), 0);
    }

    #[test]
    fn test_intensity_saturates() {
        assert!(SimulatedAvaSpec::intensity(870, 0.022) > DARK_LEVEL);
        assert_eq!(SimulatedAvaSpec::intensity(870, 100.0), ADC_FULL_SCALE);
    }
}
