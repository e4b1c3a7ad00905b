//! The device layer the driver sequences: the subset of the Avantes AvaSpec
//! SDK needed to activate a spectrometer and pull scans out of it.
//!
//! Everything behind [`AvaSpecSdk`] is opaque to this crate. A native binding
//! implements the trait on top of the vendor library; [`crate::simulated`]
//! implements it in-process.

use crate::meas_config::AcquisitionConfig;
use std::fmt;
use std::time::Duration;

/// Handle value the vendor library hands out when activation failed.
pub const INVALID_HANDLE_VALUE: i32 = 1000;

/// Duration of one tick of the device timestamp counter.
pub const TIMESTAMP_TICK: Duration = Duration::from_micros(10);

/// Opaque identifier bound to one activated spectrometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(i32);

impl DeviceHandle {
    pub fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != INVALID_HANDLE_VALUE
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interfaces the library scans for devices on `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommPort {
    #[default]
    Usb,
    Ethernet,
    UsbAndEthernet,
}

impl CommPort {
    pub fn as_code(self) -> i16 {
        match self {
            CommPort::Usb => 0,
            CommPort::Ethernet => 256,
            CommPort::UsbAndEthernet => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Unknown,
    Available,
    InUseByApplication,
    InUseByOther,
}

impl DeviceStatus {
    /// USB and Ethernet variants of the vendor status collapse onto the same value.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 | 4 => DeviceStatus::Available,
            2 | 5 => DeviceStatus::InUseByApplication,
            3 | 6 | 7 => DeviceStatus::InUseByOther,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// One entry of the device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvaDevice {
    pub serial_number: String,
    pub friendly_name: String,
    pub status: DeviceStatus,
}

impl AvaDevice {
    pub fn new(serial_number: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            friendly_name: friendly_name.into(),
            status: DeviceStatus::Available,
        }
    }
}

/// The part of the device configuration record the driver reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParameters {
    pub pixel_count: u16,
    pub detector_name: String,
}

/// Result of one finished acquisition, straight from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct RawScan {
    /// Device clock at the end of the scan, in [`TIMESTAMP_TICK`] units.
    pub timestamp: u32,
    pub intensities: Vec<f64>,
}

/// Status codes returned by the vendor library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AvsError {
    #[error("Invalid parameter")]
    InvalidParameter,

    #[error("Operation not supported")]
    OperationNotSupported,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Invalid device id")]
    InvalidDeviceId,

    #[error("Operation pending")]
    OperationPending,

    #[error("Device timeout")]
    Timeout,

    #[error("Invalid measurement data")]
    InvalidMeasData,

    #[error("Invalid size")]
    InvalidSize,

    #[error("Invalid pixel range")]
    InvalidPixelRange,

    #[error("Invalid integration time")]
    InvalidIntTime,

    #[error("Invalid combination of parameters")]
    InvalidCombination,

    #[error("No measurement buffer available")]
    NoMeasBufferAvail,

    #[error("Communication error")]
    Communication,

    #[error("Invalid library version")]
    InvalidDllVersion,

    #[error("Library initialisation failed")]
    DllInitialisation,

    #[error("Invalid state")]
    InvalidState,

    #[error("Invalid reply from device")]
    InvalidReply,

    #[error("Access denied")]
    Access,

    #[error("Unknown status code {0}")]
    Unknown(i32),
}

impl AvsError {
    /// Map a negative vendor return value to its error.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => AvsError::InvalidParameter,
            -2 => AvsError::OperationNotSupported,
            -3 => AvsError::DeviceNotFound,
            -4 => AvsError::InvalidDeviceId,
            -5 => AvsError::OperationPending,
            -6 => AvsError::Timeout,
            -8 => AvsError::InvalidMeasData,
            -9 => AvsError::InvalidSize,
            -10 => AvsError::InvalidPixelRange,
            -11 => AvsError::InvalidIntTime,
            -12 => AvsError::InvalidCombination,
            -14 => AvsError::NoMeasBufferAvail,
            -16 => AvsError::Communication,
            -18 => AvsError::InvalidDllVersion,
            -20 => AvsError::DllInitialisation,
            -21 => AvsError::InvalidState,
            -22 => AvsError::InvalidReply,
            -24 => AvsError::Access,
            other => AvsError::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            AvsError::InvalidParameter => -1,
            AvsError::OperationNotSupported => -2,
            AvsError::DeviceNotFound => -3,
            AvsError::InvalidDeviceId => -4,
            AvsError::OperationPending => -5,
            AvsError::Timeout => -6,
            AvsError::InvalidMeasData => -8,
            AvsError::InvalidSize => -9,
            AvsError::InvalidPixelRange => -10,
            AvsError::InvalidIntTime => -11,
            AvsError::InvalidCombination => -12,
            AvsError::NoMeasBufferAvail => -14,
            AvsError::Communication => -16,
            AvsError::InvalidDllVersion => -18,
            AvsError::DllInitialisation => -20,
            AvsError::InvalidState => -21,
            AvsError::InvalidReply => -22,
            AvsError::Access => -24,
            AvsError::Unknown(code) => code,
        }
    }

    /// Turn a raw vendor return value into a `Result`; non-negative values are success.
    pub fn check(ret: i32) -> Result<i32, AvsError> {
        if ret < 0 {
            Err(Self::from_code(ret))
        } else {
            Ok(ret)
        }
    }
}

/// Calls the driver makes into the vendor library.
///
/// Implementations report vendor failures as [`AvsError`]; they never retry.
/// `activate` may hand back a handle for which [`DeviceHandle::is_valid`] is
/// false, the way the vendor call does.
pub trait AvaSpecSdk {
    /// Initialise the library and return how many devices it found.
    fn init(&mut self, port: CommPort) -> Result<u32, AvsError>;

    fn device_list(&mut self) -> Result<Vec<AvaDevice>, AvsError>;

    fn activate(&mut self, device: &AvaDevice) -> Result<DeviceHandle, AvsError>;

    fn device_parameters(&mut self, handle: DeviceHandle) -> Result<DeviceParameters, AvsError>;

    /// Wavelength calibration in nm, one value per pixel.
    fn wavelengths(&mut self, handle: DeviceHandle) -> Result<Vec<f64>, AvsError>;

    fn use_high_res_adc(&mut self, handle: DeviceHandle, enable: bool) -> Result<(), AvsError>;

    /// Commit an acquisition configuration. Takes effect for the next `measure`.
    fn prepare_measure(
        &mut self,
        handle: DeviceHandle,
        config: &AcquisitionConfig,
    ) -> Result<(), AvsError>;

    /// Start `scans` averaged acquisitions without waiting for them.
    fn measure(&mut self, handle: DeviceHandle, scans: u16) -> Result<(), AvsError>;

    /// Non-blocking readiness check.
    fn poll_scan(&mut self, handle: DeviceHandle) -> Result<bool, AvsError>;

    fn scope_data(&mut self, handle: DeviceHandle) -> Result<RawScan, AvsError>;

    fn stop_measure(&mut self, handle: DeviceHandle) -> Result<(), AvsError>;

    fn deactivate(&mut self, handle: DeviceHandle) -> Result<(), AvsError>;

    /// Release the library. Handles are invalid afterwards.
    fn done(&mut self) -> Result<(), AvsError>;
}
