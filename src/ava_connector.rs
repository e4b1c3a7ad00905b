use crate::ava_sdk::{AvaDevice, AvaSpecSdk, AvsError, CommPort, DeviceHandle, DeviceStatus};

#[derive(Debug, thiserror::Error)]
pub enum AvaConnectorError {
    #[error("AvaSpec library error: {0}")]
    Sdk(#[from] AvsError),

    #[error("No spectrometer {} found. Please connect a spectrometer", .serial.as_deref().unwrap_or("device"))]
    NoDeviceFound { serial: Option<String> },

    #[error("Activating spectrometer {serial} returned invalid handle {handle}")]
    Activation { serial: String, handle: DeviceHandle },
}

/// An activated device together with the list entry it was activated from.
#[derive(Debug, Clone)]
pub struct AvaConnection {
    pub handle: DeviceHandle,
    pub device: AvaDevice,
}

pub struct AvaConnector;

impl AvaConnector {
    /// Initialise the vendor library and return the number of devices it sees.
    pub fn init_library<S: AvaSpecSdk>(sdk: &mut S, port: CommPort) -> Result<u32, AvaConnectorError> {
        log::debug!("Initialising AvaSpec library on port {:?}", port);
        let count = sdk.init(port)?;
        log::debug!("AvaSpec library reports {} device(s)", count);
        Ok(count)
    }

    /// Get all spectrometers the library can see
    pub fn get_available_devices<S: AvaSpecSdk>(
        sdk: &mut S,
    ) -> Result<Vec<AvaDevice>, AvaConnectorError> {
        Ok(sdk.device_list()?)
    }

    /// Activate the first device, or the first one with the given serial number.
    pub fn connect<S: AvaSpecSdk>(
        sdk: &mut S,
        serial: Option<&str>,
    ) -> Result<AvaConnection, AvaConnectorError> {
        let device = Self::select_device(Self::get_available_devices(sdk)?, serial)?;
        log::debug!(
            "Activating spectrometer {} ({})",
            device.serial_number,
            device.friendly_name
        );
        if device.status == DeviceStatus::InUseByOther {
            log::warn!(
                "Spectrometer {} is reported in use by another application",
                device.serial_number
            );
        }

        let handle = sdk.activate(&device)?;
        if !handle.is_valid() {
            return Err(AvaConnectorError::Activation {
                serial: device.serial_number,
                handle,
            });
        }

        log::info!(
            "Connected to spectrometer {} with handle {}",
            device.serial_number,
            handle
        );
        Ok(AvaConnection { handle, device })
    }

    fn select_device(
        devices: Vec<AvaDevice>,
        serial: Option<&str>,
    ) -> Result<AvaDevice, AvaConnectorError> {
        if let Some(serial) = serial {
            log::debug!("Searching for spectrometer with serial number {}", serial);
        }

        devices
            .into_iter()
            .find(|device| serial.is_none_or(|s| device.serial_number == s))
            .ok_or_else(|| AvaConnectorError::NoDeviceFound {
                serial: serial.map(str::to_string),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedAvaSpec;

    #[test]
    fn test_connect_first_device() {
        let mut sdk = SimulatedAvaSpec::new().with_devices(["1102185U1", "1102186U1"]);
        assert_eq!(AvaConnector::init_library(&mut sdk, CommPort::Usb).unwrap(), 2);

        let connection = AvaConnector::connect(&mut sdk, None).unwrap();
        assert!(connection.handle.is_valid());
        assert_eq!(connection.device.serial_number, "1102185U1");
    }

    #[test]
    fn test_connect_by_serial() {
        let mut sdk = SimulatedAvaSpec::new().with_devices(["1102185U1", "1102186U1"]);
        AvaConnector::init_library(&mut sdk, CommPort::Usb).unwrap();

        let connection = AvaConnector::connect(&mut sdk, Some("1102186U1")).unwrap();
        assert_eq!(connection.device.serial_number, "1102186U1");

        match AvaConnector::connect(&mut sdk, Some("0000000U1")) {
            Err(AvaConnectorError::NoDeviceFound { serial }) => {
                assert_eq!(serial.as_deref(), Some("0000000U1"));
            }
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_connect_without_devices() {
        let mut sdk = SimulatedAvaSpec::new().with_devices(Vec::<String>::new());
        assert_eq!(AvaConnector::init_library(&mut sdk, CommPort::Usb).unwrap(), 0);
        assert!(matches!(
            AvaConnector::connect(&mut sdk, None),
            Err(AvaConnectorError::NoDeviceFound { serial: None })
        ));
    }

    #[test]
    fn test_invalid_handle_is_activation_error() {
        let mut sdk = SimulatedAvaSpec::new().with_failed_activation();
        AvaConnector::init_library(&mut sdk, CommPort::Usb).unwrap();
        assert!(matches!(
            AvaConnector::connect(&mut sdk, None),
            Err(AvaConnectorError::Activation { .. })
        ));
    }
}
