use crate::ava_sdk::AvsError;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Integration time the device is configured with right after activation (ms).
pub const DEFAULT_INTEGRATION_TIME_MS: f32 = 0.022;
/// Number of scans averaged per spectrum right after activation.
pub const DEFAULT_AVERAGES: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Integration time must be a positive number of milliseconds, got {0}")]
    InvalidIntegrationTime(f32),

    #[error("Number of averages must be at least 1")]
    ZeroAverages,

    #[error("Pixel range {start}..={stop} does not fit a detector with {pixel_count} pixels")]
    PixelRange {
        start: u16,
        stop: u16,
        pixel_count: u16,
    },

    #[error("Region of interest {region:?} does not fit a detector with {pixel_count} pixels")]
    InvalidRegion {
        region: RegionOfInterest,
        pixel_count: usize,
    },

    #[error("Device rejected configuration: {0}")]
    Rejected(#[source] AvsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Start on the software `measure` call.
    #[default]
    Software,
    /// Wait for an external trigger.
    Hardware,
    SingleScan,
}

impl TriggerMode {
    pub fn as_code(self) -> u8 {
        match self {
            TriggerMode::Software => 0,
            TriggerMode::Hardware => 1,
            TriggerMode::SingleScan => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerMode::Software => "software",
            TriggerMode::Hardware => "hardware",
            TriggerMode::SingleScan => "single scan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSource {
    #[default]
    ExternalHardware,
    Synchronization,
}

impl TriggerSource {
    pub fn as_code(self) -> u8 {
        match self {
            TriggerSource::ExternalHardware => 0,
            TriggerSource::Synchronization => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSourceType {
    #[default]
    Edge,
    Level,
}

impl TriggerSourceType {
    pub fn as_code(self) -> u8 {
        match self {
            TriggerSourceType::Edge => 0,
            TriggerSourceType::Level => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSourceType::Edge => "edge",
            TriggerSourceType::Level => "level",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerSettings {
    pub mode: TriggerMode,
    pub source: TriggerSource,
    pub source_type: TriggerSourceType,
}

/// Dynamic dark-current correction done by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DarkCorrection {
    pub enable: bool,
    pub forget_percentage: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Smoothing {
    /// Pixels on each side of the smoothed one.
    pub pixels: u16,
    pub model: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Control {
    pub strobe_control: u16,
    pub laser_delay: u32,
    pub laser_width: u32,
    pub laser_wavelength: f32,
    pub store_to_ram: u16,
}

/// Acquisition settings committed to the device as one record.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub start_pixel: u16,
    pub stop_pixel: u16,
    pub integration_time_ms: f32,
    pub integration_delay: u32,
    pub averages: u32,
    pub dark_correction: DarkCorrection,
    pub smoothing: Smoothing,
    pub saturation_detection: u8,
    pub trigger: TriggerSettings,
    pub control: Control,
}

impl AcquisitionConfig {
    /// Defaults covering the whole detector.
    pub fn for_detector(pixel_count: u16) -> Self {
        Self {
            start_pixel: 0,
            stop_pixel: pixel_count.saturating_sub(1),
            integration_time_ms: DEFAULT_INTEGRATION_TIME_MS,
            integration_delay: 0,
            averages: DEFAULT_AVERAGES,
            dark_correction: DarkCorrection::default(),
            smoothing: Smoothing::default(),
            saturation_detection: 0,
            trigger: TriggerSettings::default(),
            control: Control::default(),
        }
    }

    pub fn with_integration_time(mut self, ms: f32) -> Self {
        self.integration_time_ms = ms;
        self
    }

    pub fn with_averages(mut self, averages: u32) -> Self {
        self.averages = averages;
        self
    }

    pub fn validate(&self, pixel_count: u16) -> Result<(), ConfigError> {
        if !self.integration_time_ms.is_finite() || self.integration_time_ms <= 0.0 {
            return Err(ConfigError::InvalidIntegrationTime(self.integration_time_ms));
        }
        if self.averages == 0 {
            return Err(ConfigError::ZeroAverages);
        }
        if self.start_pixel > self.stop_pixel || self.stop_pixel >= pixel_count {
            return Err(ConfigError::PixelRange {
                start: self.start_pixel,
                stop: self.stop_pixel,
                pixel_count,
            });
        }
        Ok(())
    }

    /// Integration time times averages, in milliseconds.
    pub fn nominal_acquisition_ms(&self) -> f64 {
        f64::from(self.integration_time_ms) * f64::from(self.averages)
    }

    pub fn nominal_acquisition_time(&self) -> Duration {
        Duration::from_secs_f64(self.nominal_acquisition_ms().max(0.0) / 1000.0)
    }
}

/// Pixels handed back to callers, chosen by the caller.
///
/// The useful band differs between detectors, so this is configuration
/// rather than a property of the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegionOfInterest {
    Full,
    /// Inclusive pixel indices.
    Pixels { start: usize, stop: usize },
    /// Nearest calibrated pixels to the given wavelengths.
    Wavelengths { min_nm: f64, max_nm: f64 },
}

impl Default for RegionOfInterest {
    /// Roughly 380 to 1100 nm on the detectors used for spectroelectrochemistry.
    fn default() -> Self {
        RegionOfInterest::Pixels {
            start: 395,
            stop: 1659,
        }
    }
}

impl RegionOfInterest {
    pub fn resolve(&self, wavelengths: &[f64]) -> Result<PixelRange, ConfigError> {
        let invalid = || ConfigError::InvalidRegion {
            region: *self,
            pixel_count: wavelengths.len(),
        };

        let last = wavelengths.len().checked_sub(1).ok_or_else(invalid)?;
        match *self {
            RegionOfInterest::Full => Ok(PixelRange { start: 0, stop: last }),
            RegionOfInterest::Pixels { start, stop } => {
                if start > stop || stop > last {
                    return Err(invalid());
                }
                Ok(PixelRange { start, stop })
            }
            RegionOfInterest::Wavelengths { min_nm, max_nm } => {
                if !min_nm.is_finite() || !max_nm.is_finite() || min_nm >= max_nm {
                    return Err(invalid());
                }
                let lowest = wavelengths.iter().copied().fold(f64::INFINITY, f64::min);
                let highest = wavelengths.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if max_nm < lowest || min_nm > highest {
                    return Err(invalid());
                }
                let a = nearest_pixel(wavelengths, min_nm).ok_or_else(invalid)?;
                let b = nearest_pixel(wavelengths, max_nm).ok_or_else(invalid)?;
                if a == b && (a == 0 || a == last) {
                    return Err(invalid());
                }
                Ok(PixelRange {
                    start: a.min(b),
                    stop: a.max(b),
                })
            }
        }
    }
}

fn nearest_pixel(wavelengths: &[f64], target: f64) -> Option<usize> {
    wavelengths
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
        .map(|(i, _)| i)
}

/// A resolved, inclusive pixel range known to fit the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRange {
    start: usize,
    stop: usize,
}

impl PixelRange {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn stop(&self) -> usize {
        self.stop
    }

    pub fn len(&self) -> usize {
        self.stop - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_range(&self) -> RangeInclusive<usize> {
        self.start..=self.stop
    }

    /// The part of a per-pixel buffer covered by this range, if the buffer is long enough.
    pub fn trim<'a, T>(&self, data: &'a [T]) -> Option<&'a [T]> {
        data.get(self.as_range())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_calibration(pixels: usize) -> Vec<f64> {
        (0..pixels).map(|i| 155.0 + 0.57 * i as f64).collect()
    }

    #[test]
    fn test_defaults_cover_whole_detector() {
        let config = AcquisitionConfig::for_detector(2048);
        assert_eq!(config.start_pixel, 0);
        assert_eq!(config.stop_pixel, 2047);
        assert_eq!(config.averages, 200);
        assert_eq!(config.trigger.mode, TriggerMode::Software);
        assert!(config.validate(2048).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = AcquisitionConfig::for_detector(2048);

        assert!(matches!(
            config.clone().with_integration_time(0.0).validate(2048),
            Err(ConfigError::InvalidIntegrationTime(_))
        ));
        assert!(matches!(
            config.clone().with_integration_time(f32::NAN).validate(2048),
            Err(ConfigError::InvalidIntegrationTime(_))
        ));
        assert!(matches!(
            config.clone().with_averages(0).validate(2048),
            Err(ConfigError::ZeroAverages)
        ));
        assert!(matches!(
            config.validate(1024),
            Err(ConfigError::PixelRange { stop: 2047, .. })
        ));
    }

    #[test]
    fn test_nominal_acquisition_time() {
        let config = AcquisitionConfig::for_detector(2048)
            .with_integration_time(2.5)
            .with_averages(4);
        assert!((config.nominal_acquisition_ms() - 10.0).abs() < 1e-9);
        assert_eq!(config.nominal_acquisition_time(), Duration::from_millis(10));
    }

    #[test]
    fn test_default_region_length() {
        let range = RegionOfInterest::default()
            .resolve(&linear_calibration(2048))
            .unwrap();
        assert_eq!(range.start(), 395);
        assert_eq!(range.stop(), 1659);
        assert_eq!(range.len(), 1265);
    }

    #[test]
    fn test_region_outside_detector() {
        let region = RegionOfInterest::Pixels { start: 10, stop: 2048 };
        assert!(matches!(
            region.resolve(&linear_calibration(2048)),
            Err(ConfigError::InvalidRegion { pixel_count: 2048, .. })
        ));
        assert!(RegionOfInterest::Full.resolve(&[]).is_err());
    }

    #[test]
    fn test_region_from_wavelengths() {
        let wavelengths = linear_calibration(2048);
        let range = RegionOfInterest::Wavelengths {
            min_nm: 380.0,
            max_nm: 1100.0,
        }
        .resolve(&wavelengths)
        .unwrap();

        // 155 + 0.57 * 395 = 380.15, 155 + 0.57 * 1658 = 1100.06
        assert_eq!(range.start(), 395);
        assert_eq!(range.stop(), 1658);

        let inverted = RegionOfInterest::Wavelengths {
            min_nm: 900.0,
            max_nm: 400.0,
        };
        assert!(inverted.resolve(&wavelengths).is_err());
    }

    #[test]
    fn test_region_outside_calibration() {
        let wavelengths = linear_calibration(2048);
        for (min_nm, max_nm) in [(2000.0, 3000.0), (50.0, 100.0)] {
            let region = RegionOfInterest::Wavelengths { min_nm, max_nm };
            assert!(matches!(
                region.resolve(&wavelengths),
                Err(ConfigError::InvalidRegion { pixel_count: 2048, .. })
            ));
        }

        // A band hanging over one edge still covers part of the detector.
        let range = RegionOfInterest::Wavelengths {
            min_nm: 1000.0,
            max_nm: 3000.0,
        }
        .resolve(&wavelengths)
        .unwrap();
        assert_eq!(range.stop(), 2047);
        assert!(range.len() > 1);
    }

    #[test]
    fn test_trim() {
        let data: Vec<u32> = (0..10).collect();
        let range = RegionOfInterest::Pixels { start: 2, stop: 4 }
            .resolve(&[0.0; 10])
            .unwrap();
        assert_eq!(range.trim(&data), Some(&[2, 3, 4][..]));
        assert_eq!(range.trim(&data[..3]), None);
    }
}
