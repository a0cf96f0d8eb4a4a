// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Temperature and humidity source.
//!
//! The core only needs [`HumidityTempSource::measure`]. [`IioDht22`] reads a
//! DHT22 through the Linux IIO `dht11` driver, which handles the one-wire
//! timing in the kernel and exposes milli-unit values in sysfs.

use log::trace;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One temperature and humidity sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature_celsius: f32,
    pub humidity_percent: f32,
}

///
/// Source error. Any of these means "no reading
/// this cycle", never a fatal condition.
///
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// The driver could not be read (the DHT22 driver reports timeouts and
    /// checksum failures this way)
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    /// The driver returned text that is not a number
    #[error("unparsable value {value:?} in {path}")]
    Parse { path: String, value: String },
    /// The value is outside what the sensor can physically report
    #[error("{quantity} {value} outside sensor range")]
    OutOfRange { quantity: &'static str, value: f32 },
    /// No measurement was available
    #[error("no data")]
    NoData,
}

/// Produces a temperature/humidity pair or fails
pub trait HumidityTempSource {
    fn measure(&mut self) -> Result<SensorReading, SensorError>;
}

/// DHT22 limits, from the datasheet
const DHT22_TEMPERATURE_RANGE: (f32, f32) = (-40.0, 80.0);
const DHT22_HUMIDITY_RANGE: (f32, f32) = (0.0, 100.0);

/// DHT22 behind the Linux IIO interface
pub struct IioDht22 {
    device_dir: PathBuf,
}

impl IioDht22 {
    /// `device_dir` is the IIO device directory, e.g.
    /// `/sys/bus/iio/devices/iio:device0`
    pub fn new<P: AsRef<Path>>(device_dir: P) -> IioDht22 {
        IioDht22 {
            device_dir: device_dir.as_ref().to_path_buf(),
        }
    }

    fn read_milli(&self, file: &str) -> Result<f32, SensorError> {
        let path = self.device_dir.join(file);
        let text = fs::read_to_string(&path).map_err(|e| SensorError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let raw = text.trim();
        trace!("{} = {}", path.display(), raw);
        let milli: i32 = raw.parse().map_err(|_| SensorError::Parse {
            path: path.display().to_string(),
            value: raw.to_string(),
        })?;
        Ok(milli as f32 / 1000.0)
    }
}

fn check_range(quantity: &'static str, value: f32, range: (f32, f32)) -> Result<f32, SensorError> {
    if value.is_nan() || value < range.0 || value > range.1 {
        return Err(SensorError::OutOfRange { quantity, value });
    }
    Ok(value)
}

impl HumidityTempSource for IioDht22 {
    fn measure(&mut self) -> Result<SensorReading, SensorError> {
        let temperature = self.read_milli("in_temp_input")?;
        let humidity = self.read_milli("in_humidityrelative_input")?;
        Ok(SensorReading {
            temperature_celsius: check_range("temperature", temperature, DHT22_TEMPERATURE_RANGE)?,
            humidity_percent: check_range("humidity", humidity, DHT22_HUMIDITY_RANGE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn device_dir(name: &str, temp: &str, hum: Option<&str>) -> PathBuf {
        let dir = env::temp_dir().join(format!("ccs811-iio-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("in_temp_input"), temp).unwrap();
        match hum {
            Some(h) => fs::write(dir.join("in_humidityrelative_input"), h).unwrap(),
            None => {
                let _ = fs::remove_file(dir.join("in_humidityrelative_input"));
            }
        }
        dir
    }

    #[test]
    fn reads_milli_units() {
        let dir = device_dir("ok", "23400\n", Some("41700\n"));
        let reading = IioDht22::new(&dir).measure().unwrap();
        assert!((reading.temperature_celsius - 23.4).abs() < 1e-4);
        assert!((reading.humidity_percent - 41.7).abs() < 1e-4);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_channel_is_a_read_error() {
        let dir = device_dir("missing", "23400", None);
        let err = IioDht22::new(&dir).measure().unwrap_err();
        assert!(matches!(err, SensorError::Read { .. }));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let dir = device_dir("garbage", "hot", Some("41700"));
        let err = IioDht22::new(&dir).measure().unwrap_err();
        assert_eq!(
            err,
            SensorError::Parse {
                path: dir.join("in_temp_input").display().to_string(),
                value: "hot".to_string()
            }
        );
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn implausible_humidity_is_rejected() {
        let dir = device_dir("range", "20000", Some("140000"));
        let err = IioDht22::new(&dir).measure().unwrap_err();
        assert!(matches!(
            err,
            SensorError::OutOfRange {
                quantity: "humidity",
                ..
            }
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn nan_is_out_of_range() {
        let err = check_range("humidity", f32::NAN, DHT22_HUMIDITY_RANGE).unwrap_err();
        assert!(matches!(
            err,
            SensorError::OutOfRange {
                quantity: "humidity",
                ..
            }
        ));
    }
}
