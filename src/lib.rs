// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! CCS811 I2C gas sensor conditioning node
//!
//! Operations taken from the CCS811 datasheet register map.
//! A DHT22 supplies temperature and humidity, which are published to an
//! MQTT feed and written back into the CCS811 as environmental
//! compensation. The run ends once the sensor's conditioning (burn-in)
//! period has elapsed.
//!
//! ## Basic Example
//!
//! Reset the sensor, start 1 second measurements and poll once
//!
//!```no_run
//!use ccs811_i2c::bus::LinuxBus;
//!use ccs811_i2c::ccs811::{Ccs811, DEFAULT_ADDRESS, MODE_1S};
//!use ccs811_i2c::source::SensorReading;
//!use std::thread;
//!use std::time::Duration;
//!
//!fn main() {
//!    // Open the I2C device
//!    let bus = LinuxBus::open("/dev/i2c-1", DEFAULT_ADDRESS).unwrap();
//!    let mut ccs = Ccs811::new(bus, DEFAULT_ADDRESS);
//!    ccs.reset().unwrap();
//!    thread::sleep(Duration::from_secs(2));
//!    ccs.set_mode(MODE_1S).unwrap();
//!
//!    let ambient = SensorReading { temperature_celsius: 21.0, humidity_percent: 45.0 };
//!    ccs.write_compensation(&ambient).unwrap();
//!
//!    match ccs.read_gas() {
//!        Ok(Some(gas)) => println!("eCO2: {} ppm eTVOC: {} ppb", gas.eco2_ppm, gas.etvoc_ppb),
//!        Ok(None) => println!("No new data"),
//!        Err(e) => println!("Error reading gas data. More details: {}", e),
//!    }
//!}
//!```
//!

/// Raw register transport and the Linux i2cdev adapter
pub mod bus;
/// CCS811 register map operations
pub mod ccs811;
/// TOML configuration and its validation
pub mod config;
/// Startup and per-cycle orchestration
pub mod controller;
/// Startup sequencing and the periodic main loop
pub mod runner;
/// Conditioning-period timekeeping
pub mod session;
/// Temperature/humidity source and the DHT22 IIO adapter
pub mod source;
/// MQTT publishing of compensation readings
pub mod telemetry;

#[cfg(test)]
mod testing;
