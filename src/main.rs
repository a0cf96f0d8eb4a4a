// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

use ccs811_i2c::bus::LinuxBus;
use ccs811_i2c::ccs811::Ccs811;
use ccs811_i2c::config::Config;
use ccs811_i2c::controller::CalibrationController;
use ccs811_i2c::runner::{self, MainLoop};
use ccs811_i2c::session::SystemClock;
use ccs811_i2c::source::IioDht22;
use ccs811_i2c::telemetry::MqttSink;
use log::{error, info};
use std::env;
use std::process::ExitCode;

const CONFIG_ENV: &str = "CCS811_CONFIG";
const DEFAULT_CONFIG: &str = "ccs811.toml";

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let bus = match LinuxBus::open(&config.bus.device, config.bus.address) {
        Ok(bus) => bus,
        Err(e) => {
            error!("failed to open {}: {}", config.bus.device, e);
            return ExitCode::FAILURE;
        }
    };

    let mut controller = CalibrationController::new(
        Ccs811::new(bus, config.bus.address),
        IioDht22::new(&config.humidity.iio_device),
        SystemClock,
        config.controller_settings(),
    );

    // Without a telemetry connection nothing can be reported, so the
    // connection is made before the sensor is touched
    let cadence = config.cadence();
    let publisher = match runner::start(
        MqttSink::new(config.mqtt_settings()),
        &mut controller,
        config.sensor.startup_attempts,
        cadence.error_backoff,
    ) {
        Ok(handle) => handle,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut main_loop = MainLoop::new(publisher, config.topics(), cadence);
    let summary = main_loop.run(&mut controller);
    info!(
        "run finished after {} cycles: {} published, {} publish failures, {} gas readings, {} faulted",
        summary.cycles,
        summary.published,
        summary.publish_failures,
        summary.gas_readings,
        summary.faulted_cycles
    );
    ExitCode::SUCCESS
}
