// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

use crate::bus::BusDriver;
use crate::controller::{CalibrationController, ControllerError, CycleReport};
use crate::session::Clock;
use crate::source::{HumidityTempSource, SensorReading};
use crate::telemetry::{ConnectError, Publish, PublishError, TelemetrySink, Topics};
use log::{error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Startup failures; the run must not begin after either
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to connect to telemetry endpoint: {0}")]
    Connect(#[source] ConnectError),
    #[error("gas sensor did not start after {attempts} attempts: {last}")]
    Controller {
        attempts: u32,
        #[source]
        last: ControllerError,
    },
}

/// Connects the telemetry sink, then starts the controller.
///
/// Nothing touches the bus when the connection fails. Controller start is
/// tried up to `attempts` times with `backoff` in between.
pub fn start<S, B, H, C>(
    sink: S,
    controller: &mut CalibrationController<B, H, C>,
    attempts: u32,
    backoff: Duration,
) -> Result<S::Handle, StartupError>
where
    S: TelemetrySink,
    B: BusDriver,
    H: HumidityTempSource,
    C: Clock,
{
    let handle = sink.connect().map_err(StartupError::Connect)?;

    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match controller.start() {
            Ok(()) => return Ok(handle),
            Err(last) if attempt >= attempts => {
                return Err(StartupError::Controller { attempts, last })
            }
            Err(e) => {
                warn!("gas sensor start attempt {}/{} failed: {}", attempt, attempts, e);
                attempt += 1;
                thread::sleep(backoff);
            }
        }
    }
}

/// Cadence of the main loop
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    /// Delay after every completed cycle
    pub interval: Duration,
    /// Extra delay after a faulted cycle
    pub error_backoff: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence {
            interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(2),
        }
    }
}

/// Counters of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    /// Individual measurements published (temperature and humidity count separately)
    pub published: u64,
    pub publish_failures: u64,
    pub gas_readings: u64,
    /// Cycles with a bus fault, a refused cycle or a panic
    pub faulted_cycles: u64,
    pub stable: bool,
}

/// Fixed cadence driver tying the controller to the telemetry handle.
///
/// Runs until the conditioning period completes or `max_cycles` is hit.
pub struct MainLoop<P: Publish> {
    publisher: P,
    topics: Topics,
    cadence: Cadence,
    max_cycles: Option<u64>,
    pending: Option<SensorReading>,
}

impl<P: Publish> MainLoop<P> {
    pub fn new(publisher: P, topics: Topics, cadence: Cadence) -> MainLoop<P> {
        MainLoop {
            publisher,
            topics,
            cadence,
            max_cycles: None,
            pending: None,
        }
    }

    /// Stop after `cycles` cycles even if not yet stable
    pub fn max_cycles(mut self, cycles: u64) -> MainLoop<P> {
        self.max_cycles = Some(cycles);
        self
    }

    pub fn into_publisher(self) -> P {
        self.publisher
    }

    pub fn run<B, H, C>(&mut self, controller: &mut CalibrationController<B, H, C>) -> RunSummary
    where
        B: BusDriver,
        H: HumidityTempSource,
        C: Clock,
    {
        let mut summary = RunSummary::default();
        loop {
            if let Some(max) = self.max_cycles {
                if summary.cycles >= max {
                    break;
                }
            }
            summary.cycles += 1;

            // A panic inside a cycle must not end the run
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| controller.run_cycle()));
            let report = match outcome {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    error!("cycle {} refused: {}", summary.cycles, e);
                    summary.faulted_cycles += 1;
                    self.publisher.idle(self.cadence.error_backoff);
                    continue;
                }
                Err(cause) => {
                    error!(
                        "cycle {} aborted: {}",
                        summary.cycles,
                        panic_message(cause.as_ref())
                    );
                    summary.faulted_cycles += 1;
                    self.publisher.idle(self.cadence.error_backoff);
                    continue;
                }
            };

            self.publish_reading(&report, &mut summary);
            log_report(&report);
            if matches!(report.gas, Ok(Some(_))) {
                summary.gas_readings += 1;
            }

            if report.stable_now {
                info!("conditioning period complete, readings are stable");
                summary.stable = true;
                break;
            }

            self.publisher.idle(self.cadence.interval);
            if report.has_bus_fault() {
                summary.faulted_cycles += 1;
                self.publisher.idle(self.cadence.error_backoff);
            }
        }
        summary
    }

    fn publish_reading(&mut self, report: &CycleReport, summary: &mut RunSummary) {
        // Fresh readings replace one still waiting to be published
        let Some(reading) = report.reading.or(self.pending.take()) else {
            return;
        };

        let topics = self.topics.clone();
        let results = [
            self.publish_value(&topics.temperature, reading.temperature_celsius),
            self.publish_value(&topics.humidity, reading.humidity_percent),
        ];
        let mut failed = false;
        for result in results {
            match result {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    warn!("{}", e);
                    summary.publish_failures += 1;
                    failed = true;
                }
            }
        }
        if failed {
            self.pending = Some(reading);
        }
    }

    fn publish_value(&mut self, topic: &str, value: f32) -> Result<(), PublishError> {
        self.publisher.publish(topic, &value.to_string())
    }
}

fn log_report(report: &CycleReport) {
    if let Some(r) = report.reading {
        info!(
            "temperature {} C, humidity {} %",
            r.temperature_celsius, r.humidity_percent
        );
    }
    match report.gas {
        Ok(Some(gas)) => info!("eCO2 {} ppm, eTVOC {} ppb", gas.eco2_ppm, gas.etvoc_ppb),
        Ok(None) => {}
        Err(ref e) => warn!("no gas reading: {}", e),
    }
    match report.status {
        Ok(status) => {
            info!(
                "status {:#010b}, error id {:#04x}",
                status.raw_status, status.error_id
            );
            if status.app_error_flag {
                warn!("sensor reports error flags {:?}", status.error_flags());
            }
        }
        Err(ref e) => warn!("no device status: {}", e),
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
