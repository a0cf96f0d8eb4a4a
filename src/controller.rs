// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Calibration controller.
//!
//! Starts the gas sensor and then runs one polling cycle at a time:
//! acquire temperature/humidity, push it to the gas sensor as
//! compensation, read the gas result and the device status, and advance
//! the conditioning session.
//!
//! ```text
//!  Uninitialized ──reset ok──► Resetting ──set_mode ok──► ModeConfigured
//!        ▲                        │                              │
//!        └──────set_mode failed───┘                     session started
//!                                                                ▼
//!                                   Stable ◄──elapsed > threshold── Conditioning
//! ```

use crate::bus::{BusDriver, BusError};
use crate::ccs811::{Ccs811, DeviceStatus, GasReading};
use crate::session::{Clock, ConditioningSession, SystemClock};
use crate::source::{HumidityTempSource, SensorError, SensorReading};
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Resetting,
    ModeConfigured,
    Conditioning,
    Stable,
}

/// Failures of controller lifecycle operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// Startup reset did not reach the sensor; start may be retried
    #[error("gas sensor reset failed: {0}")]
    Reset(#[source] BusError),
    /// Mode write failed after reset; start may be retried
    #[error("setting measurement mode failed: {0}")]
    SetMode(#[source] BusError),
    /// `start` was called on a running controller
    #[error("controller already started")]
    AlreadyStarted,
    /// Cycles need a conditioning session
    #[error("cannot run a cycle while {0:?}")]
    NotConditioning(ControllerState),
}

/// Startup and conditioning parameters
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// Byte written to MEAS_MODE
    pub operating_mode: u8,
    /// Wait between reset and the mode write
    pub settle_delay: Duration,
    /// Conditioning duration before readings are trusted
    pub threshold: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            operating_mode: crate::ccs811::MODE_1S,
            settle_delay: Duration::from_secs(2),
            threshold: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of one polling cycle.
///
/// Gas data and device status are independent reads and may disagree;
/// both are always reported.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Ambient reading, absent when the source failed
    pub reading: Option<SensorReading>,
    pub sensor_error: Option<SensorError>,
    /// Set when the compensation write faulted; the gas read used stale compensation
    pub compensation_error: Option<BusError>,
    /// `Ok(None)` means no new measurement this cycle
    pub gas: Result<Option<GasReading>, BusError>,
    pub status: Result<DeviceStatus, BusError>,
    pub elapsed: Duration,
    pub stable_now: bool,
}

impl CycleReport {
    /// Any gas sensor transaction failed during the cycle
    pub fn has_bus_fault(&self) -> bool {
        self.compensation_error.is_some() || self.gas.is_err() || self.status.is_err()
    }
}

/// Drives the gas sensor through startup and conditioning.
///
/// Owns the conditioning session; nothing else mutates it.
pub struct CalibrationController<B, H, C = SystemClock>
where
    B: BusDriver,
    H: HumidityTempSource,
    C: Clock,
{
    sensor: Ccs811<B>,
    source: H,
    clock: C,
    settings: ControllerSettings,
    state: ControllerState,
    session: Option<ConditioningSession>,
}

impl<B, H, C> CalibrationController<B, H, C>
where
    B: BusDriver,
    H: HumidityTempSource,
    C: Clock,
{
    /// New controller in `Uninitialized`; call `start` before cycling
    pub fn new(sensor: Ccs811<B>, source: H, clock: C, settings: ControllerSettings) -> Self {
        CalibrationController {
            sensor,
            source,
            clock,
            settings,
            state: ControllerState::Uninitialized,
            session: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn session(&self) -> Option<&ConditioningSession> {
        self.session.as_ref()
    }

    /// Gives back the sensor and the source
    pub fn into_parts(self) -> (Ccs811<B>, H) {
        (self.sensor, self.source)
    }

    /// Resets the sensor, waits the settle delay, sets the operating mode
    /// and opens the conditioning session.
    ///
    /// On failure the controller is back in `Uninitialized` and `start`
    /// can be called again.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.session.is_some() {
            return Err(ControllerError::AlreadyStarted);
        }

        self.state = ControllerState::Uninitialized;
        self.sensor.reset().map_err(ControllerError::Reset)?;
        self.state = ControllerState::Resetting;

        thread::sleep(self.settings.settle_delay);

        if let Err(e) = self.sensor.set_mode(self.settings.operating_mode) {
            self.state = ControllerState::Uninitialized;
            return Err(ControllerError::SetMode(e));
        }
        self.state = ControllerState::ModeConfigured;

        self.session = Some(ConditioningSession::start(
            self.clock.now(),
            self.settings.threshold,
        ));
        self.state = ControllerState::Conditioning;
        info!(
            "gas sensor started in mode {:#04x}, conditioning for {}s",
            self.settings.operating_mode,
            self.settings.threshold.as_secs()
        );
        Ok(())
    }

    /// Runs one polling cycle
    pub fn run_cycle(&mut self) -> Result<CycleReport, ControllerError> {
        if !matches!(
            self.state,
            ControllerState::Conditioning | ControllerState::Stable
        ) {
            return Err(ControllerError::NotConditioning(self.state));
        }

        let (reading, sensor_error) = match self.source.measure() {
            Ok(reading) => (Some(reading), None),
            Err(e) => {
                warn!("temperature/humidity unavailable this cycle: {}", e);
                (None, Some(e))
            }
        };

        // Compensation needs a valid reading
        let compensation_error = match reading {
            Some(ref r) => match self.sensor.write_compensation(r) {
                Ok(()) => None,
                Err(e) => {
                    warn!("compensation write failed, using stale values: {}", e);
                    Some(e)
                }
            },
            None => None,
        };

        let gas = self.sensor.read_gas();
        if let Err(ref e) = gas {
            warn!("gas read failed: {}", e);
        }

        let status = self.sensor.read_status();
        if let Err(ref e) = status {
            warn!("status read failed: {}", e);
        }

        let (elapsed, stable_now) = self.advance_session();

        Ok(CycleReport {
            reading,
            sensor_error,
            compensation_error,
            gas,
            status,
            elapsed,
            stable_now,
        })
    }

    fn advance_session(&mut self) -> (Duration, bool) {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return (Duration::ZERO, false);
        };
        let complete = session.update(now);
        if complete && self.state == ControllerState::Conditioning {
            self.state = ControllerState::Stable;
            info!(
                "conditioning period complete after {}s",
                session.elapsed.as_secs()
            );
        } else if !complete {
            debug!("conditioning, {}s remaining", session.remaining().as_secs());
        }
        (session.elapsed, complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusErrorKind, BusOp};
    use crate::ccs811::{
        DATA_REGISTER, DEFAULT_ADDRESS, ENV_DATA_REGISTER, ERROR_ID_REGISTER, MODE_REGISTER,
        RESET_REGISTER, STATUS_REGISTER,
    };
    use crate::testing::{ScriptedBus, ScriptedSource, SteppingClock};

    const READING: SensorReading = SensorReading {
        temperature_celsius: 21.5,
        humidity_percent: 40.0,
    };

    fn settings(threshold_secs: u64) -> ControllerSettings {
        ControllerSettings {
            operating_mode: 0x10,
            settle_delay: Duration::ZERO,
            threshold: Duration::from_secs(threshold_secs),
        }
    }

    fn ready_bus() -> ScriptedBus {
        ScriptedBus::new()
            .respond(STATUS_REGISTER, &[0x98])
            .respond(DATA_REGISTER, &[0x01, 0x23, 0x00, 0x64])
            .respond(ERROR_ID_REGISTER, &[0x00])
    }

    fn controller(
        bus: ScriptedBus,
        source: ScriptedSource,
        threshold_secs: u64,
    ) -> CalibrationController<ScriptedBus, ScriptedSource, SteppingClock> {
        CalibrationController::new(
            Ccs811::new(bus, DEFAULT_ADDRESS),
            source,
            SteppingClock::new(Duration::from_secs(1)),
            settings(threshold_secs),
        )
    }

    #[test]
    fn start_resets_then_sets_mode() {
        let mut ctrl = controller(ready_bus(), ScriptedSource::steady(READING), 10);
        assert_eq!(ctrl.state(), ControllerState::Uninitialized);
        ctrl.start().unwrap();
        assert_eq!(ctrl.state(), ControllerState::Conditioning);
        assert!(ctrl.session().is_some());

        let (sensor, _) = ctrl.into_parts();
        let bus = sensor.release();
        assert_eq!(bus.transactions[0].register, RESET_REGISTER);
        assert_eq!(bus.transactions[1].register, MODE_REGISTER);
        assert_eq!(bus.transactions[1].bytes, vec![0x10]);
    }

    #[test]
    fn failed_reset_stays_uninitialized_and_can_retry() {
        let bus = ready_bus().fail_write(RESET_REGISTER, BusErrorKind::Nack);
        let mut ctrl = controller(bus, ScriptedSource::steady(READING), 10);
        let err = ctrl.start().unwrap_err();
        assert!(matches!(err, ControllerError::Reset(_)));
        assert_eq!(ctrl.state(), ControllerState::Uninitialized);
        assert!(ctrl.session().is_none());
        assert_eq!(
            ctrl.run_cycle().unwrap_err(),
            ControllerError::NotConditioning(ControllerState::Uninitialized)
        );
    }

    #[test]
    fn failed_mode_write_returns_to_uninitialized() {
        let bus = ready_bus().fail_write(MODE_REGISTER, BusErrorKind::Timeout);
        let mut ctrl = controller(bus, ScriptedSource::steady(READING), 10);
        match ctrl.start().unwrap_err() {
            ControllerError::SetMode(e) => {
                assert_eq!(e.register, MODE_REGISTER);
                assert_eq!(e.op, BusOp::Write);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(ctrl.state(), ControllerState::Uninitialized);
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut ctrl = controller(ready_bus(), ScriptedSource::steady(READING), 10);
        ctrl.start().unwrap();
        assert_eq!(ctrl.start().unwrap_err(), ControllerError::AlreadyStarted);
        assert_eq!(ctrl.state(), ControllerState::Conditioning);
    }

    #[test]
    fn full_cycle_reports_everything() {
        let mut ctrl = controller(ready_bus(), ScriptedSource::steady(READING), 10);
        ctrl.start().unwrap();
        let report = ctrl.run_cycle().unwrap();
        assert_eq!(report.reading, Some(READING));
        assert_eq!(report.compensation_error, None);
        assert_eq!(
            report.gas,
            Ok(Some(GasReading {
                eco2_ppm: 291,
                etvoc_ppb: 100
            }))
        );
        let status = report.status.clone().unwrap();
        assert!(status.data_ready);
        assert_eq!(report.elapsed, Duration::from_secs(1));
        assert!(!report.stable_now);
        assert!(!report.has_bus_fault());
    }

    #[test]
    fn source_failure_skips_compensation_but_still_polls() {
        let source = ScriptedSource::new(vec![Err(SensorError::NoData)]);
        let mut ctrl = controller(ready_bus(), source, 10);
        ctrl.start().unwrap();
        let report = ctrl.run_cycle().unwrap();
        assert_eq!(report.reading, None);
        assert_eq!(report.sensor_error, Some(SensorError::NoData));
        assert!(report.gas.unwrap().is_some());
        assert!(report.status.is_ok());

        let (sensor, source) = ctrl.into_parts();
        assert_eq!(source.calls, 1);
        let bus = sensor.release();
        assert_eq!(bus.writes_to(ENV_DATA_REGISTER), 0);
        assert_eq!(bus.reads_of(DATA_REGISTER), 1);
        assert_eq!(bus.reads_of(ERROR_ID_REGISTER), 1);
    }

    #[test]
    fn compensation_failure_does_not_abort_cycle() {
        let bus = ready_bus().fail_write(ENV_DATA_REGISTER, BusErrorKind::Nack);
        let mut ctrl = controller(bus, ScriptedSource::steady(READING), 10);
        ctrl.start().unwrap();
        let report = ctrl.run_cycle().unwrap();
        assert!(report.compensation_error.is_some());
        assert!(report.gas.unwrap().is_some());
        assert!(report.status.is_ok());
    }

    #[test]
    fn status_is_read_even_when_gas_read_fails() {
        let bus = ready_bus().fail_read(DATA_REGISTER, BusErrorKind::Timeout);
        let mut ctrl = controller(bus, ScriptedSource::steady(READING), 10);
        ctrl.start().unwrap();
        let report = ctrl.run_cycle().unwrap();
        assert!(report.gas.is_err());
        assert!(report.status.is_ok());
        assert!(report.has_bus_fault());
    }

    #[test]
    fn no_new_data_is_not_a_fault() {
        let bus = ready_bus().respond(STATUS_REGISTER, &[0x90]);
        let mut ctrl = controller(bus, ScriptedSource::steady(READING), 10);
        ctrl.start().unwrap();
        let report = ctrl.run_cycle().unwrap();
        assert_eq!(report.gas, Ok(None));
        assert!(!report.has_bus_fault());
    }

    #[test]
    fn becomes_stable_after_threshold_and_stays_stable() {
        // The clock steps one second per read: session start is t=0,
        // cycle n observes t=n.
        let mut ctrl = controller(ready_bus(), ScriptedSource::steady(READING), 3);
        ctrl.start().unwrap();
        for _ in 0..3 {
            assert!(!ctrl.run_cycle().unwrap().stable_now);
        }
        let report = ctrl.run_cycle().unwrap();
        assert!(report.stable_now);
        assert_eq!(report.elapsed, Duration::from_secs(4));
        assert_eq!(ctrl.state(), ControllerState::Stable);

        // Stable is terminal but cycles are still allowed
        assert!(ctrl.run_cycle().unwrap().stable_now);
        assert_eq!(ctrl.state(), ControllerState::Stable);
    }
}
