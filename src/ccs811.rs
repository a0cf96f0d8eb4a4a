// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

use crate::bus::{BusDriver, BusError, BusErrorKind, BusOp};
use crate::source::SensorReading;
use log::{debug, trace};

/// Default CCS811 address (ADDR pin low)
pub const DEFAULT_ADDRESS: u8 = 0x5A;

/// STATUS register, 1 byte
pub const STATUS_REGISTER: u8 = 0x00;
/// MEAS_MODE register, 1 byte
pub const MODE_REGISTER: u8 = 0x01;
/// ALG_RESULT_DATA register, eCO2 then eTVOC
pub const DATA_REGISTER: u8 = 0x02;
/// ENV_DATA register, humidity then temperature
pub const ENV_DATA_REGISTER: u8 = 0x05;
/// ERROR_ID register, 1 byte
pub const ERROR_ID_REGISTER: u8 = 0xE0;
/// SW_RESET register
pub const RESET_REGISTER: u8 = 0xFF;

/// Magic sequence that must be written to SW_RESET
pub const RESET_SEQUENCE: [u8; 4] = [0x11, 0xE5, 0x72, 0x8A];

/// STATUS bit set when a new measurement can be read
pub const DATA_READY_MASK: u8 = 0x08;
const ERROR_MASK: u8 = 0x01;
const APP_VALID_MASK: u8 = 0x10;
const FW_MODE_MASK: u8 = 0x80;

/// Fixed point scale of the ENV_DATA fields (1/512 units)
const COMPENSATION_SCALE: f32 = 512.0;
/// ENV_DATA temperature is anchored at -25 C = 0
const TEMPERATURE_OFFSET: f32 = 25.0;

/// Drive modes accepted by MEAS_MODE
pub const MODE_IDLE: u8 = 0x00;
pub const MODE_1S: u8 = 0x10;
pub const MODE_10S: u8 = 0x20;
pub const MODE_60S: u8 = 0x30;
pub const MODE_250MS: u8 = 0x40;

/// Environmental compensation in the sensor's fixed point encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationValue {
    pub temp_fixed: u16,
    pub humidity_fixed: u16,
}

impl CompensationValue {
    /// Encodes a reading at 1/512 units.
    ///
    /// Temperature is offset by +25 first. Out of range inputs are
    /// clamped to the encodable range, never wrapped.
    pub fn from_reading(reading: &SensorReading) -> CompensationValue {
        CompensationValue {
            temp_fixed: encode_fixed(reading.temperature_celsius + TEMPERATURE_OFFSET),
            humidity_fixed: encode_fixed(reading.humidity_percent.clamp(0.0, 100.0)),
        }
    }

    /// ENV_DATA payload, humidity field first
    pub fn to_bytes(&self) -> [u8; 4] {
        let hum = self.humidity_fixed.to_be_bytes();
        let temp = self.temp_fixed.to_be_bytes();
        [hum[0], hum[1], temp[0], temp[1]]
    }
}

fn encode_fixed(value: f32) -> u16 {
    if value.is_nan() {
        return 0;
    }
    let scaled = (value * COMPENSATION_SCALE).round();
    scaled.clamp(0.0, f32::from(u16::MAX)) as u16
}

/// Algorithm result: equivalent CO2 and total VOC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasReading {
    pub eco2_ppm: u16,
    pub etvoc_ppb: u16,
}

impl GasReading {
    /// Decodes ALG_RESULT_DATA, eCO2 first.
    /// Fails with MalformedLength unless given 4 bytes
    pub fn from_bytes(data: &[u8]) -> Result<GasReading, BusError> {
        if data.len() != 4 {
            return Err(BusError::new(
                DATA_REGISTER,
                BusOp::Read,
                BusErrorKind::MalformedLength {
                    expected: 4,
                    actual: data.len(),
                },
            ));
        }
        Ok(GasReading {
            eco2_ppm: u16::from_be_bytes([data[0], data[1]]),
            etvoc_ppb: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// Named bits of the ERROR_ID register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags {
    pub write_reg_invalid: bool,
    pub read_reg_invalid: bool,
    pub measmode_invalid: bool,
    pub max_resistance: bool,
    pub heater_fault: bool,
    pub heater_supply: bool,
}

impl ErrorFlags {
    pub fn from_error_id(error_id: u8) -> ErrorFlags {
        ErrorFlags {
            write_reg_invalid: error_id & 0x01 != 0,
            read_reg_invalid: error_id & 0x02 != 0,
            measmode_invalid: error_id & 0x04 != 0,
            max_resistance: error_id & 0x08 != 0,
            heater_fault: error_id & 0x10 != 0,
            heater_supply: error_id & 0x20 != 0,
        }
    }
}

/// Decoded STATUS and ERROR_ID registers.
///
/// `app_error_flag` and a nonzero `error_id` are reported, never
/// turned into an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub data_ready: bool,
    pub app_error_flag: bool,
    pub error_id: u8,
    pub raw_status: u8,
}

impl DeviceStatus {
    pub fn decode(status: u8, error_id: u8) -> DeviceStatus {
        DeviceStatus {
            data_ready: status & DATA_READY_MASK != 0,
            app_error_flag: status & ERROR_MASK != 0,
            error_id,
            raw_status: status,
        }
    }

    /// A valid application firmware is loaded
    pub fn app_valid(&self) -> bool {
        self.raw_status & APP_VALID_MASK != 0
    }

    /// Firmware is in application mode (as opposed to boot mode)
    pub fn fw_mode(&self) -> bool {
        self.raw_status & FW_MODE_MASK != 0
    }

    pub fn error_flags(&self) -> ErrorFlags {
        ErrorFlags::from_error_id(self.error_id)
    }
}

/// CCS811 Struct, wraps a bus handle
/// and implements the register level operations.
///
/// No operation retries, retry policy belongs to the caller.
pub struct Ccs811<B: BusDriver> {
    bus: B,
    address: u8,
}

impl<B: BusDriver> Ccs811<B> {
    /// Create a new CCS811 on `address`
    pub fn new(bus: B, address: u8) -> Ccs811<B> {
        Ccs811 { bus, address }
    }

    /// Gives the bus handle back
    pub fn release(self) -> B {
        self.bus
    }

    /// Writes the magic reset sequence to SW_RESET.
    /// The sensor needs its wake time before the next command.
    pub fn reset(&mut self) -> Result<(), BusError> {
        self.bus.write(self.address, RESET_REGISTER, &RESET_SEQUENCE)?;
        debug!("ccs811 reset");
        Ok(())
    }

    /// Sets the drive mode. Only valid after `reset` plus the settle delay
    pub fn set_mode(&mut self, mode: u8) -> Result<(), BusError> {
        self.bus.write(self.address, MODE_REGISTER, &[mode])?;
        debug!("ccs811 measurement mode set to {:#04x}", mode);
        Ok(())
    }

    /// Pushes the ambient temperature and humidity to ENV_DATA
    pub fn write_compensation(&mut self, reading: &SensorReading) -> Result<(), BusError> {
        let value = CompensationValue::from_reading(reading);
        self.bus
            .write(self.address, ENV_DATA_REGISTER, &value.to_bytes())?;
        debug!(
            "ccs811 compensation updated with temp {} C, humidity {} %",
            reading.temperature_celsius, reading.humidity_percent
        );
        Ok(())
    }

    /// Gets if a new measurement can be read.
    /// If error, returns the error.
    pub fn is_data_ready(&mut self) -> Result<bool, BusError> {
        let status = self.read_byte(STATUS_REGISTER)?;
        Ok(status & DATA_READY_MASK != 0)
    }

    /// Reads eCO2 and eTVOC.
    ///
    /// Returns `None` when no new measurement is available; the data
    /// register is not touched in that case.
    pub fn read_gas(&mut self) -> Result<Option<GasReading>, BusError> {
        if !self.is_data_ready()? {
            debug!("ccs811 has no new data");
            return Ok(None);
        }
        let data = self.read_exact(DATA_REGISTER, 4)?;
        trace!("ccs811 raw data {:02x?}", data);
        GasReading::from_bytes(&data).map(Some)
    }

    /// Reads STATUS and ERROR_ID
    pub fn read_status(&mut self) -> Result<DeviceStatus, BusError> {
        let status = self.read_byte(STATUS_REGISTER)?;
        let error_id = self.read_byte(ERROR_ID_REGISTER)?;
        Ok(DeviceStatus::decode(status, error_id))
    }

    fn read_byte(&mut self, register: u8) -> Result<u8, BusError> {
        let data = self.read_exact(register, 1)?;
        Ok(data[0])
    }

    fn read_exact(&mut self, register: u8, len: usize) -> Result<Vec<u8>, BusError> {
        let data = self.bus.read(self.address, register, len)?;
        if data.len() != len {
            return Err(BusError::new(
                register,
                BusOp::Read,
                BusErrorKind::MalformedLength {
                    expected: len,
                    actual: data.len(),
                },
            ));
        }
        Ok(data)
    }
}
