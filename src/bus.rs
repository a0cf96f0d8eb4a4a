// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Two-wire register transport.
//!
//! [`BusDriver`] moves raw bytes to and from a device register and nothing
//! else. The Linux implementation wraps an `i2cdev` character device.

use i2cdev::core::*;
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
use log::trace;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Kind of bus transaction that was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    /// Register write
    Write,
    /// Register read
    Read,
}

impl fmt::Display for BusOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BusOp::Write => fmt::Display::fmt("write", f),
            BusOp::Read => fmt::Display::fmt("read", f),
        }
    }
}

/// Why a bus transaction failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusErrorKind {
    /// The addressed device did not acknowledge
    #[error("no acknowledge")]
    Nack,
    /// The transaction did not complete in time
    #[error("timed out")]
    Timeout,
    /// The device returned a different number of bytes than requested
    #[error("expected {expected} bytes, got {actual}")]
    MalformedLength { expected: usize, actual: usize },
    /// Any other transport failure, carried as text
    #[error("{0}")]
    Transport(String),
}

///
/// Bus error, carrying the register and the operation
/// that faulted. The protocol layer never retries,
/// so this is what the caller sees.
///
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bus {op} of register {register:#04x} failed: {kind}")]
pub struct BusError {
    pub register: u8,
    pub op: BusOp,
    #[source]
    pub kind: BusErrorKind,
}

impl BusError {
    pub fn new(register: u8, op: BusOp, kind: BusErrorKind) -> Self {
        BusError { register, op, kind }
    }
}

/// Raw register access on an addressed two-wire bus
pub trait BusDriver {
    /// Writes `bytes` to `register` of the device at `addr`
    fn write(&mut self, addr: u8, register: u8, bytes: &[u8]) -> Result<(), BusError>;

    /// Reads exactly `len` bytes from `register` of the device at `addr`
    fn read(&mut self, addr: u8, register: u8, len: usize) -> Result<Vec<u8>, BusError>;
}

/// Linux bus, wraps a LinuxI2CDevice
///
/// The slave address is switched on demand, so a single
/// handle can address any device on the adapter.
/// The device file is closed when this value is dropped.
pub struct LinuxBus {
    i2cdev: LinuxI2CDevice,
    current_addr: u8,
}

impl LinuxBus {
    /// Opens the adapter at `path` (e.g. `/dev/i2c-1`) addressing `addr`.
    /// If fails, return an LinuxI2CError from i2cdev
    pub fn open<P: AsRef<Path>>(path: P, addr: u8) -> Result<LinuxBus, LinuxI2CError> {
        let device = LinuxI2CDevice::new(path, u16::from(addr))?;
        Ok(LinuxBus {
            i2cdev: device,
            current_addr: addr,
        })
    }

    fn select(&mut self, addr: u8, register: u8, op: BusOp) -> Result<(), BusError> {
        if addr != self.current_addr {
            self.i2cdev
                .set_slave_address(u16::from(addr))
                .map_err(|e| linux_error(register, op, e))?;
            self.current_addr = addr;
        }
        Ok(())
    }
}

// Linux errno values reported by i2c adapter drivers
const ENXIO: i32 = 6;
const ETIMEDOUT: i32 = 110;
const EREMOTEIO: i32 = 121;

fn errno_kind(errno: i32) -> Option<BusErrorKind> {
    match errno {
        ETIMEDOUT => Some(BusErrorKind::Timeout),
        EREMOTEIO | ENXIO => Some(BusErrorKind::Nack),
        _ => None,
    }
}

fn linux_error(register: u8, op: BusOp, e: LinuxI2CError) -> BusError {
    let errno = match e {
        LinuxI2CError::Errno(n) => Some(n),
        LinuxI2CError::Io(ref io) => io.raw_os_error(),
    };
    let kind = errno
        .and_then(errno_kind)
        .unwrap_or_else(|| BusErrorKind::Transport(e.to_string()));
    BusError::new(register, op, kind)
}

impl BusDriver for LinuxBus {
    fn write(&mut self, addr: u8, register: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.select(addr, register, BusOp::Write)?;
        let mut buffer = Vec::with_capacity(bytes.len() + 1);
        buffer.push(register);
        buffer.extend_from_slice(bytes);
        trace!("i2c {:#04x} write {:#04x} {:02x?}", addr, register, bytes);
        self.i2cdev
            .write(&buffer)
            .map_err(|e| linux_error(register, BusOp::Write, e))
    }

    fn read(&mut self, addr: u8, register: u8, len: usize) -> Result<Vec<u8>, BusError> {
        self.select(addr, register, BusOp::Read)?;
        // Register pointer first, then the data phase
        self.i2cdev
            .write(&[register])
            .map_err(|e| linux_error(register, BusOp::Read, e))?;
        let mut data_buffer = vec![0u8; len];
        self.i2cdev
            .read(&mut data_buffer)
            .map_err(|e| linux_error(register, BusOp::Read, e))?;
        trace!("i2c {:#04x} read {:#04x} {:02x?}", addr, register, data_buffer);
        Ok(data_buffer)
    }
}
