// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory doubles shared by the unit tests.

use crate::bus::{BusDriver, BusError, BusErrorKind, BusOp};
use crate::session::Clock;
use crate::source::{HumidityTempSource, SensorError, SensorReading};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub op: BusOp,
    pub addr: u8,
    pub register: u8,
    pub bytes: Vec<u8>,
    pub len: usize,
}

impl Transaction {
    pub fn write(addr: u8, register: u8, bytes: &[u8]) -> Transaction {
        Transaction {
            op: BusOp::Write,
            addr,
            register,
            bytes: bytes.to_vec(),
            len: bytes.len(),
        }
    }

    pub fn read(addr: u8, register: u8, len: usize) -> Transaction {
        Transaction {
            op: BusOp::Read,
            addr,
            register,
            bytes: Vec::new(),
            len,
        }
    }
}

/// Bus that answers reads from fixed per-register responses and records
/// every transaction, failed ones included.
#[derive(Default)]
pub struct ScriptedBus {
    pub transactions: Vec<Transaction>,
    responses: HashMap<u8, Vec<u8>>,
    read_failures: HashMap<u8, BusErrorKind>,
    write_failures: HashMap<u8, (BusErrorKind, Option<usize>)>,
}

impl ScriptedBus {
    pub fn new() -> ScriptedBus {
        ScriptedBus::default()
    }

    pub fn respond(mut self, register: u8, bytes: &[u8]) -> ScriptedBus {
        self.responses.insert(register, bytes.to_vec());
        self
    }

    pub fn fail_read(mut self, register: u8, kind: BusErrorKind) -> ScriptedBus {
        self.read_failures.insert(register, kind);
        self
    }

    pub fn fail_write(mut self, register: u8, kind: BusErrorKind) -> ScriptedBus {
        self.write_failures.insert(register, (kind, None));
        self
    }

    /// Fails the first `times` writes to `register`, then succeeds
    pub fn fail_write_times(mut self, register: u8, kind: BusErrorKind, times: usize) -> ScriptedBus {
        self.write_failures.insert(register, (kind, Some(times)));
        self
    }

    pub fn writes_to(&self, register: u8) -> usize {
        self.transactions
            .iter()
            .filter(|t| t.op == BusOp::Write && t.register == register)
            .count()
    }

    pub fn reads_of(&self, register: u8) -> usize {
        self.transactions
            .iter()
            .filter(|t| t.op == BusOp::Read && t.register == register)
            .count()
    }
}

impl BusDriver for ScriptedBus {
    fn write(&mut self, addr: u8, register: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.transactions.push(Transaction::write(addr, register, bytes));
        let Some((kind, remaining)) = self.write_failures.get_mut(&register) else {
            return Ok(());
        };
        let err = BusError::new(register, BusOp::Write, kind.clone());
        match remaining {
            Some(0) => Ok(()),
            Some(n) => {
                *n -= 1;
                Err(err)
            }
            None => Err(err),
        }
    }

    fn read(&mut self, addr: u8, register: u8, len: usize) -> Result<Vec<u8>, BusError> {
        self.transactions.push(Transaction::read(addr, register, len));
        if let Some(kind) = self.read_failures.get(&register) {
            return Err(BusError::new(register, BusOp::Read, kind.clone()));
        }
        Ok(self
            .responses
            .get(&register)
            .cloned()
            .unwrap_or_else(|| vec![0; len]))
    }
}

/// Source replaying a queue of outcomes, then repeating the last one
pub struct ScriptedSource {
    outcomes: VecDeque<Result<SensorReading, SensorError>>,
    last: Result<SensorReading, SensorError>,
    pub calls: usize,
}

impl ScriptedSource {
    pub fn new(outcomes: Vec<Result<SensorReading, SensorError>>) -> ScriptedSource {
        ScriptedSource {
            outcomes: outcomes.into(),
            last: Err(SensorError::NoData),
            calls: 0,
        }
    }

    pub fn steady(reading: SensorReading) -> ScriptedSource {
        ScriptedSource::new(vec![Ok(reading)])
    }
}

impl HumidityTempSource for ScriptedSource {
    fn measure(&mut self) -> Result<SensorReading, SensorError> {
        self.calls += 1;
        if let Some(next) = self.outcomes.pop_front() {
            self.last = next;
        }
        self.last.clone()
    }
}

/// Clock that moves forward by `step` every time it is read
pub struct SteppingClock {
    base: Instant,
    offset: Cell<Duration>,
    step: Duration,
}

impl SteppingClock {
    pub fn new(step: Duration) -> SteppingClock {
        SteppingClock {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Instant {
        let now = self.base + self.offset.get();
        self.offset.set(self.offset.get() + self.step);
        now
    }
}
