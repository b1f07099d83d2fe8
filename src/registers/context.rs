use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::ReentrantMutexGuard;

use super::bank::{shared_lock, Access, RegisterBank, SharedLock};
use super::Table;
use crate::error::{DispatchError, RegisterError};
use crate::modbus::pdu::{FunctionCode, Request};

/// Shape of one register table when building a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSpec {
    /// The device has no such table; every access is rejected.
    Unsupported,
    Sized { size: usize, init: Vec<(u16, u16)> },
}

impl TableSpec {
    pub fn sized(size: usize) -> Self {
        TableSpec::Sized {
            size,
            init: Vec::new(),
        }
    }
}

/// Successful outcome of a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Registers(Vec<u16>),
    Written { address: u16, value: u16 },
}

/// Holding and input banks of one unit, behind one shared reentrant lock.
#[derive(Debug)]
pub struct DeviceContext {
    unit_id: u8,
    lock: SharedLock,
    holding: RegisterBank,
    input: RegisterBank,
}

impl DeviceContext {
    pub fn new(unit_id: u8, holding: TableSpec, input: TableSpec) -> Result<Self, RegisterError> {
        let lock = shared_lock();
        let holding = Self::build(Table::Holding, Access::ReadWrite, &lock, holding)?;
        let input = Self::build(Table::Input, Access::ReadOnly, &lock, input)?;
        Ok(Self {
            unit_id,
            lock,
            holding,
            input,
        })
    }

    fn build(
        table: Table,
        access: Access,
        lock: &SharedLock,
        spec: TableSpec,
    ) -> Result<RegisterBank, RegisterError> {
        match spec {
            TableSpec::Unsupported => Ok(RegisterBank::unsupported(table, Arc::clone(lock))),
            TableSpec::Sized { size, init } => {
                RegisterBank::new(table, access, Arc::clone(lock), size, &init)
            }
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn holding(&self) -> &RegisterBank {
        &self.holding
    }

    pub fn input(&self) -> &RegisterBank {
        &self.input
    }

    pub fn bank(&self, table: Table) -> &RegisterBank {
        match table {
            Table::Holding => &self.holding,
            Table::Input => &self.input,
        }
    }

    /// Hold the device lock for a batch of accesses. Concurrent protocol
    /// reads wait until the guard is dropped.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Route a request to the bank its function code addresses. Bank errors
    /// are passed through untouched.
    pub fn dispatch(&self, request: &Request) -> Result<Reply, DispatchError> {
        match FunctionCode::try_from(request.function_code) {
            Ok(FunctionCode::ReadHoldingRegisters) => Ok(Reply::Registers(
                self.holding.read(request.address, request.value_or_count)?,
            )),
            Ok(FunctionCode::ReadInputRegisters) => Ok(Reply::Registers(
                self.input.read(request.address, request.value_or_count)?,
            )),
            Ok(FunctionCode::WriteSingleRegister) => {
                self.holding
                    .write(request.address, request.value_or_count)?;
                Ok(Reply::Written {
                    address: request.address,
                    value: request.value_or_count,
                })
            }
            Err(code) => Err(DispatchError::IllegalFunction(code)),
        }
    }
}

/// Units served by one listener.
#[derive(Debug, Clone, Default)]
pub struct ServerContext {
    units: HashMap<u8, Arc<DeviceContext>>,
}

impl ServerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(device: Arc<DeviceContext>) -> Self {
        let mut ctx = Self::new();
        ctx.insert(device);
        ctx
    }

    pub fn insert(&mut self, device: Arc<DeviceContext>) -> Option<Arc<DeviceContext>> {
        self.units.insert(device.unit_id(), device)
    }

    pub fn unit(&self, unit_id: u8) -> Option<&Arc<DeviceContext>> {
        self.units.get(&unit_id)
    }

    pub fn unit_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.units.keys().copied()
    }
}
