//! Published register maps of each device kind.
//!
//! Addresses are zero-based. Every named register carries the quantity that
//! decides its scale and encoding.

use super::DeviceKind;
use crate::error::DeviceError;
use crate::registers::{DeviceContext, Table, TableSpec};
use crate::scaling::Quantity;

pub mod pms {
    /// Holding: plant-wide power demand, kW (+ discharge).
    pub const DEMAND_CONTROL_POWER: u16 = 0;
    pub const TOTAL_ACTIVE_POWER: u16 = 0;
    pub const SOC_AVG: u16 = 1;
    pub const SOH_AVG: u16 = 2;
    pub const CAPACITY_TOTAL: u16 = 3;
}

pub mod pcs {
    /// Holding: commanded power, kW.
    pub const POWER_SETPOINT: u16 = 0;
    pub const ACTIVE_POWER: u16 = 0;
}

pub mod bms {
    pub const SOC: u16 = 0;
    pub const SOH: u16 = 1;
    pub const CAPACITY: u16 = 2;
    /// SOC, SOH and capacity are contiguous so one read fetches all three.
    pub const STATUS_LEN: u16 = 3;
}

pub mod meter {
    pub const ACTIVE_POWER: u16 = 0;
}

/// Shape of one table in a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableShape {
    Unsupported,
    Sized(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDef {
    pub name: &'static str,
    pub table: Table,
    pub address: u16,
    pub quantity: Quantity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    pub holding: TableShape,
    pub input: TableShape,
    pub registers: &'static [RegisterDef],
}

const fn reg(name: &'static str, table: Table, address: u16, quantity: Quantity) -> RegisterDef {
    RegisterDef {
        name,
        table,
        address,
        quantity,
    }
}

pub static PMS: Layout = Layout {
    holding: TableShape::Sized(10),
    input: TableShape::Sized(10),
    registers: &[
        reg("demand_control_power", Table::Holding, pms::DEMAND_CONTROL_POWER, Quantity::PowerKw),
        reg("total_active_power", Table::Input, pms::TOTAL_ACTIVE_POWER, Quantity::PowerKw),
        reg("soc_avg", Table::Input, pms::SOC_AVG, Quantity::Percent),
        reg("soh_avg", Table::Input, pms::SOH_AVG, Quantity::Percent),
        reg("capacity_total", Table::Input, pms::CAPACITY_TOTAL, Quantity::EnergyKwh),
    ],
};

pub static PCS: Layout = Layout {
    holding: TableShape::Sized(10),
    input: TableShape::Sized(10),
    registers: &[
        reg("power_setpoint", Table::Holding, pcs::POWER_SETPOINT, Quantity::PowerKw),
        reg("active_power", Table::Input, pcs::ACTIVE_POWER, Quantity::PowerKw),
    ],
};

pub static BMS: Layout = Layout {
    holding: TableShape::Unsupported,
    input: TableShape::Sized(10),
    registers: &[
        reg("soc", Table::Input, bms::SOC, Quantity::Percent),
        reg("soh", Table::Input, bms::SOH, Quantity::Percent),
        reg("capacity", Table::Input, bms::CAPACITY, Quantity::EnergyKwh),
    ],
};

pub static METER: Layout = Layout {
    holding: TableShape::Unsupported,
    input: TableShape::Sized(10),
    registers: &[reg("active_power", Table::Input, meter::ACTIVE_POWER, Quantity::PowerKw)],
};

impl Layout {
    pub fn register(&self, name: &str) -> Option<&RegisterDef> {
        self.registers.iter().find(|r| r.name == name)
    }
}

/// Build the register store of a device, seeding named registers with
/// physical values. Unlisted registers start at zero.
pub fn build_context(
    kind: DeviceKind,
    unit_id: u8,
    initial: &[(&str, f64)],
) -> Result<DeviceContext, DeviceError> {
    let layout = kind.layout();
    let mut holding = Vec::new();
    let mut input = Vec::new();

    for &(name, value) in initial {
        let def = layout
            .register(name)
            .ok_or_else(|| DeviceError::UnknownRegister {
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        let raw = def
            .quantity
            .encode(value)
            .map_err(|source| DeviceError::Encode {
                name: def.name,
                source,
            })?;
        match def.table {
            Table::Holding => holding.push((def.address, raw)),
            Table::Input => input.push((def.address, raw)),
        }
    }

    let spec = |shape: TableShape, init: Vec<(u16, u16)>| match shape {
        TableShape::Unsupported => TableSpec::Unsupported,
        TableShape::Sized(size) => TableSpec::Sized { size, init },
    };
    Ok(DeviceContext::new(
        unit_id,
        spec(layout.holding, holding),
        spec(layout.input, input),
    )?)
}
