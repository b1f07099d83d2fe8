//! Modbus TCP simulator of a small battery plant: a PMS splitting demand
//! over PCS units, each backed by a BMS, plus a grid meter.

pub mod config;
pub mod devices;
pub mod error;
pub mod faults;
pub mod modbus;
pub mod plant;
pub mod registers;
pub mod scaling;
pub mod telemetry;
