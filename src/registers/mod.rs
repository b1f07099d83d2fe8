//! Zero-based register storage shared by the protocol server and the
//! device's own controller.

pub mod bank;
pub mod context;

use serde::{Deserialize, Serialize};

pub use bank::{Access, RegisterBank, SharedLock};
pub use context::{DeviceContext, Reply, ServerContext, TableSpec};

/// Register table of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Table {
    Holding,
    Input,
}
