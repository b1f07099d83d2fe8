//! Conversion between physical quantities and 16-bit register words.
//!
//! Every register in the plant carries one of three quantities:
//!
//! | Quantity | Unit | Scale | Encoding |
//! |----------|------|-------|----------|
//! | power    | kW   | 0.1   | signed two's complement, fails outside ±3276.7 kW (measured sums saturate) |
//! | percent  | %    | 1     | unsigned, clamped to 0..=100 |
//! | energy   | kWh  | 0.1   | unsigned, clamped to >= 0 |
//!
//! Power sign convention: positive = discharge, negative = charge.

use serde::{Deserialize, Serialize};

use crate::error::EncodeError;

pub const POWER_SCALE_KW: f64 = 0.1;
pub const PERCENT_SCALE: f64 = 1.0;
pub const ENERGY_SCALE_KWH: f64 = 0.1;

/// Physical quantity stored in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Quantity {
    PowerKw,
    Percent,
    EnergyKwh,
}

impl Quantity {
    pub fn scale(self) -> f64 {
        match self {
            Quantity::PowerKw => POWER_SCALE_KW,
            Quantity::Percent => PERCENT_SCALE,
            Quantity::EnergyKwh => ENERGY_SCALE_KWH,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Quantity::PowerKw => "kW",
            Quantity::Percent => "%",
            Quantity::EnergyKwh => "kWh",
        }
    }

    pub fn encode(self, value: f64) -> Result<u16, EncodeError> {
        match self {
            Quantity::PowerKw => encode_power_kw(value),
            Quantity::Percent => Ok(encode_percent(value)),
            Quantity::EnergyKwh => Ok(encode_energy_kwh(value)),
        }
    }

    pub fn decode(self, raw: u16) -> f64 {
        match self {
            Quantity::PowerKw => decode_power_kw(raw),
            Quantity::Percent => decode_percent(raw),
            Quantity::EnergyKwh => decode_energy_kwh(raw),
        }
    }
}

/// kW -> two's complement word at 0.1 kW/LSB.
pub fn encode_power_kw(kw: f64) -> Result<u16, EncodeError> {
    if !kw.is_finite() {
        return Err(EncodeError::NotFinite(kw));
    }
    let raw = (kw / POWER_SCALE_KW).round();
    if raw < f64::from(i16::MIN) || raw > f64::from(i16::MAX) {
        return Err(EncodeError::OutOfRange {
            value: kw,
            min: f64::from(i16::MIN) * POWER_SCALE_KW,
            max: f64::from(i16::MAX) * POWER_SCALE_KW,
        });
    }
    Ok(raw as i16 as u16)
}

/// kW -> word like [`encode_power_kw`], pinned to the word range instead of
/// failing. For measured sums that may legitimately overshoot.
pub fn saturate_power_kw(kw: f64) -> u16 {
    if kw.is_nan() {
        return 0;
    }
    let raw = (kw / POWER_SCALE_KW)
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX));
    raw as i16 as u16
}

pub fn decode_power_kw(raw: u16) -> f64 {
    f64::from(raw as i16) * POWER_SCALE_KW
}

/// Percent (SOC/SOH) -> unsigned word, silently clamped to 0..=100.
pub fn encode_percent(percent: f64) -> u16 {
    if percent.is_nan() {
        return 0;
    }
    percent.clamp(0.0, 100.0).round() as u16
}

pub fn decode_percent(raw: u16) -> f64 {
    f64::from(raw) * PERCENT_SCALE
}

/// kWh -> unsigned word at 0.1 kWh/LSB, clamped at zero and at the word ceiling.
pub fn encode_energy_kwh(kwh: f64) -> u16 {
    if kwh.is_nan() {
        return 0;
    }
    let raw = (kwh.max(0.0) / ENERGY_SCALE_KWH).round();
    raw.min(f64::from(u16::MAX)) as u16
}

pub fn decode_energy_kwh(raw: u16) -> f64 {
    f64::from(raw) * ENERGY_SCALE_KWH
}
