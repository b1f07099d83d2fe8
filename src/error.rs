use std::time::Duration;

use thiserror::Error;

use crate::modbus::pdu::ExceptionCode;
use crate::registers::Table;

/// A frame that could not be turned into a request or response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("protocol id must be 0, got {0}")]
    ProtocolId(u16),
    #[error("length field {declared} does not match {actual} remaining bytes")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("pdu too short: {0} bytes")]
    PduTooShort(usize),
    #[error("byte count {declared} does not match {actual} payload bytes")]
    ByteCount { declared: u8, actual: usize },
    #[error("unsupported function code {0:#04x} in response")]
    UnknownFunction(u8),
}

/// A reply that does not fit the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("{0} registers do not fit in one read response")]
    TooManyRegisters(usize),
}

/// Register access failures. All of them surface as "illegal data address".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("{table} registers {address}..{end} outside bank of {size}")]
    OutOfRange {
        table: Table,
        address: u16,
        end: usize,
        size: usize,
    },
    #[error("invalid register count {0}")]
    InvalidCount(u16),
    #[error("{0} registers not supported by this device")]
    Unsupported(Table),
    #[error("{0} registers are read-only")]
    ReadOnly(Table),
}

impl RegisterError {
    pub fn exception_code(&self) -> ExceptionCode {
        ExceptionCode::IllegalDataAddress
    }
}

/// Why a request could not be served by a device context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("illegal function {0:#04x}")]
    IllegalFunction(u8),
    #[error(transparent)]
    Register(#[from] RegisterError),
}

impl DispatchError {
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            DispatchError::IllegalFunction(_) => ExceptionCode::IllegalFunction,
            DispatchError::Register(e) => e.exception_code(),
        }
    }
}

/// Physical value that cannot be represented in its register.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("{value} outside representable range {min}..={max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("value {0} is not finite")]
    NotFinite(f64),
}

/// Failure of an outbound request to a peer device.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error talking to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("no response from {addr} within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("{addr} closed the connection")]
    Closed { addr: String },
    #[error("exception code {code} for function {function:#04x}")]
    Exception { function: u8, code: u8 },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl ClientError {
    /// Whether a retry on a fresh connection could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Io { .. }
                | ClientError::ConnectTimeout { .. }
                | ClientError::Timeout { .. }
                | ClientError::Closed { .. }
        )
    }
}

/// Failure of a device's own register work: building its context or
/// publishing a tick. Peer failures never end up here.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{kind} has no register named {name}")]
    UnknownRegister { kind: String, name: String },
    #[error("register {name}: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: EncodeError,
    },
    #[error(transparent)]
    Register(#[from] RegisterError),
}
