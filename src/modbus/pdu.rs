//! Request/response encoding for the three modelled function codes.
//!
//! ```text
//! | tid u16 | pid u16 = 0 | len u16 | unit u8 | fc u8 | addr u16 | count/value u16 |
//! ```
//!
//! All multi-byte fields are big-endian. `len` counts the unit id plus the
//! PDU and is recomputed for every frame built here.

use byteorder::{BigEndian, ByteOrder};

use super::frame::MBAP_HEADER_LEN;
use crate::error::{BuildError, ParseError};
use crate::registers::Reply;

/// Most registers a single read may return (byte count is one byte).
pub const MAX_READ_REGISTERS: usize = 125;

const EXCEPTION_BIT: u8 = 0x80;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleRegister = 0x06,
}

impl TryFrom<u8> for FunctionCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            other => Err(other),
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    ServerDeviceFailure = 0x04,
}

/// A parsed request ADU. `value_or_count` is the register count for reads
/// and the written value for a single-register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub address: u16,
    pub value_or_count: u16,
}

impl Request {
    pub fn new(
        transaction_id: u16,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        value_or_count: u16,
    ) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            unit_id,
            function_code: function as u8,
            address,
            value_or_count,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut pdu = [0u8; 5];
        pdu[0] = self.function_code;
        BigEndian::write_u16(&mut pdu[1..3], self.address);
        BigEndian::write_u16(&mut pdu[3..5], self.value_or_count);
        adu(self.transaction_id, self.unit_id, &pdu)
    }
}

/// Payload of a parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Registers(Vec<u16>),
    Written { address: u16, value: u16 },
    Exception { function: u8, code: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub body: ResponseBody,
}

struct Header {
    transaction_id: u16,
    protocol_id: u16,
    unit_id: u8,
}

fn parse_header(frame: &[u8]) -> Result<Header, ParseError> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(ParseError::FrameTooShort(frame.len()));
    }
    let transaction_id = BigEndian::read_u16(&frame[0..2]);
    let protocol_id = BigEndian::read_u16(&frame[2..4]);
    let length = BigEndian::read_u16(&frame[4..6]);
    if protocol_id != 0 {
        return Err(ParseError::ProtocolId(protocol_id));
    }
    let actual = frame.len() - MBAP_HEADER_LEN;
    if length as usize != actual {
        return Err(ParseError::LengthMismatch {
            declared: length,
            actual,
        });
    }
    Ok(Header {
        transaction_id,
        protocol_id,
        unit_id: frame[MBAP_HEADER_LEN],
    })
}

pub fn parse_request(frame: &[u8]) -> Result<Request, ParseError> {
    let header = parse_header(frame)?;
    let pdu = &frame[MBAP_HEADER_LEN + 1..];
    if pdu.len() < 5 {
        return Err(ParseError::PduTooShort(pdu.len()));
    }
    Ok(Request {
        transaction_id: header.transaction_id,
        protocol_id: header.protocol_id,
        unit_id: header.unit_id,
        function_code: pdu[0],
        address: BigEndian::read_u16(&pdu[1..3]),
        value_or_count: BigEndian::read_u16(&pdu[3..5]),
    })
}

pub fn parse_response(frame: &[u8]) -> Result<Response, ParseError> {
    let header = parse_header(frame)?;
    let pdu = &frame[MBAP_HEADER_LEN + 1..];
    let function_code = pdu[0];

    let body = if function_code & EXCEPTION_BIT != 0 {
        let code = *pdu.get(1).ok_or(ParseError::PduTooShort(pdu.len()))?;
        ResponseBody::Exception {
            function: function_code & !EXCEPTION_BIT,
            code,
        }
    } else {
        match FunctionCode::try_from(function_code) {
            Ok(FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters) => {
                let declared = *pdu.get(1).ok_or(ParseError::PduTooShort(pdu.len()))?;
                let data = &pdu[2..];
                if data.len() != declared as usize || data.len() % 2 != 0 {
                    return Err(ParseError::ByteCount {
                        declared,
                        actual: data.len(),
                    });
                }
                ResponseBody::Registers(data.chunks_exact(2).map(BigEndian::read_u16).collect())
            }
            Ok(FunctionCode::WriteSingleRegister) => {
                if pdu.len() < 5 {
                    return Err(ParseError::PduTooShort(pdu.len()));
                }
                ResponseBody::Written {
                    address: BigEndian::read_u16(&pdu[1..3]),
                    value: BigEndian::read_u16(&pdu[3..5]),
                }
            }
            Err(code) => return Err(ParseError::UnknownFunction(code)),
        }
    };

    Ok(Response {
        transaction_id: header.transaction_id,
        unit_id: header.unit_id,
        function_code,
        body,
    })
}

/// Wrap a PDU in an MBAP header with a freshly computed length.
fn adu(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((1 + pdu.len()) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Read response: function code, byte count, then the words.
pub fn build_read_response(request: &Request, values: &[u16]) -> Result<Vec<u8>, BuildError> {
    if values.len() > MAX_READ_REGISTERS {
        return Err(BuildError::TooManyRegisters(values.len()));
    }
    let mut pdu = Vec::with_capacity(2 + values.len() * 2);
    pdu.push(request.function_code);
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(adu(request.transaction_id, request.unit_id, &pdu))
}

/// Single write response: echo of function code, address and value.
pub fn build_write_response(request: &Request, address: u16, value: u16) -> Vec<u8> {
    let mut pdu = [0u8; 5];
    pdu[0] = request.function_code;
    BigEndian::write_u16(&mut pdu[1..3], address);
    BigEndian::write_u16(&mut pdu[3..5], value);
    adu(request.transaction_id, request.unit_id, &pdu)
}

pub fn build_exception(request: &Request, code: ExceptionCode) -> Vec<u8> {
    adu(
        request.transaction_id,
        request.unit_id,
        &[request.function_code | EXCEPTION_BIT, code as u8],
    )
}

pub fn build_reply(request: &Request, reply: &Reply) -> Result<Vec<u8>, BuildError> {
    match reply {
        Reply::Registers(values) => build_read_response(request, values),
        Reply::Written { address, value } => Ok(build_write_response(request, *address, *value)),
    }
}
