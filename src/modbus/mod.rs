//! Modbus TCP wire protocol: framing, PDU codec, server and client.

pub mod client;
pub mod frame;
pub mod pdu;
pub mod server;

pub use client::{ClientSettings, ModbusTcpClient, RegisterPeer};
pub use frame::AduCodec;
pub use pdu::{ExceptionCode, FunctionCode, Request, Response, ResponseBody};
pub use server::ModbusTcpServer;

/// Space-separated hex for trace logs.
pub(crate) fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_hexdump() {
        assert_eq!(super::hexdump(&[0x00, 0xab, 0x10]), "00 ab 10");
        assert_eq!(super::hexdump(&[]), "");
    }
}
