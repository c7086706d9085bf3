/*!
Datagram wire format.

Every datagram starts with a 4-byte header followed by `length` payload
bytes:

```text
byte 0: message type (0 = EMPTY ack-only, 1 = PAYLOAD)
byte 1: active-message id
byte 2..4: payload length, little endian
```

An EMPTY header is what a peer receives when its send matched a post that
carried no data of its own (the wildcard receive, or an endpoint that had
nothing to piggyback): it acknowledges the exchange and nothing else.
*/

use crate::status::{Error, Result};

/// Encoded header size in bytes.
pub const UDT_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Ack-only datagram; carries no active message.
    Empty = 0,
    /// Carries an active message of `length` bytes.
    Payload = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdtHeader {
    pub msg_type: MsgType,
    pub am_id: u8,
    pub length: u16,
}

impl UdtHeader {
    pub const EMPTY: UdtHeader = UdtHeader {
        msg_type: MsgType::Empty,
        am_id: 0,
        length: 0,
    };

    pub fn to_bytes(self) -> [u8; UDT_HEADER_LEN] {
        let len = self.length.to_le_bytes();
        [self.msg_type as u8, self.am_id, len[0], len[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < UDT_HEADER_LEN {
            return Err(Error::Provider("datagram shorter than its header".into()));
        }
        let msg_type = match bytes[0] {
            0 => MsgType::Empty,
            1 => MsgType::Payload,
            _ => return Err(Error::Provider("unknown datagram header type".into())),
        };
        Ok(Self {
            msg_type,
            am_id: bytes[1],
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        let h = UdtHeader {
            msg_type: MsgType::Payload,
            am_id: 7,
            length: 0x0102,
        };
        assert_eq!(h.to_bytes(), [1, 7, 0x02, 0x01]);
        assert_eq!(UdtHeader::from_bytes(&h.to_bytes()).unwrap(), h);
        assert_eq!(UdtHeader::EMPTY.to_bytes(), [0, 0, 0, 0]);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert!(UdtHeader::from_bytes(&[1, 0]).is_err());
        assert!(UdtHeader::from_bytes(&[9, 0, 0, 0]).is_err());
    }
}
