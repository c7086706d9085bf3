/*!
Pooled datagram descriptors.

A descriptor carries both sides of one datagram exchange: the send header
and payload it was posted with, and the receive header and payload the
matching peer post delivered. Receive payloads land `rx_headroom` bytes into
the receive buffer so an upper layer that keeps the descriptor can prepend
its own framing without copying.

A descriptor is owned by exactly one place at a time: the free pool, an
endpoint's posted slot (or the interface's wildcard slot), a queued-AM
record awaiting sync dispatch, or the retained-descriptor table after a
callback kept it. `DescToken` is the user-visible proof of that last state;
`release_am_desc` trades it back for a pool slot.
*/

use crate::provider::DATAGRAM_MAX_SIZE;
use crate::status::{Error, Result};

use super::wire::{UdtHeader, UDT_HEADER_LEN};

/// Largest payload a single datagram can carry.
pub const MAX_SEG_PAYLOAD: usize = DATAGRAM_MAX_SIZE - UDT_HEADER_LEN;

/// Proof of ownership of a receive descriptor retained by an
/// active-message callback. Redeemed via `UdtIface::release_am_desc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescToken(pub(crate) u64);

pub(crate) struct UdtDesc {
    pub(crate) send_header: UdtHeader,
    send_data: Box<[u8]>,
    pub(crate) recv_header: UdtHeader,
    recv_data: Box<[u8]>,
    rx_headroom: usize,
}

impl UdtDesc {
    pub(crate) fn new(rx_headroom: usize) -> Self {
        Self {
            send_header: UdtHeader::EMPTY,
            send_data: vec![0; MAX_SEG_PAYLOAD].into_boxed_slice(),
            recv_header: UdtHeader::EMPTY,
            recv_data: vec![0; rx_headroom + MAX_SEG_PAYLOAD].into_boxed_slice(),
            rx_headroom,
        }
    }

    /// Return the descriptor to its pristine state before reuse.
    pub(crate) fn reset(&mut self) {
        self.send_header = UdtHeader::EMPTY;
        self.recv_header = UdtHeader::EMPTY;
    }

    /// AM-short packing: the 8-byte immediate header followed by the
    /// payload. Caller has validated the combined length.
    pub(crate) fn pack_short(&mut self, header: u64, payload: &[u8]) {
        self.send_data[..8].copy_from_slice(&header.to_le_bytes());
        self.send_data[8..8 + payload.len()].copy_from_slice(payload);
        self.send_header.length = (8 + payload.len()) as u16;
    }

    /// AM-bcopy packing: the callback writes directly into the send area
    /// and reports how many bytes it produced.
    pub(crate) fn pack_bcopy(&mut self, pack: impl FnOnce(&mut [u8]) -> usize) -> usize {
        let packed = pack(&mut self.send_data);
        assert!(
            packed <= self.send_data.len(),
            "pack callback reported more bytes than the send buffer holds"
        );
        self.send_header.length = packed as u16;
        packed
    }

    /// The wire image of the current send state: header plus used payload.
    pub(crate) fn send_bytes(&self) -> Vec<u8> {
        let used = self.send_header.length as usize;
        let mut out = Vec::with_capacity(UDT_HEADER_LEN + used);
        out.extend_from_slice(&self.send_header.to_bytes());
        out.extend_from_slice(&self.send_data[..used]);
        out
    }

    /// Decode a received datagram into the receive area.
    pub(crate) fn fill_recv(&mut self, data: &[u8]) -> Result<()> {
        let header = UdtHeader::from_bytes(data)?;
        let len = header.length as usize;
        if len > MAX_SEG_PAYLOAD || data.len() < UDT_HEADER_LEN + len {
            return Err(Error::Provider(
                "datagram payload length out of bounds".into(),
            ));
        }
        self.recv_data[self.rx_headroom..self.rx_headroom + len]
            .copy_from_slice(&data[UDT_HEADER_LEN..UDT_HEADER_LEN + len]);
        self.recv_header = header;
        Ok(())
    }

    /// The received active-message payload.
    pub(crate) fn recv_payload(&self) -> &[u8] {
        let len = self.recv_header.length as usize;
        &self.recv_data[self.rx_headroom..self.rx_headroom + len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udt::wire::MsgType;

    #[test]
    fn short_packing_prepends_the_immediate_header() {
        let mut desc = UdtDesc::new(0);
        desc.pack_short(0xDEAD_BEEF, b"hi");
        desc.send_header.msg_type = MsgType::Payload;
        desc.send_header.am_id = 7;

        let wire = desc.send_bytes();
        assert_eq!(wire.len(), UDT_HEADER_LEN + 10);
        assert_eq!(&wire[..4], &[1, 7, 10, 0]);
        assert_eq!(
            &wire[4..],
            &[0xEF, 0xBE, 0xAD, 0xDE, 0, 0, 0, 0, b'h', b'i']
        );
    }

    #[test]
    fn recv_payload_honors_headroom() {
        let mut desc = UdtDesc::new(16);
        let mut wire = UdtHeader {
            msg_type: MsgType::Payload,
            am_id: 3,
            length: 4,
        }
        .to_bytes()
        .to_vec();
        wire.extend_from_slice(b"data");

        desc.fill_recv(&wire).unwrap();
        assert_eq!(desc.recv_header.am_id, 3);
        assert_eq!(desc.recv_payload(), b"data");
    }

    #[test]
    fn oversized_receive_is_rejected() {
        let mut desc = UdtDesc::new(0);
        let bad = UdtHeader {
            msg_type: MsgType::Payload,
            am_id: 0,
            length: (MAX_SEG_PAYLOAD + 1) as u16,
        }
        .to_bytes();
        assert!(desc.fill_recv(&bad).is_err());
    }
}
