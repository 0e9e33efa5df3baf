//! BGB link protocol packets.
//!
//! Every packet on the wire is exactly 8 bytes: a command byte, three payload
//! bytes, and a 31-bit little-endian timestamp (the top bit is always zero).
//! See <https://bgb.bircd.org/bgblink.html>.

use crate::error::LinkError;

/// Protocol revision implemented by this crate: (major, minor, patch).
pub const PROTOCOL_VERSION: (u8, u8, u8) = (1, 4, 0);

/// Fixed size of every packet on the wire.
pub const PACKET_SIZE: usize = 8;

/// Only the low 31 bits of a timestamp are meaningful; it wraps.
pub const TIMESTAMP_MASK: u32 = 0x7FFF_FFFF;

pub const CMD_VERSION: u8 = 1;
pub const CMD_JOYPAD: u8 = 101;
pub const CMD_SYNC1: u8 = 104;
pub const CMD_SYNC2: u8 = 105;
pub const CMD_SYNC3: u8 = 106;
pub const CMD_STATUS: u8 = 108;
pub const CMD_WANTDISCONNECT: u8 = 109;

/// Decoded command byte. Unknown commands are preserved rather than rejected;
/// ignoring them is the dispatch layer's job, not the codec's.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Version,
    JoypadUpdate,
    Sync1,
    Sync2,
    Sync3,
    Status,
    WantDisconnect,
    Unknown(u8),
}

impl PacketKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            CMD_VERSION => Self::Version,
            CMD_JOYPAD => Self::JoypadUpdate,
            CMD_SYNC1 => Self::Sync1,
            CMD_SYNC2 => Self::Sync2,
            CMD_SYNC3 => Self::Sync3,
            CMD_STATUS => Self::Status,
            CMD_WANTDISCONNECT => Self::WantDisconnect,
            other => Self::Unknown(other),
        }
    }
}

/// One link packet, as sent and received on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub kind: u8,
    pub b2: u8,
    pub b3: u8,
    pub b4: u8,
    pub timestamp: u32,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        PacketKind::from_raw(self.kind)
    }

    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        buf[0] = self.kind;
        buf[1] = self.b2;
        buf[2] = self.b3;
        buf[3] = self.b4;
        buf[4..8].copy_from_slice(&(self.timestamp & TIMESTAMP_MASK).to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; PACKET_SIZE]) -> Self {
        Self {
            kind: buf[0],
            b2: buf[1],
            b3: buf[2],
            b4: buf[3],
            timestamp: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Decodes a packet from a byte slice. Fails only on a wrong length;
    /// an unrecognized command byte still decodes.
    pub fn decode(bytes: &[u8]) -> Result<Self, LinkError> {
        let buf: &[u8; PACKET_SIZE] = bytes
            .try_into()
            .map_err(|_| LinkError::MalformedPacket { len: bytes.len() })?;
        Ok(Self::from_bytes(buf))
    }

    /// The version handshake packet announcing [`PROTOCOL_VERSION`].
    pub fn version() -> Self {
        let (major, minor, patch) = PROTOCOL_VERSION;
        Self {
            kind: CMD_VERSION,
            b2: major,
            b3: minor,
            b4: patch,
            timestamp: 0,
        }
    }

    /// Status packet: running, not paused, no reconnect support. The flags
    /// ride in separate payload bytes.
    pub fn status(timestamp: u32) -> Self {
        Self {
            kind: CMD_STATUS,
            b2: 1,
            b3: 0,
            b4: 0,
            timestamp,
        }
    }

    /// Sync packet carrying one outgoing bit and the current SC value.
    /// `kind` is [`CMD_SYNC1`] when the master originates it, [`CMD_SYNC2`]
    /// when the slave does.
    pub fn sync(kind: u8, bit: u8, sc: u8, timestamp: u32) -> Self {
        Self {
            kind,
            b2: bit,
            b3: sc,
            b4: 0,
            timestamp,
        }
    }

    /// Sync3 acknowledge: the payload bytes are echoed back verbatim.
    pub fn sync3_echo(b2: u8, b3: u8, b4: u8, timestamp: u32) -> Self {
        Self {
            kind: CMD_SYNC3,
            b2,
            b3,
            b4,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_hex(hex: &str) -> Packet {
        let bytes: Vec<u8> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect();
        Packet::decode(&bytes).unwrap()
    }

    #[test]
    fn version_packet_matches_bgb_capture() {
        // Captured from a real BGB-to-BGB session.
        assert_eq!(
            Packet::version().encode(),
            [0x01, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let packets = [
            Packet::version(),
            Packet::status(42),
            Packet::sync(CMD_SYNC1, 1, 0x81, 0x1234_5678),
            Packet::sync(CMD_SYNC2, 0, 0x00, 7),
            Packet::sync3_echo(0xAA, 0xBB, 0xCC, 0x7FFF_FFFF),
        ];
        for packet in packets {
            assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn decode_rejects_short_and_long_input() {
        assert_eq!(
            Packet::decode(&[1, 2, 3]),
            Err(LinkError::MalformedPacket { len: 3 })
        );
        assert_eq!(
            Packet::decode(&[0u8; 9]),
            Err(LinkError::MalformedPacket { len: 9 })
        );
    }

    #[test]
    fn decode_accepts_unknown_command() {
        let packet = Packet::decode(&[0xF0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(packet.kind(), PacketKind::Unknown(0xF0));
    }

    #[test]
    fn encode_masks_timestamp_to_31_bits() {
        let packet = Packet::sync(CMD_SYNC1, 1, 0x81, 0xFFFF_FFFF);
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.timestamp, 0x7FFF_FFFF);
    }

    #[test]
    fn sync1_from_real_capture() {
        // SYNC1 data=0x01 ctrl=0x85 ts=49667669.
        let packet = from_hex("6801850055def502");
        assert_eq!(packet.kind(), PacketKind::Sync1);
        assert_eq!(packet.b2, 0x01);
        assert_eq!(packet.b3, 0x85);
        assert_eq!(packet.timestamp, 49_667_669);
    }

    #[test]
    fn status_flags_ride_in_separate_bytes() {
        let status = Packet::status(9);
        assert_eq!(status.kind, CMD_STATUS);
        assert_eq!((status.b2, status.b3, status.b4), (1, 0, 0));
        assert_eq!(status.timestamp, 9);
    }

    #[test]
    fn command_bytes_map_to_kinds() {
        assert_eq!(PacketKind::from_raw(1), PacketKind::Version);
        assert_eq!(PacketKind::from_raw(101), PacketKind::JoypadUpdate);
        assert_eq!(PacketKind::from_raw(104), PacketKind::Sync1);
        assert_eq!(PacketKind::from_raw(105), PacketKind::Sync2);
        assert_eq!(PacketKind::from_raw(106), PacketKind::Sync3);
        assert_eq!(PacketKind::from_raw(108), PacketKind::Status);
        assert_eq!(PacketKind::from_raw(109), PacketKind::WantDisconnect);
        assert_eq!(PacketKind::from_raw(42), PacketKind::Unknown(42));
    }
}
