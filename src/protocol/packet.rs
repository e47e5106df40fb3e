//! Wire codec for the flooding packet.
//!
//! Layout (24 bytes, all fields big-endian):
//!
//! ```text
//! 0        8        16    18    20        24
//! +--------+--------+-----+-----+---------+
//! |   x    |   y    | seq | hop | beacon  |
//! |  f64   |  f64   | u16 | u16 | IPv4    |
//! +--------+--------+-----+-----+---------+
//! ```
//!
//! Coordinates travel as the raw IEEE-754 bit pattern of the `f64`, so a
//! round trip is bit-exact for every value including NaN payloads and -0.0.

use std::fmt;

use super::error::DecodeError;
use super::types::{NodeAddress, Position};

/// Serialized size of a flooding packet in bytes.
pub const FLOODING_PACKET_SIZE: usize = 24;

/// Well-known UDP port the protocol floods on.
pub const FLOODING_PORT: u16 = 1234;

const X_OFFSET: usize = 0;
const Y_OFFSET: usize = 8;
const SEQUENCE_OFFSET: usize = 16;
const HOP_COUNT_OFFSET: usize = 18;
const BEACON_OFFSET: usize = 20;

/// Beacon advertisement carried by the flood.
#[derive(Debug, Clone, Copy)]
pub struct FloodingPacket {
    beacon_address: NodeAddress,
    hop_count: u16,
    sequence_number: u16,
    x: f64,
    y: f64,
}

impl FloodingPacket {
    pub fn new(beacon_address: NodeAddress, hop_count: u16, sequence_number: u16, position: Position) -> Self {
        Self {
            beacon_address,
            hop_count,
            sequence_number,
            x: position.x,
            y: position.y,
        }
    }

    pub fn beacon_address(&self) -> NodeAddress {
        self.beacon_address
    }

    pub fn hop_count(&self) -> u16 {
        self.hop_count
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }

    /// Serialize into the fixed 24-byte wire form.
    pub fn encode(&self) -> [u8; FLOODING_PACKET_SIZE] {
        let mut buf = [0u8; FLOODING_PACKET_SIZE];
        buf[X_OFFSET..Y_OFFSET].copy_from_slice(&self.x.to_bits().to_be_bytes());
        buf[Y_OFFSET..SEQUENCE_OFFSET].copy_from_slice(&self.y.to_bits().to_be_bytes());
        buf[SEQUENCE_OFFSET..HOP_COUNT_OFFSET].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[HOP_COUNT_OFFSET..BEACON_OFFSET].copy_from_slice(&self.hop_count.to_be_bytes());
        buf[BEACON_OFFSET..FLOODING_PACKET_SIZE].copy_from_slice(&self.beacon_address.octets());
        buf
    }

    /// Parse a packet from the front of `bytes`.
    ///
    /// Anything after the first 24 bytes is not part of the header and is
    /// ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < FLOODING_PACKET_SIZE {
            return Err(DecodeError::TruncatedPacket { len: bytes.len() });
        }

        let x = f64::from_bits(u64::from_be_bytes(read_array(bytes, X_OFFSET)));
        let y = f64::from_bits(u64::from_be_bytes(read_array(bytes, Y_OFFSET)));
        let sequence_number = u16::from_be_bytes(read_array(bytes, SEQUENCE_OFFSET));
        let hop_count = u16::from_be_bytes(read_array(bytes, HOP_COUNT_OFFSET));
        let beacon_address = NodeAddress::from_octets(read_array(bytes, BEACON_OFFSET));

        if !beacon_address.is_node_identity() {
            return Err(DecodeError::MalformedAddress(beacon_address.ip()));
        }

        Ok(Self {
            beacon_address,
            hop_count,
            sequence_number,
            x,
            y,
        })
    }
}

/// Copy `N` bytes starting at `offset`. Callers check the length first.
fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Bitwise equality so that NaN coordinates compare equal to themselves.
impl PartialEq for FloodingPacket {
    fn eq(&self, other: &Self) -> bool {
        self.beacon_address == other.beacon_address
            && self.hop_count == other.hop_count
            && self.sequence_number == other.sequence_number
            && self.x.to_bits() == other.x.to_bits()
            && self.y.to_bits() == other.y.to_bits()
    }
}

impl Eq for FloodingPacket {}

impl fmt::Display for FloodingPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Beacon: {}, hopCount: {}, ({}, {})",
            self.beacon_address, self.hop_count, self.x, self.y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn beacon() -> NodeAddress {
        NodeAddress::from_octets([10, 0, 0, 9])
    }

    #[test]
    fn encodes_fields_in_network_order() {
        let packet = FloodingPacket::new(beacon(), 0x0102, 0x0304, Position::new(1.0, -2.5));
        let bytes = packet.encode();

        assert_eq!(&bytes[0..8], &1.0f64.to_bits().to_be_bytes());
        assert_eq!(&bytes[8..16], &(-2.5f64).to_bits().to_be_bytes());
        assert_eq!(&bytes[16..18], &[0x03, 0x04]);
        assert_eq!(&bytes[18..20], &[0x01, 0x02]);
        assert_eq!(&bytes[20..24], &[10, 0, 0, 9]);
    }

    #[test]
    fn short_buffers_are_truncated() {
        let bytes = FloodingPacket::new(beacon(), 1, 1, Position::ORIGIN).encode();
        assert_eq!(
            FloodingPacket::decode(&bytes[..23]),
            Err(DecodeError::TruncatedPacket { len: 23 })
        );
        assert_eq!(FloodingPacket::decode(&[]), Err(DecodeError::TruncatedPacket { len: 0 }));
    }

    #[test]
    fn broadcast_beacon_address_is_malformed() {
        let mut bytes = FloodingPacket::new(beacon(), 1, 1, Position::ORIGIN).encode();
        bytes[20..24].copy_from_slice(&[255, 255, 255, 255]);
        assert_eq!(
            FloodingPacket::decode(&bytes),
            Err(DecodeError::MalformedAddress(std::net::Ipv4Addr::BROADCAST))
        );
    }

    #[test]
    fn class_e_beacon_address_is_malformed() {
        let mut bytes = FloodingPacket::new(beacon(), 1, 1, Position::ORIGIN).encode();
        bytes[20..24].copy_from_slice(&[255, 255, 255, 200]);
        assert_eq!(
            FloodingPacket::decode(&bytes),
            Err(DecodeError::MalformedAddress(std::net::Ipv4Addr::new(255, 255, 255, 200)))
        );

        bytes[20..24].copy_from_slice(&[240, 1, 2, 3]);
        assert!(matches!(FloodingPacket::decode(&bytes), Err(DecodeError::MalformedAddress(_))));
    }

    #[test]
    fn trailing_payload_is_ignored() {
        let packet = FloodingPacket::new(beacon(), 3, 17, Position::new(250.0, 400.0));
        let mut datagram = packet.encode().to_vec();
        datagram.extend_from_slice(b"payload");
        assert_eq!(FloodingPacket::decode(&datagram), Ok(packet));
    }

    #[test]
    fn display_matches_dump_format() {
        let packet = FloodingPacket::new(beacon(), 2, 5, Position::new(50.0, 100.0));
        assert_eq!(packet.to_string(), "Beacon: 10.0.0.9, hopCount: 2, (50, 100)");
    }

    proptest! {
        #[test]
        fn decode_inverts_encode_bit_exactly(
            octets in any::<[u8; 4]>().prop_filter("node identity", |o| NodeAddress::from_octets(*o).is_node_identity()),
            hop_count in any::<u16>(),
            sequence_number in any::<u16>(),
            x_bits in any::<u64>(),
            y_bits in any::<u64>(),
        ) {
            let packet = FloodingPacket::new(
                NodeAddress::from_octets(octets),
                hop_count,
                sequence_number,
                Position::new(f64::from_bits(x_bits), f64::from_bits(y_bits)),
            );
            let decoded = FloodingPacket::decode(&packet.encode()).unwrap();
            prop_assert_eq!(decoded, packet);
            prop_assert_eq!(decoded.position().x.to_bits(), x_bits);
            prop_assert_eq!(decoded.position().y.to_bits(), y_bits);
        }
    }
}
