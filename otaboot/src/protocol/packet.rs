//! Wire packet codec.
//!
//! Frame layout (all multi-byte fields little-endian):
//!
//! ```text
//! +-----+------+----------+-------------------+---------+---------+
//! | SOF | type | data_len | payload           | crc     | CR LF   |
//! | 1B  | 1B   | 2B       | data_len bytes    | 4B      | 2B      |
//! +-----+------+----------+-------------------+---------+---------+
//! ```
//!
//! Decoding validates every length before a field is read and produces a
//! tagged [`Packet`] borrowing the payload from the frame buffer.

use {
    super::crc::{BLOCK_SIZE, checksum, padded_block_checksum},
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian},
};

/// Start-of-frame marker (`'$'`).
pub const SOF: u8 = 0x24;
/// First terminator byte.
pub const CR: u8 = 0x0D;
/// Second terminator byte.
pub const LF: u8 = 0x0A;

/// SOF, type and length bytes.
pub const PREAMBLE_LEN: usize = 4;
/// Size of the frame CRC field.
pub const CRC_LEN: usize = 4;
/// Size of the CR LF terminator.
pub const TERMINATOR_LEN: usize = 2;
/// Fixed bytes around the payload.
pub const FRAME_OVERHEAD: usize = PREAMBLE_LEN + CRC_LEN + TERMINATOR_LEN;
/// Largest Data payload.
pub const DATA_MAX_SIZE: usize = 256;
/// Largest frame on the wire.
pub const PACKET_MAX_SIZE: usize = DATA_MAX_SIZE + FRAME_OVERHEAD;

/// Header metadata payload size.
pub const META_INFO_LEN: usize = 16;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Single command byte.
    Command = 0,
    /// Raw image bytes.
    Data = 1,
    /// Image metadata.
    Header = 2,
    /// CRC announcement for the next page.
    BulkHeader = 3,
    /// Binary ACK/NACK.
    Response = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Command),
            1 => Ok(Self::Data),
            2 => Ok(Self::Header),
            3 => Ok(Self::BulkHeader),
            4 => Ok(Self::Response),
            other => Err(Error::UnknownPacketType(other)),
        }
    }
}

/// Command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Begin an update session.
    Start = 0,
    /// All data sent, verify the image.
    End = 1,
    /// Discard the current transfer.
    Abort = 2,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Start),
            1 => Ok(Self::End),
            2 => Ok(Self::Abort),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// Binary response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Accepted.
    Ack = 0,
    /// Rejected.
    Nack = 1,
}

/// Image metadata carried by a Header packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetaInfo {
    /// Image size in bytes.
    pub package_size: u32,
    /// CRC of the whole image.
    pub package_crc: u32,
    /// Reserved, sent as zero.
    pub reserved: [u32; 2],
}

impl MetaInfo {
    /// Metadata for an image of `size` bytes with checksum `crc`.
    pub const fn new(size: u32, crc: u32) -> Self {
        Self {
            package_size: size,
            package_crc: crc,
            reserved: [0; 2],
        }
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            package_size: LittleEndian::read_u32(&buf[0..4]),
            package_crc: LittleEndian::read_u32(&buf[4..8]),
            reserved: [
                LittleEndian::read_u32(&buf[8..12]),
                LittleEndian::read_u32(&buf[12..16]),
            ],
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.package_size);
        LittleEndian::write_u32(&mut buf[4..8], self.package_crc);
        LittleEndian::write_u32(&mut buf[8..12], self.reserved[0]);
        LittleEndian::write_u32(&mut buf[12..16], self.reserved[1]);
    }
}

/// Decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Command packet.
    Command(Command),
    /// Image bytes.
    Data(&'a [u8]),
    /// Image metadata.
    Header(MetaInfo),
    /// CRC the next page must satisfy.
    BulkHeader {
        /// Announced page CRC.
        bulk_crc: u32,
    },
    /// Binary response.
    Response(Status),
}

impl Packet<'_> {
    /// Wire type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Command(_) => PacketType::Command,
            Self::Data(_) => PacketType::Data,
            Self::Header(_) => PacketType::Header,
            Self::BulkHeader { .. } => PacketType::BulkHeader,
            Self::Response(_) => PacketType::Response,
        }
    }

    /// Payload length on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Command(_) | Self::Response(_) => 1,
            Self::Data(data) => data.len(),
            Self::Header(_) => META_INFO_LEN,
            Self::BulkHeader { .. } => 4,
        }
    }

    /// Total encoded frame length.
    pub fn frame_len(&self) -> usize {
        self.payload_len() + FRAME_OVERHEAD
    }

    /// Encode into `buf`, returning the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let payload_len = self.payload_len();
        if let Self::Data(data) = self {
            check_data_len(data.len())?;
        }
        let total = payload_len + FRAME_OVERHEAD;
        if buf.len() < total {
            return Err(Error::MalformedPacket("output buffer too small"));
        }

        buf[0] = SOF;
        buf[1] = self.packet_type() as u8;
        LittleEndian::write_u16(&mut buf[2..4], payload_len as u16);

        let payload = &mut buf[PREAMBLE_LEN..PREAMBLE_LEN + payload_len];
        match self {
            Self::Command(command) => payload[0] = *command as u8,
            Self::Response(status) => payload[0] = *status as u8,
            Self::Data(data) => payload.copy_from_slice(data),
            Self::Header(meta) => meta.encode(payload),
            Self::BulkHeader { bulk_crc } => LittleEndian::write_u32(payload, *bulk_crc),
        }

        let crc = frame_crc(self.packet_type(), payload);
        let crc_at = PREAMBLE_LEN + payload_len;
        LittleEndian::write_u32(&mut buf[crc_at..crc_at + CRC_LEN], crc);
        buf[total - 2] = CR;
        buf[total - 1] = LF;
        Ok(total)
    }

    /// Encode into a freshly allocated frame.
    #[cfg(feature = "std")]
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        use {byteorder::WriteBytesExt, std::io::Write};

        let mut payload = [0u8; META_INFO_LEN];
        let payload: &[u8] = match self {
            Self::Data(data) => {
                check_data_len(data.len())?;
                *data
            }
            Self::Command(command) => {
                payload[0] = *command as u8;
                &payload[..1]
            }
            Self::Response(status) => {
                payload[0] = *status as u8;
                &payload[..1]
            }
            Self::Header(meta) => {
                meta.encode(&mut payload);
                &payload[..]
            }
            Self::BulkHeader { bulk_crc } => {
                LittleEndian::write_u32(&mut payload[..4], *bulk_crc);
                &payload[..4]
            }
        };

        let mut frame = Vec::with_capacity(self.frame_len());
        frame.write_u8(SOF)?;
        frame.write_u8(self.packet_type() as u8)?;
        frame.write_u16::<LittleEndian>(payload.len() as u16)?;
        frame.write_all(payload)?;
        frame.write_u32::<LittleEndian>(frame_crc(self.packet_type(), payload))?;
        frame.write_all(&[CR, LF])?;
        Ok(frame)
    }
}

/// A decoded frame: the packet plus the CRC it carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Decoded packet.
    pub packet: Packet<'a>,
    /// CRC field as received.
    pub crc: u32,
    payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decode a complete frame.
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(Error::MalformedPacket("frame shorter than overhead"));
        }
        if buf[0] != SOF {
            return Err(Error::MalformedPacket("missing start of frame"));
        }
        let packet_type = PacketType::try_from(buf[1])?;
        let payload_len = LittleEndian::read_u16(&buf[2..4]) as usize;
        if payload_len + FRAME_OVERHEAD != buf.len() {
            return Err(Error::MalformedPacket("length field disagrees with frame size"));
        }
        if buf[buf.len() - 2..] != [CR, LF] {
            return Err(Error::MalformedPacket("missing CR LF terminator"));
        }

        let payload = &buf[PREAMBLE_LEN..PREAMBLE_LEN + payload_len];
        let crc_at = PREAMBLE_LEN + payload_len;
        let crc = LittleEndian::read_u32(&buf[crc_at..crc_at + CRC_LEN]);

        let packet = match packet_type {
            PacketType::Command => {
                expect_len(payload, 1)?;
                Packet::Command(Command::try_from(payload[0])?)
            },
            PacketType::Response => {
                expect_len(payload, 1)?;
                match payload[0] {
                    0 => Packet::Response(Status::Ack),
                    1 => Packet::Response(Status::Nack),
                    _ => return Err(Error::MalformedPacket("unknown response status")),
                }
            },
            PacketType::Header => {
                expect_len(payload, META_INFO_LEN)?;
                Packet::Header(MetaInfo::decode(payload))
            },
            PacketType::BulkHeader => {
                expect_len(payload, 4)?;
                Packet::BulkHeader {
                    bulk_crc: LittleEndian::read_u32(payload),
                }
            },
            PacketType::Data => {
                check_data_len(payload.len())?;
                Packet::Data(payload)
            },
        };

        Ok(Self {
            packet,
            crc,
            payload,
        })
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Check the carried CRC against the payload.
    pub fn verify_crc(&self) -> Result<()> {
        let computed = frame_crc(
            self.packet
                .packet_type(),
            self.payload,
        );
        if computed == self.crc {
            Ok(())
        } else {
            Err(Error::FrameCrcMismatch {
                carried: self.crc,
                computed,
            })
        }
    }
}

/// CRC carried in a frame of type `packet_type` with `payload`.
///
/// Control payloads are checksummed as a zero-padded four-word block, Data
/// payloads as a plain byte span.
pub fn frame_crc(packet_type: PacketType, payload: &[u8]) -> u32 {
    match packet_type {
        PacketType::Data => checksum(payload),
        _ if payload.len() <= BLOCK_SIZE => padded_block_checksum(payload),
        _ => checksum(payload),
    }
}

fn expect_len(payload: &[u8], len: usize) -> Result<()> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(Error::MalformedPacket("payload length does not match packet type"))
    }
}

fn check_data_len(len: usize) -> Result<()> {
    match len {
        0 => Err(Error::MalformedPacket("empty data packet")),
        1..=DATA_MAX_SIZE => Ok(()),
        _ => Err(Error::MalformedPacket("data payload exceeds maximum size")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &Packet<'_>) -> ([u8; PACKET_MAX_SIZE], usize) {
        let mut buf = [0u8; PACKET_MAX_SIZE];
        let len = packet.encode(&mut buf).unwrap();
        (buf, len)
    }

    #[test]
    fn test_command_frame_layout() {
        let (buf, len) = encode(&Packet::Command(Command::End));
        assert_eq!(len, 11);
        assert_eq!(&buf[..5], &[SOF, 0x00, 0x01, 0x00, 0x01]);
        assert_eq!(&buf[9..11], &[CR, LF]);
    }

    #[test]
    fn test_header_frame_layout() {
        let meta = MetaInfo::new(0x0000_0800, 0x1234_5678);
        let (buf, len) = encode(&Packet::Header(meta));
        assert_eq!(len, 26);
        assert_eq!(&buf[..4], &[SOF, 0x02, 0x10, 0x00]);
        assert_eq!(&buf[4..8], &[0x00, 0x08, 0x00, 0x00]);
        assert_eq!(&buf[8..12], &[0x78, 0x56, 0x34, 0x12]);

        let frame = Frame::decode(&buf[..len]).unwrap();
        assert_eq!(frame.packet, Packet::Header(meta));
        frame.verify_crc().unwrap();
    }

    #[test]
    fn test_data_frame_decodes_borrowed_payload() {
        let data = [0xA5u8; 256];
        let (buf, len) = encode(&Packet::Data(&data));
        assert_eq!(len, PACKET_MAX_SIZE);

        let frame = Frame::decode(&buf[..len]).unwrap();
        assert_eq!(frame.packet, Packet::Data(&data[..]));
        assert_eq!(frame.crc, checksum(&data));
    }

    #[test]
    fn test_bulk_header_crc_matches_padded_block() {
        let (buf, len) = encode(&Packet::BulkHeader { bulk_crc: 0xCAFE_F00D });
        let frame = Frame::decode(&buf[..len]).unwrap();
        let mut block = [0u8; 16];
        block[..4].copy_from_slice(&0xCAFE_F00Du32.to_le_bytes());
        assert_eq!(frame.crc, crate::protocol::crc::block_checksum(&block));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let (mut buf, len) = encode(&Packet::Command(Command::Start));
        buf[1] = 9;
        assert!(matches!(
            Frame::decode(&buf[..len]),
            Err(Error::UnknownPacketType(9))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let (mut buf, len) = encode(&Packet::Command(Command::Start));
        buf[4] = 7;
        assert!(matches!(
            Frame::decode(&buf[..len]),
            Err(Error::UnknownCommand(7))
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let (buf, len) = encode(&Packet::BulkHeader { bulk_crc: 1 });
        assert!(matches!(
            Frame::decode(&buf[..len - 1]),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_payload_size_for_type() {
        // A header frame that only carries 4 bytes of metadata.
        let (mut buf, len) = encode(&Packet::BulkHeader { bulk_crc: 1 });
        buf[1] = PacketType::Header as u8;
        assert!(matches!(
            Frame::decode(&buf[..len]),
            Err(Error::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_terminator() {
        let (mut buf, len) = encode(&Packet::Command(Command::Abort));
        buf[len - 1] = 0x00;
        assert!(Frame::decode(&buf[..len]).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_data() {
        let data = [0u8; DATA_MAX_SIZE + 1];
        let mut buf = [0u8; PACKET_MAX_SIZE + 1];
        assert!(Packet::Data(&data).encode(&mut buf).is_err());
        assert!(Packet::Data(&[]).encode(&mut buf).is_err());
    }

    #[test]
    fn test_verify_crc_detects_corruption() {
        let data = [1u8, 2, 3, 4, 5];
        let (mut buf, len) = encode(&Packet::Data(&data));
        buf[5] ^= 0xFF;
        let frame = Frame::decode(&buf[..len]).unwrap();
        assert!(matches!(
            frame.verify_crc(),
            Err(Error::FrameCrcMismatch { .. })
        ));
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_to_vec_matches_in_place_encoding() {
        let data = [0x5Au8; 100];
        let packets = [
            Packet::Command(Command::Start),
            Packet::Response(Status::Nack),
            Packet::Header(MetaInfo::new(5000, 0xDEAD_BEEF)),
            Packet::BulkHeader { bulk_crc: 0x0102_0304 },
            Packet::Data(&data),
        ];
        for packet in packets {
            let (buf, len) = encode(&packet);
            assert_eq!(packet.to_vec().unwrap(), &buf[..len], "{packet:?}");
        }
        assert!(Packet::Data(&[]).to_vec().is_err());
    }
}
