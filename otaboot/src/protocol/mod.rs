//! Wire protocol: frame layout, checksums, byte framer and response lines.

pub mod crc;
pub mod framer;
pub mod packet;
pub mod response;

pub use {
    crc::{checksum, region_checksum},
    framer::{ByteReceiver, FrameError, FrameEvent, Framer, FramerStats},
    packet::{Command, Frame, MetaInfo, Packet, PacketType, Status},
    response::Response,
};
