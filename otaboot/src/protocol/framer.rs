//! Byte-stream framer.
//!
//! Runs in the receive interrupt, one byte per call. Bytes are accumulated
//! until the length field is known, then a countdown covers payload, CRC
//! and terminator. A frame that ends in CR LF is published to the
//! [`PacketQueue`]; anything else is dropped and counted.

use {
    super::packet::{CR, CRC_LEN, LF, PACKET_MAX_SIZE, PREAMBLE_LEN, SOF, TERMINATOR_LEN},
    crate::queue::PacketQueue,
    log::{trace, warn},
};

/// Re-arms the single-byte receive after each byte.
pub trait ByteReceiver {
    /// Request the next byte from the transport.
    fn arm_receive(&mut self);
}

/// Why a frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Byte outside a frame was not a start-of-frame marker.
    NoSof,
    /// Declared length exceeds the largest frame.
    TooLong,
    /// Frame did not end in CR LF.
    BadTerminator,
    /// The queue had no free slot.
    Overrun,
}

/// Outcome of feeding one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// Frame still in progress.
    Pending,
    /// A frame of this many bytes was published.
    Ready(usize),
    /// The current frame was discarded.
    Dropped(FrameError),
}

/// Counters kept by the framer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Frames published.
    pub frames: u32,
    /// Stray bytes skipped while hunting for SOF.
    pub discarded_bytes: u32,
    /// Frames dropped for a bad length or terminator.
    pub framing_errors: u32,
    /// Frames dropped because the consumer had not drained the queue.
    pub overruns: u32,
}

/// Frame reassembly state.
pub struct Framer {
    buf: [u8; PACKET_MAX_SIZE],
    index: usize,
    remaining: usize,
    stats: FramerStats,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Create an idle framer.
    pub const fn new() -> Self {
        Self {
            buf: [0; PACKET_MAX_SIZE],
            index: 0,
            remaining: 0,
            stats: FramerStats {
                frames: 0,
                discarded_bytes: 0,
                framing_errors: 0,
                overruns: 0,
            },
        }
    }

    /// Counters since creation.
    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Whether a frame is partially assembled.
    pub fn in_frame(&self) -> bool {
        self.index > 0
    }

    /// Discard any partial frame.
    pub fn reset(&mut self) {
        self.index = 0;
        self.remaining = 0;
    }

    /// Interrupt entry point: feed `byte`, then re-arm the receiver.
    pub fn on_byte_received<const N: usize, R: ByteReceiver + ?Sized>(
        &mut self,
        byte: u8,
        queue: &PacketQueue<N>,
        rx: &mut R,
    ) -> FrameEvent {
        let event = self.push(byte, queue);
        rx.arm_receive();
        event
    }

    /// Feed one byte.
    pub fn push<const N: usize>(&mut self, byte: u8, queue: &PacketQueue<N>) -> FrameEvent {
        if self.index == 0 && byte != SOF {
            self.stats.discarded_bytes += 1;
            return FrameEvent::Pending;
        }

        self.buf[self.index] = byte;
        self.index += 1;

        if self.index == PREAMBLE_LEN {
            let data_len = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
            let total = PREAMBLE_LEN + data_len + CRC_LEN + TERMINATOR_LEN;
            if total > PACKET_MAX_SIZE {
                warn!("Dropping frame with length {data_len}");
                return self.drop_frame(FrameError::TooLong);
            }
            self.remaining = data_len + CRC_LEN + TERMINATOR_LEN;
            return FrameEvent::Pending;
        }
        if self.index < PREAMBLE_LEN {
            return FrameEvent::Pending;
        }

        self.remaining -= 1;
        if self.remaining > 0 {
            return FrameEvent::Pending;
        }

        let len = self.index;
        if self.buf[len - 2] != CR || self.buf[len - 1] != LF {
            return self.drop_frame(FrameError::BadTerminator);
        }

        self.reset();
        if queue.publish(&self.buf[..len]) {
            self.stats.frames += 1;
            trace!("Frame ready ({len} bytes)");
            FrameEvent::Ready(len)
        } else {
            self.stats.overruns += 1;
            warn!("Frame dropped: receive queue full");
            FrameEvent::Dropped(FrameError::Overrun)
        }
    }

    fn drop_frame(&mut self, error: FrameError) -> FrameEvent {
        self.stats.framing_errors += 1;
        self.reset();
        FrameEvent::Dropped(error)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use {
        super::*,
        crate::protocol::packet::{Command, Packet},
    };

    fn feed<const N: usize>(framer: &mut Framer, queue: &PacketQueue<N>, bytes: &[u8]) -> Vec<FrameEvent> {
        bytes
            .iter()
            .map(|&b| framer.push(b, queue))
            .filter(|e| *e != FrameEvent::Pending)
            .collect()
    }

    /// SOF, type, length, `len` bytes, CRC, CR LF.
    fn raw_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![SOF, 1, len as u8, (len >> 8) as u8];
        frame.extend((0..len).map(|i| i as u8));
        frame.extend([0xAA, 0xBB, 0xCC, 0xDD]);
        frame.extend([CR, LF]);
        frame
    }

    #[test]
    fn test_single_frame_is_published_once() {
        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let frame = raw_frame(5);

        let events = feed(&mut framer, &queue, &frame);
        assert_eq!(events, vec![FrameEvent::Ready(4 + 5 + 4 + 2)]);
        assert_eq!(&*queue.receive().unwrap(), &frame[..]);
        assert!(!framer.in_frame());
    }

    #[test]
    fn test_payload_containing_crlf_is_not_split() {
        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let mut frame = vec![SOF, 1, 4, 0, CR, LF, CR, LF];
        frame.extend([0, 0, 0, 0, CR, LF]);

        let events = feed(&mut framer, &queue, &frame);
        assert_eq!(events, vec![FrameEvent::Ready(frame.len())]);
    }

    #[test]
    fn test_encoded_packet_round_trips_through_framer() {
        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let frame = Packet::Command(Command::End)
            .to_vec()
            .unwrap();

        feed(&mut framer, &queue, &frame);
        let ready = queue.receive().unwrap();
        let decoded = crate::protocol::packet::Frame::decode(&ready).unwrap();
        assert_eq!(decoded.packet, Packet::Command(Command::End));
    }

    #[test]
    fn test_back_to_back_without_draining_drops_second() {
        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let first = raw_frame(3);
        let mut second = raw_frame(3);
        second[4] = 0x55;

        feed(&mut framer, &queue, &first);
        let events = feed(&mut framer, &queue, &second);
        assert_eq!(events, vec![FrameEvent::Dropped(FrameError::Overrun)]);
        assert_eq!(framer.stats().overruns, 1);

        // The first frame is intact.
        assert_eq!(&*queue.receive().unwrap(), &first[..]);
    }

    #[test]
    fn test_back_to_back_with_spare_slot_keeps_both() {
        let queue = PacketQueue::<3>::new();
        let mut framer = Framer::new();
        let first = raw_frame(3);
        let second = raw_frame(7);

        feed(&mut framer, &queue, &first);
        feed(&mut framer, &queue, &second);
        assert_eq!(&*queue.receive().unwrap(), &first[..]);
        assert_eq!(&*queue.receive().unwrap(), &second[..]);
    }

    #[test]
    fn test_noise_before_sof_is_skipped() {
        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend(raw_frame(2));

        let events = feed(&mut framer, &queue, &bytes);
        assert_eq!(events.len(), 1);
        assert_eq!(framer.stats().discarded_bytes, 3);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let events = feed(&mut framer, &queue, &[SOF, 1, 0x00, 0x02]);
        assert_eq!(events, vec![FrameEvent::Dropped(FrameError::TooLong)]);
        assert!(!framer.in_frame());
    }

    #[test]
    fn test_bad_terminator_is_dropped_and_framer_recovers() {
        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let mut broken = raw_frame(2);
        let end = broken.len() - 1;
        broken[end] = 0x00;

        let events = feed(&mut framer, &queue, &broken);
        assert_eq!(events, vec![FrameEvent::Dropped(FrameError::BadTerminator)]);

        let events = feed(&mut framer, &queue, &raw_frame(2));
        assert_eq!(events, vec![FrameEvent::Ready(12)]);
    }

    #[test]
    fn test_receiver_is_rearmed_every_byte() {
        struct Rx(usize);
        impl ByteReceiver for Rx {
            fn arm_receive(&mut self) {
                self.0 += 1;
            }
        }

        let queue = PacketQueue::<2>::new();
        let mut framer = Framer::new();
        let mut rx = Rx(0);
        let frame = raw_frame(1);
        for &b in &frame {
            framer.on_byte_received(b, &queue, &mut rx);
        }
        assert_eq!(rx.0, frame.len());
    }
}
