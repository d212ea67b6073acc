//! Update routine: the task-context loop around the engine.
//!
//! The routine takes frames from the [`PacketQueue`], feeds them to the
//! [`OtaEngine`] and, once an image is verified, records it and resets the
//! device so the boot path can act on the new record.

use {
    crate::{
        engine::{EngineConfig, ImageInfo, OtaEngine, OtaState, Step},
        error::{Error, Result},
        flash::FlashMemory,
        protocol::response::Response,
        queue::PacketQueue,
        record::{RecordStore, RecordUpdate},
    },
    log::{debug, info, warn},
};

/// Sends response bytes back over the link.
pub trait Transmitter {
    /// Transmit `bytes` completely.
    fn transmit(&mut self, bytes: &[u8]) -> Result<()>;
}

impl<T: Transmitter + ?Sized> Transmitter for &mut T {
    fn transmit(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).transmit(bytes)
    }
}

#[cfg(feature = "std")]
impl Transmitter for Vec<u8> {
    fn transmit(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Delay and reset hooks of the target.
pub trait SystemControl {
    /// Busy-wait or sleep for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);

    /// Reset the whole system.
    ///
    /// On hardware this does not return. Simulations record the request
    /// and return.
    fn system_reset(&mut self);
}

/// Routine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoutineConfig {
    /// Time given to the last response to leave the wire before reset.
    pub reset_delay_ms: u32,
}

impl Default for RoutineConfig {
    fn default() -> Self {
        Self {
            reset_delay_ms: 2000,
        }
    }
}

impl RoutineConfig {
    /// Use `ms` as the pre-reset delay.
    #[must_use]
    pub fn with_reset_delay(mut self, ms: u32) -> Self {
        self.reset_delay_ms = ms;
        self
    }
}

/// Result of one [`UpdateRoutine::poll`].
#[derive(Debug)]
pub enum RoutineEvent {
    /// No frame was waiting.
    NoFrame,
    /// A frame was accepted.
    Step(Step),
    /// A frame was answered with NACK.
    Rejected(Error),
    /// The image was recorded and the system reset requested.
    Reset(ImageInfo),
}

/// The update task.
pub struct UpdateRoutine<F, T, S> {
    engine: OtaEngine,
    flash: F,
    tx: T,
    system: S,
    config: RoutineConfig,
}

impl<F, T, S> UpdateRoutine<F, T, S>
where
    F: FlashMemory,
    T: Transmitter,
    S: SystemControl,
{
    /// Create a routine with an engine in `Idle`.
    pub fn new(
        engine_config: EngineConfig,
        config: RoutineConfig,
        flash: F,
        tx: T,
        system: S,
    ) -> Result<Self> {
        Ok(Self {
            engine: OtaEngine::new(engine_config)?,
            flash,
            tx,
            system,
            config,
        })
    }

    /// The engine.
    pub fn engine(&self) -> &OtaEngine {
        &self.engine
    }

    /// Current protocol state.
    pub fn state(&self) -> OtaState {
        self.engine
            .state()
    }

    /// The flash.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Mutable access to the flash.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// The transmitter.
    pub fn transmitter(&self) -> &T {
        &self.tx
    }

    /// Mutable access to the transmitter.
    pub fn transmitter_mut(&mut self) -> &mut T {
        &mut self.tx
    }

    /// The system hooks.
    pub fn system(&self) -> &S {
        &self.system
    }

    /// Take the parts back.
    pub fn into_parts(self) -> (F, T, S) {
        (self.flash, self.tx, self.system)
    }

    /// Process at most one waiting frame.
    ///
    /// Rejected frames are already answered with NACK and come back as
    /// [`RoutineEvent::Rejected`]. Only transmit and record failures are
    /// returned as errors.
    pub fn poll<const N: usize>(&mut self, queue: &PacketQueue<N>) -> Result<RoutineEvent> {
        let Some(frame) = queue.receive() else {
            return Ok(RoutineEvent::NoFrame);
        };
        let result = self
            .engine
            .process(&frame, &mut self.flash, &mut self.tx);
        drop(frame);

        match result {
            Ok(Step::Verified(image)) => {
                self.finish(queue, image)?;
                Ok(RoutineEvent::Reset(image))
            },
            Ok(step) => Ok(RoutineEvent::Step(step)),
            Err(Error::Transport) => Err(Error::Transport),
            Err(error) => Ok(RoutineEvent::Rejected(error)),
        }
    }

    fn finish<const N: usize>(&mut self, queue: &PacketQueue<N>, image: ImageInfo) -> Result<()> {
        let dropped = queue.drain();
        if dropped > 0 {
            warn!("Discarded {dropped} frames received after END");
        }

        let update = RecordUpdate::new()
            .update(true)
            .block_updates(false)
            .received_size(image.size)
            .crc(image.crc);
        self.engine
            .store()
            .set_flags(&mut self.flash, &update)?;
        info!(
            "Update recorded ({} bytes, crc {:#010x}), resetting in {} ms",
            image.size, image.crc, self.config.reset_delay_ms
        );

        self.system
            .delay_ms(
                self.config
                    .reset_delay_ms,
            );
        self.system
            .system_reset();
        Ok(())
    }
}

/// Application-side answer to START: flag an update and reset into the
/// bootloader.
///
/// The record keeps `flag_update` set with a zero size, which the boot
/// path reads as "update requested, nothing staged yet".
pub fn request_update<F, T, S>(
    store: &RecordStore,
    flash: &mut F,
    tx: &mut T,
    system: &mut S,
    config: &RoutineConfig,
) -> Result<()>
where
    F: FlashMemory + ?Sized,
    T: Transmitter + ?Sized,
    S: SystemControl + ?Sized,
{
    let update = RecordUpdate::new()
        .update(true)
        .received_size(0)
        .crc(0);
    store.set_flags(flash, &update)?;
    debug!("Update requested by application");

    tx.transmit(Response::Ack.as_line())?;
    system.delay_ms(config.reset_delay_ms);
    system.system_reset();
    Ok(())
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use {
        super::*,
        crate::{
            boot::{BootAction, decide_boot},
            flash::{APP_A_ADDRESS, FlashLayout, PAGE_SIZE},
            protocol::{
                crc::checksum,
                packet::{Command, MetaInfo, Packet},
            },
            record::UpdateRecord,
            sim::SimFlash,
        },
    };

    #[derive(Default)]
    struct Clock {
        delays: Vec<u32>,
        resets: usize,
    }

    impl SystemControl for Clock {
        fn delay_ms(&mut self, ms: u32) {
            self.delays
                .push(ms);
        }

        fn system_reset(&mut self) {
            self.resets += 1;
        }
    }

    type Routine = UpdateRoutine<SimFlash, Vec<u8>, Clock>;

    fn routine() -> Routine {
        UpdateRoutine::new(
            EngineConfig::default(),
            RoutineConfig::default(),
            SimFlash::target(),
            Vec::new(),
            Clock::default(),
        )
        .unwrap()
    }

    fn deliver(routine: &mut Routine, queue: &PacketQueue<4>, packet: Packet<'_>) -> RoutineEvent {
        assert!(queue.publish(&packet.to_vec().unwrap()));
        routine
            .poll(queue)
            .unwrap()
    }

    fn upload(routine: &mut Routine, data: &[u8], image_crc: u32) -> RoutineEvent {
        let queue = PacketQueue::<4>::new();
        deliver(
            routine,
            &queue,
            Packet::Header(MetaInfo::new(data.len() as u32, image_crc)),
        );
        for page in data.chunks(PAGE_SIZE) {
            deliver(
                routine,
                &queue,
                Packet::BulkHeader {
                    bulk_crc: checksum(page),
                },
            );
            for chunk in page.chunks(256) {
                deliver(routine, &queue, Packet::Data(chunk));
            }
        }
        deliver(routine, &queue, Packet::Command(Command::End))
    }

    fn responses(routine: &Routine) -> Vec<String> {
        String::from_utf8_lossy(routine.transmitter())
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_one_page_image_is_recorded_and_reset() {
        let data: Vec<u8> = (0..PAGE_SIZE)
            .map(|i| (i * 3) as u8)
            .collect();
        let crc = checksum(&data);
        let mut routine = routine();

        let event = upload(&mut routine, &data, crc);
        assert!(matches!(event, RoutineEvent::Reset(ImageInfo { size: 2048, .. })));

        let mut expected = vec!["HEADER_OK", "BULK_OK"];
        expected.extend(["DATA_OK"; 8]);
        expected.extend(["ACK", "ACK"]);
        assert_eq!(responses(&routine), expected);

        let record = routine
            .engine()
            .store()
            .read(routine.flash())
            .unwrap();
        assert!(record.flag_update);
        assert!(!record.flag_block_updates);
        assert_eq!(record.fw_received_size, 2048);
        assert_eq!(record.fw_crc, crc);

        assert_eq!(routine.system().delays, [2000]);
        assert_eq!(routine.system().resets, 1);
        assert_eq!(routine.state(), OtaState::Idle);
        assert_eq!(routine.flash().slice(APP_A_ADDRESS, PAGE_SIZE), &data[..]);
    }

    #[test]
    fn test_wrong_image_crc_keeps_device_in_bootloader() {
        let data = vec![0x5A; PAGE_SIZE];
        let mut routine = routine();

        let event = upload(&mut routine, &data, checksum(&data) ^ 0x8000_0000);
        assert!(matches!(
            event,
            RoutineEvent::Rejected(Error::ImageCrcMismatch { .. })
        ));
        assert_eq!(
            responses(&routine)
                .last()
                .map(String::as_str),
            Some("NACK")
        );
        assert_eq!(routine.state(), OtaState::Idle);
        assert_eq!(routine.system().resets, 0);

        // Only the in-progress mark from the Header; no image recorded.
        let record = routine
            .engine()
            .store()
            .read(routine.flash())
            .unwrap();
        assert_eq!(
            record,
            UpdateRecord {
                flag_update: true,
                ..UpdateRecord::default()
            }
        );
        assert_eq!(
            decide_boot(routine.flash_mut(), &FlashLayout::single_slot()).unwrap(),
            BootAction::StayInBootloader
        );
    }

    #[test]
    fn test_wrong_image_crc_in_secondary_slot_leaves_record_untouched() {
        let data = vec![0x5A; 100];
        let mut routine = UpdateRoutine::new(
            EngineConfig::default().with_layout(FlashLayout::dual_slot()),
            RoutineConfig::default(),
            SimFlash::target(),
            Vec::new(),
            Clock::default(),
        )
        .unwrap();
        let before = routine
            .engine()
            .store()
            .load(routine.flash())
            .unwrap();

        let event = upload(&mut routine, &data, checksum(&data) ^ 1);
        assert!(matches!(
            event,
            RoutineEvent::Rejected(Error::ImageCrcMismatch { .. })
        ));
        assert_eq!(
            routine
                .engine()
                .store()
                .load(routine.flash())
                .unwrap(),
            before
        );
    }

    #[test]
    fn test_empty_queue_is_a_no_op() {
        let mut routine = routine();
        let queue = PacketQueue::<4>::new();
        assert!(matches!(
            routine
                .poll(&queue)
                .unwrap(),
            RoutineEvent::NoFrame
        ));
        assert!(
            routine
                .transmitter()
                .is_empty()
        );
    }

    #[test]
    fn test_frames_after_end_are_discarded() {
        let data = vec![0x11; 100];
        let crc = checksum(&data);
        let mut routine = routine();
        let queue = PacketQueue::<4>::new();

        deliver(&mut routine, &queue, Packet::Header(MetaInfo::new(100, crc)));
        deliver(&mut routine, &queue, Packet::BulkHeader { bulk_crc: crc });
        deliver(&mut routine, &queue, Packet::Data(&data));

        assert!(queue.publish(&Packet::Command(Command::End).to_vec().unwrap()));
        assert!(queue.publish(&Packet::Command(Command::Start).to_vec().unwrap()));
        let event = routine
            .poll(&queue)
            .unwrap();

        assert!(matches!(event, RoutineEvent::Reset(_)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_request_update_flags_record_and_resets() {
        let mut flash = SimFlash::target();
        let store = RecordStore::new(crate::flash::RECORD_ADDRESS);
        let mut tx = Vec::new();
        let mut clock = Clock::default();

        request_update(&store, &mut flash, &mut tx, &mut clock, &RoutineConfig::default()).unwrap();

        let record = store
            .read(&flash)
            .unwrap();
        assert_eq!(
            record,
            UpdateRecord {
                flag_update: true,
                ..UpdateRecord::default()
            }
        );
        assert_eq!(tx, b"ACK\n");
        assert_eq!(clock.resets, 1);
    }
}
