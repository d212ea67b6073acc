//! OTA protocol state machine.
//!
//! ```text
//!            Header             BulkHeader              Data (page done)
//!   Idle ──────────► Header ──► BulkHeader ──────► Data ────────────────┐
//!    ▲    (erase slot)              ▲                │ Data (more)      │
//!    │                              │                └──► Data          │
//!    │                              └───────────── BulkHeader ◄─────────┤
//!    │        END command                                               │
//!    └──────────────────── End ◄──────────────── received >= total ◄────┘
//! ```
//!
//! The engine owns every piece of transfer state. It is driven one frame at
//! a time by the update routine and answers each frame with response lines
//! through a [`Transmitter`]. Any rejected frame is answered with `NACK`.
//! A BulkHeader that arrives while a page is still being received restarts
//! that page, which is how the sender recovers from a rejected last chunk.
//!
//! When the image is staged straight into the application slot, the
//! Header first marks the record as "update requested" (`flag_update`
//! with size 0). A reset at any point before the routine records the
//! verified image then keeps the device in the bootloader instead of
//! jumping into a half-written slot.

use {
    crate::{
        error::{Error, Result},
        flash::{FlashLayout, FlashMemory, StagingMode, erase_pages},
        protocol::{
            crc::region_checksum,
            packet::{Command, Frame, MetaInfo, Packet},
            response::Response,
        },
        record::{RecordStore, RecordUpdate},
        routine::Transmitter,
        writer::{PageWriter, WriteOutcome},
    },
    log::{debug, info, trace, warn},
};

/// Protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OtaState {
    /// Waiting for a Header.
    #[default]
    Idle,
    /// Header accepted, staging slot about to be erased.
    Header,
    /// Waiting for the CRC of the next page.
    BulkHeader,
    /// Receiving the bytes of a page.
    Data,
    /// Every byte received, waiting for END.
    End,
}

/// Counters of the transfer in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareTransfer {
    /// Size announced in the Header.
    pub total_size: u32,
    /// Whole-image CRC announced in the Header.
    pub expected_crc: u32,
    /// Bytes kept so far.
    pub received_size: u32,
    /// CRC announced for the page being received.
    pub bulk_crc: u32,
}

/// A verified image, ready to be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageInfo {
    /// Image size in bytes.
    pub size: u32,
    /// Whole-image CRC.
    pub crc: u32,
}

/// What a processed frame led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Frame accepted, transfer continues.
    Accepted,
    /// A page was verified and programmed.
    PageCommitted {
        /// Address of the programmed page.
        address: u32,
    },
    /// END verified the whole image.
    Verified(ImageInfo),
    /// ABORT discarded the transfer.
    Aborted,
}

/// Engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Flash regions.
    pub layout: FlashLayout,
    /// Reject frames whose CRC field does not match their payload.
    pub verify_frame_crc: bool,
}

impl EngineConfig {
    /// Use `layout`.
    #[must_use]
    pub fn with_layout(mut self, layout: FlashLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Enable or disable frame CRC checks.
    #[must_use]
    pub fn with_frame_crc_check(mut self, enabled: bool) -> Self {
        self.verify_frame_crc = enabled;
        self
    }
}

/// The update engine.
pub struct OtaEngine {
    state: OtaState,
    transfer: FirmwareTransfer,
    writer: PageWriter,
    store: RecordStore,
    config: EngineConfig,
}

fn reply<T: Transmitter + ?Sized>(tx: &mut T, response: Response) -> Result<()> {
    trace!("-> {response}");
    tx.transmit(response.as_line())
}

impl OtaEngine {
    /// Create an engine in `Idle`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .layout
            .validate()?;
        Ok(Self {
            state: OtaState::Idle,
            transfer: FirmwareTransfer::default(),
            writer: PageWriter::new(
                config
                    .layout
                    .staging_address(),
            ),
            store: RecordStore::new(
                config
                    .layout
                    .record_address,
            ),
            config,
        })
    }

    /// Current state.
    pub fn state(&self) -> OtaState {
        self.state
    }

    /// Transfer counters.
    pub fn transfer(&self) -> &FirmwareTransfer {
        &self.transfer
    }

    /// Settings in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Record store at the layout's record page.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Discard the transfer and return to `Idle`.
    pub fn reset(&mut self) {
        self.state = OtaState::Idle;
        self.transfer = FirmwareTransfer::default();
        self.writer
            .reset(
                self.config
                    .layout
                    .staging_address(),
            );
    }

    /// Process one complete frame and answer it.
    ///
    /// A rejected frame is answered with `NACK` and its error returned. The
    /// state afterwards depends on the error: a page CRC mismatch waits for
    /// the page to be resent, a storage failure or image CRC mismatch
    /// returns to `Idle`, anything else leaves the state as it was.
    pub fn process<F, T>(&mut self, frame: &[u8], flash: &mut F, tx: &mut T) -> Result<Step>
    where
        F: FlashMemory + ?Sized,
        T: Transmitter + ?Sized,
    {
        match self.handle(frame, flash, tx) {
            Ok(step) => Ok(step),
            Err(Error::Transport) => Err(Error::Transport),
            Err(error) => {
                warn!("Rejected frame in state {:?}: {error}", self.state);
                self.recover(&error);
                reply(tx, Response::Nack)?;
                Err(error)
            },
        }
    }

    fn recover(&mut self, error: &Error) {
        match error {
            Error::PageCrcMismatch { .. } => self.state = OtaState::BulkHeader,
            Error::ImageCrcMismatch { .. } => self.reset(),
            e if e.is_storage() => self.reset(),
            _ => {},
        }
    }

    fn handle<F, T>(&mut self, frame: &[u8], flash: &mut F, tx: &mut T) -> Result<Step>
    where
        F: FlashMemory + ?Sized,
        T: Transmitter + ?Sized,
    {
        let frame = Frame::decode(frame)?;
        if self
            .config
            .verify_frame_crc
        {
            frame.verify_crc()?;
        }

        match (self.state, frame.packet) {
            (_, Packet::Command(Command::Abort)) => {
                info!("Transfer aborted in state {:?}", self.state);
                self.reset();
                reply(tx, Response::Ack)?;
                Ok(Step::Aborted)
            },
            (OtaState::Idle, Packet::Command(Command::Start)) => {
                debug!("START received");
                reply(tx, Response::Ack)?;
                Ok(Step::Accepted)
            },
            (OtaState::Idle, Packet::Header(meta)) => {
                self.accept_header(&meta, &*flash)?;
                self.begin_transfer(&meta, flash, tx)
            },
            (OtaState::Header, Packet::Header(meta)) => self.begin_transfer(&meta, flash, tx),
            (OtaState::BulkHeader, Packet::BulkHeader { bulk_crc }) => {
                self.accept_bulk_header(bulk_crc, tx)
            },
            (OtaState::Data, Packet::BulkHeader { bulk_crc }) => {
                let dropped = self
                    .writer
                    .discard_page(&mut self.transfer);
                info!("Page restarted by the sender, {dropped} buffered bytes dropped");
                self.accept_bulk_header(bulk_crc, tx)
            },
            (OtaState::Data, Packet::Data(payload)) => self.receive_data(payload, flash, tx),
            (OtaState::End, Packet::Command(Command::End)) => self.verify_image(&*flash, tx),
            (state, packet) => Err(Error::UnexpectedPacket {
                state,
                packet: packet.packet_type(),
            }),
        }
    }

    fn transition(&mut self, next: OtaState) {
        if self.state != next {
            debug!("{:?} -> {next:?}", self.state);
        }
        self.state = next;
    }

    /// Idle-state checks on a Header.
    fn accept_header<F: FlashMemory + ?Sized>(&mut self, meta: &MetaInfo, flash: &F) -> Result<()> {
        if self
            .store
            .read(flash)?
            .flag_block_updates
        {
            return Err(Error::UpdatesBlocked);
        }
        let max = self
            .config
            .layout
            .max_image_size();
        if meta.package_size == 0 || meta.package_size > max {
            return Err(Error::InvalidImageSize {
                size: meta.package_size,
                max,
            });
        }
        self.transfer = FirmwareTransfer::default();
        self.transition(OtaState::Header);
        Ok(())
    }

    fn begin_transfer<F, T>(&mut self, meta: &MetaInfo, flash: &mut F, tx: &mut T) -> Result<Step>
    where
        F: FlashMemory + ?Sized,
        T: Transmitter + ?Sized,
    {
        let layout = self
            .config
            .layout;
        let staging = layout.staging_address();
        self.transfer
            .total_size = meta.package_size;
        self.transfer
            .expected_crc = meta.package_crc;

        info!(
            "Receiving {} byte image (crc {:#010x}), erasing {} pages at {staging:#010x}",
            meta.package_size,
            meta.package_crc,
            layout.slot_pages()
        );
        if layout.staging == StagingMode::Direct {
            self.mark_in_progress(flash)?;
        }
        erase_pages(flash, staging, layout.slot_pages())?;

        self.writer
            .reset(staging);
        self.transition(OtaState::BulkHeader);
        reply(tx, Response::HeaderOk)?;
        Ok(Step::Accepted)
    }

    /// Record that slot A no longer holds a bootable image.
    fn mark_in_progress<F: FlashMemory + ?Sized>(&self, flash: &mut F) -> Result<()> {
        if let Some(record) = self.store.load(&*flash)? {
            if record.flag_update && record.fw_received_size == 0 {
                return Ok(());
            }
        }
        debug!("Marking the update record as in progress");
        self.store.set_flags(
            flash,
            &RecordUpdate::new()
                .update(true)
                .received_size(0)
                .crc(0)
                .swap_progress(None),
        )?;
        Ok(())
    }

    fn accept_bulk_header<T: Transmitter + ?Sized>(&mut self, bulk_crc: u32, tx: &mut T) -> Result<Step> {
        self.transfer
            .bulk_crc = bulk_crc;
        self.transition(OtaState::Data);
        reply(tx, Response::BulkOk)?;
        Ok(Step::Accepted)
    }

    /// Every Data packet the writer takes is answered with `DATA_OK`; a
    /// flushed page adds the `ACK`/`NACK` verdict on its CRC.
    fn receive_data<F, T>(&mut self, payload: &[u8], flash: &mut F, tx: &mut T) -> Result<Step>
    where
        F: FlashMemory + ?Sized,
        T: Transmitter + ?Sized,
    {
        let outcome = match self
            .writer
            .process_data(payload, &mut self.transfer, flash)
        {
            Err(error @ Error::PageCrcMismatch { .. }) => {
                reply(tx, Response::DataOk)?;
                return Err(error);
            },
            result => result?,
        };
        match outcome {
            WriteOutcome::Buffered { .. } => {
                reply(tx, Response::DataOk)?;
                Ok(Step::Accepted)
            },
            WriteOutcome::Committed { address, .. } => {
                if self
                    .transfer
                    .received_size
                    >= self
                        .transfer
                        .total_size
                {
                    self.writer
                        .reset(
                            self.config
                                .layout
                                .staging_address(),
                        );
                    self.transition(OtaState::End);
                } else {
                    self.transition(OtaState::BulkHeader);
                }
                reply(tx, Response::DataOk)?;
                reply(tx, Response::Ack)?;
                Ok(Step::PageCommitted { address })
            },
        }
    }

    fn verify_image<F, T>(&mut self, flash: &F, tx: &mut T) -> Result<Step>
    where
        F: FlashMemory + ?Sized,
        T: Transmitter + ?Sized,
    {
        let FirmwareTransfer {
            total_size,
            expected_crc,
            ..
        } = self.transfer;
        let actual = region_checksum(
            flash,
            self.config
                .layout
                .staging_address(),
            total_size,
        )?;
        self.reset();

        if actual != expected_crc {
            return Err(Error::ImageCrcMismatch {
                expected: expected_crc,
                actual,
            });
        }

        info!("Image verified: {total_size} bytes, crc {actual:#010x}");
        reply(tx, Response::Ack)?;
        Ok(Step::Verified(ImageInfo {
            size: total_size,
            crc: actual,
        }))
    }
}

impl core::fmt::Debug for OtaEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OtaEngine")
            .field("state", &self.state)
            .field("transfer", &self.transfer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
