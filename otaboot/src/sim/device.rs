//! A bootloader running in-process behind the [`Port`] trait.
//!
//! Bytes written by the host go through the same framer, queue, engine and
//! routine as on the target, against a [`SimFlash`]. Responses are queued
//! for the host to read. A reset requested by the routine re-runs the boot
//! decision on the simulated flash.

use {
    super::SimFlash,
    crate::{
        boot::{BootAction, decide_boot},
        engine::{EngineConfig, OtaState},
        error::Result,
        flash::{FlashLayout, PAGE_SIZE},
        port::Port,
        protocol::{
            framer::{FrameEvent, Framer, FramerStats},
            packet::{PREAMBLE_LEN, PacketType},
            response::Response,
        },
        queue::PacketQueue,
        record::{RecordStore, UpdateRecord},
        routine::{RoutineConfig, RoutineEvent, SystemControl, UpdateRoutine},
    },
    log::{debug, info, warn},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        time::Duration,
    },
};

const QUEUE_SLOTS: usize = 4;

/// Reset and delay hooks that only count.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimSystem {
    /// Resets requested.
    pub resets: u32,
    /// Sum of requested delays.
    pub delayed_ms: u64,
}

impl SystemControl for SimSystem {
    fn delay_ms(&mut self, ms: u32) {
        self.delayed_ms += u64::from(ms);
    }

    fn system_reset(&mut self) {
        self.resets += 1;
    }
}

/// Wire faults the device injects once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Fault {
    /// Flip a bit in the first Data packet of this page.
    CorruptPage(usize),
    /// Flip a bit of the image CRC carried in the Header.
    WrongImageCrc,
}

type Routine = UpdateRoutine<SimFlash, Vec<u8>, SimSystem>;

/// Simulated target.
pub struct SimulatedDevice {
    routine: Routine,
    framer: Framer,
    wire: PacketQueue<QUEUE_SLOTS>,
    queue: PacketQueue<QUEUE_SLOTS>,
    layout: FlashLayout,
    rx: VecDeque<u8>,
    responses: Vec<Response>,
    faults: Vec<Fault>,
    boot_action: BootAction,
    dropped_frames: u32,
    timeout: Duration,
    baud_rate: u32,
}

impl SimulatedDevice {
    /// Power up a blank device with `layout`.
    pub fn new(layout: FlashLayout) -> Result<Self> {
        Self::with_config(EngineConfig::default().with_layout(layout))
    }

    /// Power up a blank device with `config`.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let mut flash = SimFlash::target();
        let boot_action = decide_boot(&mut flash, &config.layout)?;
        info!("Simulated device booted: {boot_action:?}");
        let routine = UpdateRoutine::new(
            config,
            RoutineConfig::default(),
            flash,
            Vec::new(),
            SimSystem::default(),
        )?;
        Ok(Self {
            routine,
            framer: Framer::new(),
            wire: PacketQueue::new(),
            queue: PacketQueue::new(),
            layout: config.layout,
            rx: VecDeque::new(),
            responses: Vec::new(),
            faults: Vec::new(),
            boot_action,
            dropped_frames: 0,
            timeout: Duration::from_millis(100),
            baud_rate: crate::port::DEFAULT_BAUD,
        })
    }

    /// Arm a fault.
    #[must_use]
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults
            .push(fault);
        self
    }

    /// Every response line sent so far.
    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    /// Protocol state.
    pub fn state(&self) -> OtaState {
        self.routine
            .state()
    }

    /// The simulated flash.
    pub fn flash(&self) -> &SimFlash {
        self.routine
            .flash()
    }

    /// Decoded update record.
    pub fn record(&self) -> Result<Option<UpdateRecord>> {
        RecordStore::new(self.layout.record_address).load(self.flash())
    }

    /// Resets the routine requested.
    pub fn resets(&self) -> u32 {
        self.routine
            .system()
            .resets
    }

    /// Outcome of the latest boot decision.
    pub fn boot_action(&self) -> BootAction {
        self.boot_action
    }

    /// Frames lost because the receive queue was full.
    pub fn dropped_frames(&self) -> u32 {
        self.dropped_frames
    }

    /// Framer counters.
    pub fn framer_stats(&self) -> FramerStats {
        self.framer
            .stats()
    }

    /// Flash layout in use.
    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    fn receive_byte(&mut self, byte: u8) -> Result<()> {
        if let FrameEvent::Ready(_) = self
            .framer
            .push(byte, &self.wire)
        {
            self.deliver()?;
        }
        Ok(())
    }

    /// Move a framed packet across the faulty line and let the routine run.
    fn deliver(&mut self) -> Result<()> {
        let Some(ready) = self
            .wire
            .receive()
        else {
            return Ok(());
        };
        let mut frame = ready.to_vec();
        drop(ready);
        self.inject_faults(&mut frame);
        if !self
            .queue
            .publish(&frame)
        {
            self.dropped_frames += 1;
            warn!("Receive queue full, frame dropped");
        }

        loop {
            let event = self
                .routine
                .poll(&self.queue)?;
            self.collect_responses();
            match event {
                RoutineEvent::NoFrame => break,
                RoutineEvent::Reset(image) => {
                    debug!("Device reset after image {image:?}");
                    self.reboot()?;
                },
                RoutineEvent::Step(_) | RoutineEvent::Rejected(_) => {},
            }
        }
        Ok(())
    }

    fn inject_faults(&mut self, frame: &mut [u8]) {
        let received = self
            .routine
            .engine()
            .transfer()
            .received_size as usize;
        let kind = frame[1];
        let position = self
            .faults
            .iter()
            .position(|fault| match *fault {
                Fault::CorruptPage(page) => {
                    kind == PacketType::Data as u8 && received / PAGE_SIZE == page
                },
                Fault::WrongImageCrc => kind == PacketType::Header as u8,
            });
        let Some(index) = position else {
            return;
        };

        let fault = self
            .faults
            .remove(index);
        info!("Injecting {fault:?}");
        match fault {
            Fault::CorruptPage(_) => frame[PREAMBLE_LEN] ^= 0x01,
            // package_crc follows the 4-byte package_size
            Fault::WrongImageCrc => frame[PREAMBLE_LEN + 4] ^= 0x01,
        }
    }

    fn collect_responses(&mut self) {
        let out = std::mem::take(
            self.routine
                .transmitter_mut(),
        );
        self.responses
            .extend(
                out.split(|&b| b == b'\n')
                    .filter_map(Response::parse),
            );
        self.rx
            .extend(out);
    }

    fn reboot(&mut self) -> Result<()> {
        self.framer
            .reset();
        self.boot_action = decide_boot(
            self.routine
                .flash_mut(),
            &self.layout,
        )?;
        info!("Simulated device rebooted: {:?}", self.boot_action);
        Ok(())
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self
            .rx
            .is_empty()
        {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
        }
        let n = buf
            .len()
            .min(
                self.rx
                    .len(),
            );
        for (slot, byte) in buf
            .iter_mut()
            .zip(
                self.rx
                    .drain(..n),
            )
        {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.receive_byte(byte)
                .map_err(|e| io::Error::other(e.to_string()))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimulatedDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            flash::APP_A_ADDRESS,
            protocol::{
                crc::checksum,
                packet::{Command, MetaInfo, Packet},
            },
        },
    };

    fn send(device: &mut SimulatedDevice, packet: Packet<'_>) {
        device
            .write_all(&packet.to_vec().unwrap())
            .unwrap();
    }

    fn read_all(device: &mut SimulatedDevice) -> String {
        let mut buf = [0u8; 512];
        let mut out = String::new();
        while let Ok(n) = device.read(&mut buf) {
            out.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        out
    }

    #[test]
    fn test_blank_device_stays_in_bootloader() {
        let device = SimulatedDevice::new(FlashLayout::single_slot()).unwrap();
        assert_eq!(device.boot_action(), BootAction::StayInBootloader);
        assert_eq!(
            device
                .record()
                .unwrap(),
            Some(UpdateRecord::default())
        );
    }

    #[test]
    fn test_upload_reboots_into_application() {
        let data = vec![0x42; 700];
        let crc = checksum(&data);
        let mut device = SimulatedDevice::new(FlashLayout::single_slot()).unwrap();

        send(&mut device, Packet::Command(Command::Start));
        send(&mut device, Packet::Header(MetaInfo::new(700, crc)));
        send(&mut device, Packet::BulkHeader { bulk_crc: crc });
        for chunk in data.chunks(256) {
            send(&mut device, Packet::Data(chunk));
        }
        send(&mut device, Packet::Command(Command::End));

        assert_eq!(
            read_all(&mut device),
            "ACK\nHEADER_OK\nBULK_OK\nDATA_OK\nDATA_OK\nDATA_OK\nACK\nACK\n"
        );
        assert_eq!(device.resets(), 1);
        assert_eq!(device.dropped_frames(), 0);
        assert_eq!(device.boot_action(), BootAction::RunApplication);
        assert_eq!(device.flash().slice(APP_A_ADDRESS, 700), &data[..]);

        // The boot path consumed the update flag.
        let record = device
            .record()
            .unwrap()
            .unwrap();
        assert!(!record.flag_update);
        assert_eq!(record.fw_crc, crc);
    }

    #[test]
    fn test_full_receive_queue_counts_dropped_frame() {
        let mut device = SimulatedDevice::new(FlashLayout::single_slot()).unwrap();
        let start = Packet::Command(Command::Start)
            .to_vec()
            .unwrap();
        let mut backlog = 0;
        while device
            .queue
            .publish(&start)
        {
            backlog += 1;
        }

        send(&mut device, Packet::Header(MetaInfo::new(64, 0)));

        assert_eq!(device.dropped_frames(), 1);
        assert_eq!(device.responses(), vec![Response::Ack; backlog]);
        assert_eq!(device.state(), OtaState::Idle);
    }

    #[test]
    fn test_corrupt_page_fault_hits_once() {
        let data = vec![0x10; 300];
        let crc = checksum(&data);
        let mut device = SimulatedDevice::new(FlashLayout::single_slot())
            .unwrap()
            .with_fault(Fault::CorruptPage(0));

        send(&mut device, Packet::Header(MetaInfo::new(300, crc)));
        for _ in 0..2 {
            send(&mut device, Packet::BulkHeader { bulk_crc: crc });
            for chunk in data.chunks(256) {
                send(&mut device, Packet::Data(chunk));
            }
        }

        assert_eq!(
            device.responses(),
            [
                Response::HeaderOk,
                Response::BulkOk,
                Response::DataOk,
                Response::DataOk,
                Response::Nack,
                Response::BulkOk,
                Response::DataOk,
                Response::DataOk,
                Response::Ack,
            ]
        );
        assert_eq!(device.state(), OtaState::End);
    }

    #[test]
    fn test_wrong_crc_fault_fails_end() {
        let data = vec![0x33; 64];
        let crc = checksum(&data);
        let mut device = SimulatedDevice::new(FlashLayout::single_slot())
            .unwrap()
            .with_fault(Fault::WrongImageCrc);

        send(&mut device, Packet::Header(MetaInfo::new(64, crc)));
        send(&mut device, Packet::BulkHeader { bulk_crc: crc });
        send(&mut device, Packet::Data(&data));
        send(&mut device, Packet::Command(Command::End));

        assert_eq!(device.responses().last(), Some(&Response::Nack));
        assert_eq!(device.resets(), 0);
        assert_eq!(device.state(), OtaState::Idle);
    }

    #[test]
    fn test_read_times_out_when_idle() {
        let mut device = SimulatedDevice::new(FlashLayout::single_slot()).unwrap();
        let err = device
            .read(&mut [0u8; 8])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
