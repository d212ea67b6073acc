//! Host-side uploader.
//!
//! Drives the bootloader through a complete transfer:
//!
//! ```text
//! host                                  bootloader
//!  | -- START ------------------------------> |   (optional)
//!  | <------------------------------- ACK --- |
//!  | -- Header {size, crc} -----------------> |   erase slot
//!  | <------------------------- HEADER_OK --- |
//!  |    for each page:                        |
//!  | -- BulkHeader {page crc} --------------> |
//!  | <--------------------------- BULK_OK --- |
//!  | -- Data (<= 256 B) --------------------> |   x chunks
//!  | <--------------------------- DATA_OK --- |
//!  | <------------------------ ACK | NACK --- |   after the last chunk
//!  | -- END --------------------------------> |   verify image
//!  | <------------------------ ACK | NACK --- |
//! ```
//!
//! A NACK after the last chunk of a page means the page was not kept,
//! either because its CRC failed (`DATA_OK` then `NACK`) or because the
//! chunk itself was rejected (`NACK` alone). Both resend the page from its
//! BulkHeader, which the bootloader takes as a page restart. A NACK on any
//! other chunk resends that chunk.

use {
    crate::{
        error::{Error, Result},
        image::{FirmwareImage, Page},
        port::Port,
        protocol::{
            packet::{Command, MetaInfo, Packet},
            response::Response,
        },
    },
    log::{debug, info, trace, warn},
    std::{
        io::ErrorKind,
        time::{Duration, Instant},
    },
};

/// Sender settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Wait for each response line.
    pub response_timeout: Duration,
    /// Wait for `HEADER_OK`, which follows the slot erase.
    pub erase_timeout: Duration,
    /// Wait for the `ACK` to START.
    pub start_timeout: Duration,
    /// Resends of a page after its CRC is rejected.
    pub page_retries: u32,
    /// Resends of a single rejected chunk.
    pub chunk_retries: u32,
    /// Open the session with START.
    pub send_start: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(2000),
            erase_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(5),
            page_retries: 3,
            chunk_retries: 3,
            send_start: true,
        }
    }
}

impl SenderConfig {
    /// Set the per-response timeout.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set how often a rejected page is resent.
    #[must_use]
    pub fn with_page_retries(mut self, retries: u32) -> Self {
        self.page_retries = retries;
        self
    }

    /// Skip the START handshake.
    #[must_use]
    pub fn with_start(mut self, send_start: bool) -> Self {
        self.send_start = send_start;
        self
    }
}

/// Statistics of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SendReport {
    /// Image size.
    pub bytes: u32,
    /// Whole-image CRC.
    pub crc: u32,
    /// Pages sent.
    pub pages: usize,
    /// Pages resent after a CRC rejection.
    pub page_retries: u32,
    /// Chunks resent after a rejection.
    pub chunk_retries: u32,
    /// Wall time of the upload.
    pub elapsed: Duration,
}

/// Outcome of sending the chunks of one page.
enum PageResult {
    Committed,
    Rejected,
}

/// Uploads an image over a [`Port`].
pub struct OtaSender<'a, P: Port> {
    port: &'a mut P,
    config: SenderConfig,
    line: Vec<u8>,
    page_retries: u32,
    chunk_retries: u32,
}

impl<'a, P: Port> OtaSender<'a, P> {
    /// Sender with default settings.
    pub fn new(port: &'a mut P) -> Self {
        Self::with_config(port, SenderConfig::default())
    }

    /// Sender with `config`.
    pub fn with_config(port: &'a mut P, config: SenderConfig) -> Self {
        Self {
            port,
            config,
            line: Vec::new(),
            page_retries: 0,
            chunk_retries: 0,
        }
    }

    /// Upload `image`. `progress` receives bytes acknowledged and total.
    pub fn upload<F>(&mut self, image: &FirmwareImage, mut progress: F) -> Result<SendReport>
    where
        F: FnMut(usize, usize),
    {
        let started = Instant::now();
        let total = image
            .data()
            .len();
        self.page_retries = 0;
        self.chunk_retries = 0;
        self.line
            .clear();
        self.port
            .clear_buffers()?;

        if self
            .config
            .send_start
        {
            self.send(&Packet::Command(Command::Start))?;
            self.expect(Response::Ack, self.config.start_timeout, "START")?;
            debug!("Bootloader answered START");
        }

        info!(
            "Sending header: {} bytes, crc {:#010x}",
            image.len(),
            image.crc()
        );
        self.send(&Packet::Header(MetaInfo::new(image.len(), image.crc())))?;
        self.expect(Response::HeaderOk, self.config.erase_timeout, "header")?;

        let mut sent = 0;
        progress(sent, total);
        for page in image.pages() {
            self.send_page(&page)?;
            sent += page
                .data
                .len();
            progress(sent, total);
        }

        self.send(&Packet::Command(Command::End))?;
        match self.read_response(self.config.response_timeout)? {
            Response::Ack => {},
            Response::Nack => {
                return Err(Error::Protocol(
                    "bootloader rejected the image CRC".into(),
                ));
            },
            other => return Err(unexpected(other, "END")),
        }

        let report = SendReport {
            bytes: image.len(),
            crc: image.crc(),
            pages: image.page_count(),
            page_retries: self.page_retries,
            chunk_retries: self.chunk_retries,
            elapsed: started.elapsed(),
        };
        info!("Upload complete in {:.1?}", report.elapsed);
        Ok(report)
    }

    fn send_page(&mut self, page: &Page<'_>) -> Result<()> {
        for attempt in 0..=self
            .config
            .page_retries
        {
            check_interrupted()?;
            if attempt > 0 {
                self.page_retries += 1;
                warn!(
                    "Page {} rejected, resending (attempt {})",
                    page.index,
                    attempt + 1
                );
            }

            self.send(&Packet::BulkHeader { bulk_crc: page.crc })?;
            self.expect(Response::BulkOk, self.config.response_timeout, "bulk header")?;

            match self.send_chunks(page)? {
                PageResult::Committed => {
                    trace!("Page {} committed", page.index);
                    return Ok(());
                },
                PageResult::Rejected => {},
            }
        }

        Err(Error::Protocol(format!(
            "page {} rejected {} times",
            page.index,
            self.config
                .page_retries
                + 1
        )))
    }

    fn send_chunks(&mut self, page: &Page<'_>) -> Result<PageResult> {
        let count = page
            .chunks()
            .len();
        for (i, chunk) in page
            .chunks()
            .enumerate()
        {
            let last = i + 1 == count;
            let mut tries = 0;
            loop {
                self.send(&Packet::Data(chunk))?;
                match self.read_response(self.config.response_timeout)? {
                    Response::DataOk => break,
                    Response::Nack if last => return Ok(PageResult::Rejected),
                    Response::Nack if tries < self.config.chunk_retries => {
                        tries += 1;
                        self.chunk_retries += 1;
                        debug!("Chunk {i} of page {} rejected, resending", page.index);
                    },
                    Response::Nack => {
                        return Err(Error::Protocol(format!(
                            "chunk {i} of page {} rejected {} times",
                            page.index,
                            tries + 1
                        )));
                    },
                    other => return Err(unexpected(other, "data")),
                }
            }
        }

        match self.read_response(self.config.response_timeout)? {
            Response::Ack => Ok(PageResult::Committed),
            Response::Nack => Ok(PageResult::Rejected),
            other => Err(unexpected(other, "page commit")),
        }
    }

    fn send(&mut self, packet: &Packet<'_>) -> Result<()> {
        let frame = packet.to_vec()?;
        trace!("-> {:?} ({} bytes)", packet.packet_type(), frame.len());
        self.port
            .write_all_bytes(&frame)
    }

    fn expect(&mut self, expected: Response, timeout: Duration, what: &str) -> Result<()> {
        match self.read_response(timeout)? {
            r if r == expected => Ok(()),
            Response::Nack => Err(Error::Protocol(format!("bootloader rejected the {what}"))),
            other => Err(unexpected(other, what)),
        }
    }

    /// Next recognised response line. Other text on the line is skipped.
    fn read_response(&mut self, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            while let Some(end) = self
                .line
                .iter()
                .position(|&b| b == b'\n')
            {
                let line: Vec<u8> = self
                    .line
                    .drain(..=end)
                    .collect();
                if let Some(response) = Response::parse(&line) {
                    trace!("<- {response}");
                    return Ok(response);
                }
                trace!("Ignoring line: {:?}", String::from_utf8_lossy(&line));
            }

            check_interrupted()?;
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "no response within {} ms",
                    timeout.as_millis()
                )));
            }

            match self
                .port
                .read(&mut buf)
            {
                Ok(n) => self
                    .line
                    .extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

fn check_interrupted() -> Result<()> {
    if crate::is_interrupted_requested() {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

fn unexpected(response: Response, what: &str) -> Error {
    Error::Protocol(format!("unexpected {response} while waiting on {what}"))
}
