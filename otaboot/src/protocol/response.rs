//! ASCII response lines sent back to the sender.

/// Line the bootloader transmits after processing a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Response {
    /// Header accepted and slot erased.
    HeaderOk,
    /// Bulk CRC recorded.
    BulkOk,
    /// Data chunk buffered.
    DataOk,
    /// Page committed, image verified, or command accepted.
    Ack,
    /// Packet rejected.
    Nack,
}

impl Response {
    /// Text of the line without terminator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HeaderOk => "HEADER_OK",
            Self::BulkOk => "BULK_OK",
            Self::DataOk => "DATA_OK",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
        }
    }

    /// Bytes as transmitted, including the trailing newline.
    pub const fn as_line(self) -> &'static [u8] {
        match self {
            Self::HeaderOk => b"HEADER_OK\n",
            Self::BulkOk => b"BULK_OK\n",
            Self::DataOk => b"DATA_OK\n",
            Self::Ack => b"ACK\n",
            Self::Nack => b"NACK\n",
        }
    }

    /// Parse a received line, ignoring surrounding whitespace and NULs.
    pub fn parse(line: &[u8]) -> Option<Self> {
        let trimmed = trim(line);
        [
            Self::HeaderOk,
            Self::BulkOk,
            Self::DataOk,
            Self::Ack,
            Self::Nack,
        ]
        .into_iter()
        .find(|r| r.as_str().as_bytes() == trimmed)
    }
}

impl core::fmt::Display for Response {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn trim(line: &[u8]) -> &[u8] {
    let noise = |b: &u8| b.is_ascii_whitespace() || *b == 0;
    let start = line
        .iter()
        .position(|b| !noise(b))
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !noise(b))
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_end_with_newline() {
        for response in [
            Response::HeaderOk,
            Response::BulkOk,
            Response::DataOk,
            Response::Ack,
            Response::Nack,
        ] {
            let line = response.as_line();
            assert_eq!(line.last(), Some(&b'\n'));
            assert_eq!(Response::parse(line), Some(response));
        }
    }

    #[test]
    fn test_parse_tolerates_cr_and_nul() {
        assert_eq!(Response::parse(b"ACK\r\n\0"), Some(Response::Ack));
        assert_eq!(Response::parse(b"  NACK"), Some(Response::Nack));
    }

    #[test]
    fn test_parse_rejects_other_text() {
        assert_eq!(Response::parse(b"ACKNOWLEDGED"), None);
        assert_eq!(Response::parse(b""), None);
        assert_eq!(Response::parse(b"booting app"), None);
    }
}
