use crate::{MediaError, Result};
use core::fmt;
use std::time::Instant;
use time::OffsetDateTime;

/// Payload lengths representable by a CAN FD DLC, indexed by DLC.
const DLC_TO_LENGTH: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Largest payload any supported frame may carry (CAN FD).
pub const MAX_DATA_LENGTH: usize = 64;

/// MTU values an adapter may report: classic CAN plus every CAN FD length above 8.
pub const VALID_MTU_SET: [usize; 8] = [8, 12, 16, 20, 24, 32, 48, 64];

/// Identifier format; the discriminant is the identifier bit length.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum FrameFormat {
    Base = 11,
    Extended = 29,
}

impl FrameFormat {
    pub fn identifier_bit_length(self) -> u32 {
        self as u32
    }

    pub fn max_identifier(self) -> u32 {
        (1u32 << self.identifier_bit_length()) - 1
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Base => f.write_str("base"),
            FrameFormat::Extended => f.write_str("ext"),
        }
    }
}

/// A CAN data frame as handed to a transmitter. Immutable once built.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DataFrame {
    identifier: u32,
    data: Vec<u8>,
    format: FrameFormat,
    loopback: bool,
}

impl DataFrame {
    /// Build a frame, checking the identifier against the format range.
    ///
    /// Empty payloads are representable here; they are rejected at the
    /// transmit boundary instead.
    pub fn new(
        identifier: u32,
        data: impl Into<Vec<u8>>,
        format: FrameFormat,
        loopback: bool,
    ) -> Result<Self> {
        if identifier > format.max_identifier() {
            return Err(MediaError::InvalidFrame("identifier out of range for format"));
        }
        let data = data.into();
        if data.len() > MAX_DATA_LENGTH {
            return Err(MediaError::InvalidFrame("payload longer than 64 bytes"));
        }
        Ok(Self {
            identifier,
            data,
            format,
            loopback,
        })
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn format(&self) -> FrameFormat {
        self.format
    }
    pub fn loopback(&self) -> bool {
        self.loopback
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            FrameFormat::Base => write!(f, "0x{:03X}", self.identifier)?,
            FrameFormat::Extended => write!(f, "0x{:08X}", self.identifier)?,
        }
        write!(f, " {} [", self.format)?;
        for (i, b) in self.data.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02X}")?;
        }
        f.write_str("]")?;
        if self.loopback {
            f.write_str(" loopback")?;
        }
        Ok(())
    }
}

/// Reception time of a frame: wall clock for logs, monotonic for ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp {
    pub system: OffsetDateTime,
    pub monotonic: Instant,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            system: OffsetDateTime::now_utc(),
            monotonic: Instant::now(),
        }
    }
}

/// A frame as seen by a receiver.
///
/// The loopback flag is assigned by the receiving side: frames from other
/// nodes are never loopback, frames a node hands back to itself always are.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimestampedDataFrame {
    frame: DataFrame,
    pub timestamp: Timestamp,
}

impl TimestampedDataFrame {
    /// Re-tag `frame` for delivery with the given loopback flag.
    pub fn received(frame: &DataFrame, loopback: bool, timestamp: Timestamp) -> Self {
        Self {
            frame: DataFrame {
                loopback,
                ..frame.clone()
            },
            timestamp,
        }
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }
    pub fn identifier(&self) -> u32 {
        self.frame.identifier
    }
    pub fn data(&self) -> &[u8] {
        &self.frame.data
    }
    pub fn format(&self) -> FrameFormat {
        self.frame.format
    }
    pub fn loopback(&self) -> bool {
        self.frame.loopback
    }

    /// Same frame on the wire, ignoring when it was seen.
    pub fn is_same_manifestation(&self, other: &DataFrame) -> bool {
        self.frame == *other
    }
}

impl fmt::Display for TimestampedDataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.frame.fmt(f)
    }
}

/// Payload length for a DLC, `None` above 15.
pub fn dlc_to_length(dlc: u8) -> Option<usize> {
    DLC_TO_LENGTH.get(usize::from(dlc)).copied()
}

/// Smallest DLC whose payload length fits `length` bytes.
pub fn length_to_dlc(length: usize) -> Option<u8> {
    DLC_TO_LENGTH
        .iter()
        .position(|&l| l >= length)
        .and_then(|i| u8::try_from(i).ok())
}

/// Bytes of padding needed to reach the next valid frame length.
pub fn required_padding(length: usize) -> Option<usize> {
    let dlc = length_to_dlc(length)?;
    dlc_to_length(dlc).map(|l| l - length)
}

/// An interface discovered on the host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_range_checked_per_format() {
        assert!(DataFrame::new(0x7FF, vec![1], FrameFormat::Base, false).is_ok());
        assert!(DataFrame::new(0x800, vec![1], FrameFormat::Base, false).is_err());
        assert!(DataFrame::new(0x1FFF_FFFF, vec![1], FrameFormat::Extended, false).is_ok());
        assert!(DataFrame::new(0x2000_0000, vec![1], FrameFormat::Extended, false).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(DataFrame::new(1, vec![0u8; 64], FrameFormat::Base, false).is_ok());
        assert!(matches!(
            DataFrame::new(1, vec![0u8; 65], FrameFormat::Base, false),
            Err(MediaError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_received_retags_loopback() {
        let f = DataFrame::new(123, b"abc".to_vec(), FrameFormat::Extended, true).unwrap();
        let ts = Timestamp::now();
        let rx = TimestampedDataFrame::received(&f, false, ts);
        assert!(!rx.loopback());
        assert_eq!(rx.data(), b"abc");
        assert!(!rx.is_same_manifestation(&f));

        let rx = TimestampedDataFrame::received(&f, true, ts);
        assert!(rx.is_same_manifestation(&f));
    }

    #[test]
    fn test_dlc_table() {
        assert_eq!(dlc_to_length(8), Some(8));
        assert_eq!(dlc_to_length(9), Some(12));
        assert_eq!(dlc_to_length(15), Some(64));
        assert_eq!(dlc_to_length(16), None);
        assert_eq!(length_to_dlc(0), Some(0));
        assert_eq!(length_to_dlc(13), Some(10));
        assert_eq!(length_to_dlc(65), None);
        assert_eq!(required_padding(13), Some(3));
        assert_eq!(required_padding(8), Some(0));
    }

    #[test]
    fn test_display() {
        let f = DataFrame::new(0x7B, vec![0x61, 0x62], FrameFormat::Base, true).unwrap();
        assert_eq!(f.to_string(), "0x07B base [61 62] loopback");
    }
}
