//! NeoPixel UART Protocol
//!
//! Commands travel over the Nordic/Bluefruit UART service. Every write to
//! the TX characteristic is capped at [`MAX_CHUNK_SIZE`] bytes, so longer
//! payloads are split into ordered chunks, one queued write per chunk.

use crate::domain::models::CharacteristicId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// UART Service UUID
pub const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// TX Characteristic UUID - where commands are written
pub const UART_TX_CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// RX Characteristic UUID - notifications from the peripheral
pub const UART_RX_CHAR: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Write target for UART commands
pub const UART_TX: CharacteristicId = CharacteristicId::new(UART_SERVICE, UART_TX_CHAR);

/// Notification source for UART replies
pub const UART_RX: CharacteristicId = CharacteristicId::new(UART_SERVICE, UART_RX_CHAR);

/// Client Characteristic Configuration descriptor (0x2902)
pub const CLIENT_CONFIG_DESCRIPTOR: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Descriptor value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Largest single write the UART characteristic accepts
pub const MAX_CHUNK_SIZE: usize = 20;

/// Literal prefix of the colour command
pub const COLOR_COMMAND_PREFIX: [u8; 2] = *b"!C";

/// Colour command length before the checksum footer
pub const COLOR_PAYLOAD_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Chunk size must be at least 1 byte")]
    InvalidChunkSize,

    #[error("Invalid colour: {0}")]
    InvalidColor(String),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Checksum mismatch: expected {expected:#04X}, got {actual:#04X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Frame is empty")]
    EmptyFrame,
}

/// Ordered, single-pass view of a payload as transport-sized slices.
#[derive(Debug)]
pub struct Chunks<'a> {
    inner: std::slice::Chunks<'a, u8>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Split `data` into slices of at most `max_chunk_size` bytes.
///
/// Every chunk but the last is exactly `max_chunk_size` long and the
/// chunks concatenate back to `data`. An empty payload yields no chunks.
pub fn chunk(data: &[u8], max_chunk_size: usize) -> Result<Chunks<'_>, ProtocolError> {
    if max_chunk_size == 0 {
        return Err(ProtocolError::InvalidChunkSize);
    }
    Ok(Chunks {
        inner: data.chunks(max_chunk_size),
    })
}

/// Bitwise complement of the 8-bit truncated sum of `data`.
pub fn checksum(data: &[u8]) -> u8 {
    !data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Copy `data` and append its checksum as the final byte.
pub fn append_checksum(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 1);
    frame.extend_from_slice(data);
    frame.push(checksum(data));
    frame
}

/// Receiver side of [`append_checksum`]: returns the payload without its
/// footer when the footer matches.
pub fn verify_checksum(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    let (&actual, payload) = frame.split_last().ok_or(ProtocolError::EmptyFrame)?;
    let expected = checksum(payload);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}

/// 24-bit colour as sent to the strip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Unpack `0x00RRGGBB`; the top byte (alpha) is ignored.
    pub const fn from_packed(color: u32) -> Self {
        Self {
            r: ((color >> 16) & 0xFF) as u8,
            g: ((color >> 8) & 0xFF) as u8,
            b: (color & 0xFF) as u8,
        }
    }
}

impl FromStr for Rgb {
    type Err = ProtocolError;

    /// Accepts `#RRGGBB` or `RRGGBB`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim();
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidColor(s.to_string()));
        }
        let packed =
            u32::from_str_radix(hex, 16).map_err(|_| ProtocolError::InvalidColor(s.to_string()))?;
        Ok(Self::from_packed(packed))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Colour command body
///
/// ```text
/// [0-1] : "!C"
/// [2]   : red
/// [3]   : green
/// [4]   : blue
/// ```
pub fn color_payload(color: Rgb) -> [u8; COLOR_PAYLOAD_LEN] {
    [
        COLOR_COMMAND_PREFIX[0],
        COLOR_COMMAND_PREFIX[1],
        color.r,
        color.g,
        color.b,
    ]
}

/// Full colour frame: the 5-byte body followed by its checksum.
pub fn encode_color_command(color: Rgb) -> Vec<u8> {
    append_checksum(&color_payload(color))
}

/// Text commands are sent as raw UTF-8 with no terminator.
pub fn encode_text(text: &str) -> &[u8] {
    text.as_bytes()
}

/// Parse a UUID string such as `6e400001-b5a3-f393-e0a9-e50e24dcca9e`
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, ProtocolError> {
    Uuid::parse_str(uuid_str.trim()).map_err(|_| ProtocolError::InvalidUuid(uuid_str.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        assert_eq!(uuid, UART_SERVICE);
        assert_eq!(parse_uuid(" 6E400002-B5A3-F393-E0A9-E50E24DCCA9E ").unwrap(), UART_TX_CHAR);
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_chunk_reassembles_payload() {
        let data: Vec<u8> = (0..=44).collect();
        let chunks: Vec<&[u8]> = chunk(&data, MAX_CHUNK_SIZE).unwrap().collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 20);
        assert_eq!(chunks[1].len(), 20);
        assert_eq!(chunks[2].len(), 5);
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn test_chunk_exact_multiple_and_empty() {
        let data = [0xAAu8; 40];
        assert!(chunk(&data, 20).unwrap().all(|c| c.len() == 20));
        assert_eq!(chunk(&data, 20).unwrap().len(), 2);
        assert_eq!(chunk(&[], 20).unwrap().count(), 0);
        assert_eq!(chunk(&data, 0).unwrap_err(), ProtocolError::InvalidChunkSize);
    }

    #[test]
    fn test_checksum_complement_invariant() {
        let samples: [&[u8]; 4] = [&[], &[0xFF], b"!C\x12\x34\x56", &[0x80; 300]];
        for sample in samples {
            let framed = append_checksum(sample);
            let sum = framed.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            assert_eq!(sum, 0xFF, "sample {:02X?}", sample);
            assert_eq!(verify_checksum(&framed).unwrap(), sample);
        }
    }

    #[test]
    fn test_verify_checksum_rejects_corruption() {
        let mut framed = append_checksum(b"hello");
        framed[1] ^= 0x01;
        assert!(matches!(
            verify_checksum(&framed),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
        assert_eq!(verify_checksum(&[]), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn test_color_command_black() {
        assert_eq!(
            encode_color_command(Rgb::new(0, 0, 0)),
            vec![0x21, 0x43, 0x00, 0x00, 0x00, 0x9B]
        );
    }

    #[test]
    fn test_color_command_layout() {
        let frame = encode_color_command(Rgb::from_packed(0xFF10_2030));
        assert_eq!(&frame[..5], &[b'!', b'C', 0x10, 0x20, 0x30]);
        assert_eq!(frame[5], checksum(&frame[..5]));
    }

    #[test]
    fn test_rgb_from_str() {
        assert_eq!("#FF8000".parse::<Rgb>().unwrap(), Rgb::new(0xFF, 0x80, 0x00));
        assert_eq!("00ff00".parse::<Rgb>().unwrap(), Rgb::new(0, 0xFF, 0));
        assert!("#FF80".parse::<Rgb>().is_err());
        assert!("#GG0000".parse::<Rgb>().is_err());
        assert_eq!(Rgb::new(1, 2, 255).to_string(), "#0102FF");
    }
}
