//! Firmware image parsing.
//!
//! An FX3 RAM image is laid out as:
//!
//! ```text
//! 'C' 'Y' <ctl> 0xB0 | { len_words: u32 LE, address: u32 LE, payload[len_words * 4] }* | checksum: u32 LE
//! ```
//!
//! The record with `len_words == 0` carries the program entry point. Segments are
//! decoded lazily by [`SegmentIter`]; payloads borrow from the image buffer.

use std::fs::File;
use std::io::{Cursor, Read};
use std::num::Wrapping;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::protocol::constants::{
    FW_CHUNK_SIZE, IMAGE_CHECKSUM_LEN, IMAGE_MAGIC_C, IMAGE_MAGIC_Y, IMAGE_SIGNATURE_LEN,
    IMAGE_TYPE_MARKER, MAX_IMAGE_SIZE, SEGMENT_HEADER_LEN,
};

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid signature on firmware: {found:02X?}")]
    InvalidSignature { found: Vec<u8> },
    #[error("Image size {size} exceeds limit {limit}")]
    ImageTooLarge { size: u64, limit: usize },
    #[error("Firmware image is truncated at offset 0x{offset:X} ({unconsumed} bytes left over)")]
    Truncated { offset: usize, unconsumed: usize },
    #[error("Premature end of file: expected {expected} bytes, read {read}")]
    PrematureEof { expected: u64, read: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One addressed block of firmware bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    /// Device load address.
    pub address: u32,
    /// Payload, `byte_len()` bytes.
    pub payload: &'a [u8],
    /// Offset of the segment header within the image.
    pub offset: usize,
}

impl<'a> Segment<'a> {
    /// Payload length in bytes (always a multiple of 4).
    pub fn byte_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// A zero-length record names the program entry point.
    pub fn is_entry_point(&self) -> bool {
        self.payload.is_empty()
    }

    /// Split the payload into upload chunks, each paired with its device address.
    pub fn chunks(&self) -> impl Iterator<Item = (u32, &'a [u8])> + 'a {
        let base = self.address;
        self.payload
            .chunks(FW_CHUNK_SIZE)
            .enumerate()
            .map(move |(i, chunk)| (base.wrapping_add((i * FW_CHUNK_SIZE) as u32), chunk))
    }

    /// Number of control transfers needed for the payload.
    pub fn chunk_count(&self) -> usize {
        self.payload.len().div_ceil(FW_CHUNK_SIZE)
    }
}

/// Check the 4-byte image signature.
pub fn check_signature(data: &[u8]) -> Result<(), ParseError> {
    if data.len() < IMAGE_SIGNATURE_LEN
        || data[0] != IMAGE_MAGIC_C
        || data[1] != IMAGE_MAGIC_Y
        || data[3] != IMAGE_TYPE_MARKER
    {
        return Err(ParseError::InvalidSignature {
            found: data.iter().take(IMAGE_SIGNATURE_LEN).copied().collect(),
        });
    }
    Ok(())
}

/// Lazy, single-pass decoder over the segments of an image.
///
/// Yields `Ok(segment)` in file order. If the image is truncated it yields one
/// `Err(ParseError::Truncated)` and then stops.
#[derive(Debug)]
pub struct SegmentIter<'a> {
    data: &'a [u8],
    offset: usize,
    checksum: Option<u32>,
    finished: bool,
}

impl<'a> SegmentIter<'a> {
    /// Validate size and signature, then position after the signature.
    pub fn new(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.len() > MAX_IMAGE_SIZE {
            return Err(ParseError::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_IMAGE_SIZE,
            });
        }
        check_signature(data)?;
        Ok(Self {
            data,
            offset: IMAGE_SIGNATURE_LEN,
            checksum: None,
            finished: false,
        })
    }

    /// Bytes consumed so far, signature and checksum included.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    /// Trailing checksum, once reached.
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    fn read_u32_at(&self, at: usize) -> Result<u32, ParseError> {
        let mut cursor = Cursor::new(&self.data[at..]);
        Ok(cursor.read_u32::<LittleEndian>()?)
    }

    fn truncated(&mut self) -> Option<Result<Segment<'a>, ParseError>> {
        self.finished = true;
        Some(Err(ParseError::Truncated {
            offset: self.offset,
            unconsumed: self.data.len() - self.offset,
        }))
    }
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Result<Segment<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let remaining = self.data.len() - self.offset;
        if remaining == 0 {
            self.finished = true;
            return None;
        }

        if remaining == IMAGE_CHECKSUM_LEN {
            self.finished = true;
            return match self.read_u32_at(self.offset) {
                Ok(checksum) => {
                    self.checksum = Some(checksum);
                    self.offset += IMAGE_CHECKSUM_LEN;
                    None
                }
                Err(e) => Some(Err(e)),
            };
        }

        if remaining < SEGMENT_HEADER_LEN {
            return self.truncated();
        }

        let header = self.read_u32_at(self.offset).and_then(|words| {
            self.read_u32_at(self.offset + 4)
                .map(|address| (words, address))
        });
        let (words, address) = match header {
            Ok(h) => h,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };

        let byte_len = u64::from(words) << 2;
        let available = (remaining - SEGMENT_HEADER_LEN) as u64;
        if byte_len > available {
            return self.truncated();
        }

        let start = self.offset + SEGMENT_HEADER_LEN;
        let end = start + byte_len as usize;
        let segment = Segment {
            address,
            payload: &self.data[start..end],
            offset: self.offset,
        };
        self.offset = end;
        Some(Ok(segment))
    }
}

/// Fully decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImage<'a> {
    pub segments: Vec<Segment<'a>>,
    /// Stored trailing checksum, if present.
    pub checksum: Option<u32>,
    /// Total bytes consumed; equals the image length.
    pub consumed: usize,
}

impl ParsedImage<'_> {
    /// Bytes taken by the trailing checksum (0 or 4).
    pub fn trailing_bytes(&self) -> usize {
        if self.checksum.is_some() {
            IMAGE_CHECKSUM_LEN
        } else {
            0
        }
    }

    /// Sum of all segment payload lengths.
    pub fn payload_bytes(&self) -> usize {
        self.segments.iter().map(|s| s.payload.len()).sum()
    }

    /// Address of the last entry-point record.
    pub fn entry_point(&self) -> Option<u32> {
        self.segments
            .iter()
            .rev()
            .find(|s| s.is_entry_point())
            .map(|s| s.address)
    }

    /// Wrapping sum of all payload words, the value the stored checksum should hold.
    pub fn computed_checksum(&self) -> u32 {
        self.segments
            .iter()
            .flat_map(|s| s.payload.chunks_exact(4))
            .map(|w| Wrapping(u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
            .sum::<Wrapping<u32>>()
            .0
    }

    /// `None` when the image carries no checksum.
    pub fn checksum_matches(&self) -> Option<bool> {
        self.checksum.map(|stored| stored == self.computed_checksum())
    }
}

/// Parse a whole image: signature, segments and optional trailing checksum.
pub fn parse(data: &[u8]) -> Result<ParsedImage<'_>, ParseError> {
    let mut iter = SegmentIter::new(data)?;
    let segments = iter.by_ref().collect::<Result<Vec<_>, _>>()?;
    Ok(ParsedImage {
        segments,
        checksum: iter.checksum(),
        consumed: iter.consumed(),
    })
}

/// Firmware image loaded into memory, signature already validated.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ParseError> {
        SegmentIter::new(&data)?;
        Ok(Self { data })
    }

    /// Read an image file. The size ceiling is checked before reading.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ParseError> {
        let mut file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        if size > MAX_IMAGE_SIZE as u64 {
            return Err(ParseError::ImageTooLarge {
                size,
                limit: MAX_IMAGE_SIZE,
            });
        }

        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(ParseError::PrematureEof {
                expected: size,
                read: data.len(),
            });
        }

        Self::from_bytes(data)
    }

    /// Lazily iterate the segments.
    pub fn segments(&self) -> SegmentIter<'_> {
        SegmentIter {
            data: &self.data,
            offset: IMAGE_SIGNATURE_LEN,
            checksum: None,
            finished: false,
        }
    }

    /// Decode every segment.
    pub fn parse(&self) -> Result<ParsedImage<'_>, ParseError> {
        parse(&self.data)
    }

    /// Control byte of the signature (byte 2).
    pub fn control_byte(&self) -> u8 {
        self.data[2]
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Build an image from `(address, payload)` records; payload lengths must be multiples of 4.
    pub fn build_image(segments: &[(u32, &[u8])], checksum: Option<u32>) -> Vec<u8> {
        let mut image = vec![b'C', b'Y', 0x1C, 0xB0];
        for (address, payload) in segments {
            assert_eq!(payload.len() % 4, 0);
            image.extend_from_slice(&((payload.len() / 4) as u32).to_le_bytes());
            image.extend_from_slice(&address.to_le_bytes());
            image.extend_from_slice(payload);
        }
        if let Some(sum) = checksum {
            image.extend_from_slice(&sum.to_le_bytes());
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_image;
    use super::*;

    #[test]
    fn test_single_segment_image() {
        let image = [
            b'C', b'Y', 0x00, 0xB0, // signature
            1, 0, 0, 0, // one word
            0, 0, 0, 0, // address 0
            0xAA, 0xBB, 0xCC, 0xDD,
        ];
        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].address, 0);
        assert_eq!(parsed.segments[0].byte_len(), 4);
        assert_eq!(parsed.segments[0].payload, &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(parsed.checksum, None);
        assert_eq!(parsed.consumed, image.len());
    }

    #[test]
    fn test_invalid_signature() {
        for bad in [
            &b"XY\x00\xB0"[..],
            &b"CX\x00\xB0"[..],
            &b"CY\x00\xB1"[..],
            &b"CY\x00"[..],
            &[0u8; 0][..],
        ] {
            assert!(matches!(
                parse(bad),
                Err(ParseError::InvalidSignature { .. })
            ));
        }
        // Byte 2 is free.
        assert!(parse(b"CY\xFF\xB0").is_ok());
    }

    #[test]
    fn test_image_too_large() {
        let mut image = build_image(&[], None);
        image.resize(MAX_IMAGE_SIZE + 1, 0);
        assert!(matches!(
            FirmwareImage::from_bytes(image),
            Err(ParseError::ImageTooLarge { .. })
        ));
    }

    #[test]
    fn test_checksum_consumed() {
        let a = [1u8, 0, 0, 0, 2, 0, 0, 0];
        let b = [3u8; 4096 + 8];
        let image = build_image(&[(0x4000_0000, &a[..]), (0x4000_2000, &b[..])], Some(0x1234_5678));
        let parsed = parse(&image).unwrap();

        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.checksum, Some(0x1234_5678));
        assert_eq!(parsed.trailing_bytes(), 4);
        assert_eq!(parsed.consumed, image.len());
        assert_eq!(parsed.payload_bytes(), image.len() - 4 - 16 - 4);
        assert_eq!(parsed.payload_bytes(), a.len() + b.len());
    }

    #[test]
    fn test_truncated_segment() {
        let mut image = build_image(&[(0x100, &[1u8, 2, 3, 4][..])], None);
        // Declares 4 words, provides 2.
        image.extend_from_slice(&4u32.to_le_bytes());
        image.extend_from_slice(&0x200u32.to_le_bytes());
        image.extend_from_slice(&[0u8; 8]);

        let mut iter = SegmentIter::new(&image).unwrap();
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.address, 0x100);
        match iter.next() {
            Some(Err(ParseError::Truncated { offset, unconsumed })) => {
                assert_eq!(offset, 16);
                assert_eq!(unconsumed, 16);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
        assert!(iter.next().is_none());
        assert!(matches!(parse(&image), Err(ParseError::Truncated { .. })));
    }

    #[test]
    fn test_truncated_header() {
        let mut image = build_image(&[(0x100, &[1u8, 2, 3, 4][..])], None);
        image.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert!(matches!(
            parse(&image),
            Err(ParseError::Truncated { offset: 16, unconsumed: 6 })
        ));
    }

    #[test]
    fn test_oversized_word_count_is_truncation() {
        let mut image = build_image(&[], None);
        image.extend_from_slice(&u32::MAX.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(parse(&image), Err(ParseError::Truncated { .. })));
    }

    #[test]
    fn test_parse_idempotent() {
        let image = build_image(
            &[(0x10, &[9u8; 12][..]), (0x20, &[7u8; 8192][..]), (0x40003000, &[0u8; 0][..])],
            Some(0),
        );
        let fw = FirmwareImage::from_bytes(image).unwrap();
        let first = fw.parse().unwrap();
        let second = fw.parse().unwrap();
        assert_eq!(first, second);
        let lazy: Vec<_> = fw.segments().map(|s| s.unwrap()).collect();
        assert_eq!(lazy, first.segments);
    }

    #[test]
    fn test_entry_point_and_checksum() {
        let payload = [1u8, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 5, 0, 0, 0];
        // 1 + 0xFFFFFFFF + 5 wraps to 5
        let image = build_image(&[(0x40000000, &payload[..]), (0x40000100, &[0u8; 0][..])], Some(5));
        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.entry_point(), Some(0x40000100));
        assert_eq!(parsed.computed_checksum(), 5);
        assert_eq!(parsed.checksum_matches(), Some(true));
    }

    #[test]
    fn test_segment_chunks() {
        let payload = vec![0u8; FW_CHUNK_SIZE * 2 + 4];
        let seg = Segment {
            address: 0x4000_0000,
            payload: &payload,
            offset: 4,
        };
        let chunks: Vec<_> = seg.chunks().map(|(a, c)| (a, c.len())).collect();
        assert_eq!(
            chunks,
            vec![
                (0x4000_0000, FW_CHUNK_SIZE),
                (0x4000_1000, FW_CHUNK_SIZE),
                (0x4000_2000, 4)
            ]
        );
        assert_eq!(seg.chunk_count(), 3);
    }

    #[test]
    fn test_load_from_file() {
        let image = build_image(&[(0x0, &[1u8, 2, 3, 4][..])], Some(0x04030201));
        let path = std::env::temp_dir().join(format!("fx3-core-load-{}.img", std::process::id()));
        std::fs::write(&path, &image).unwrap();

        let fw = FirmwareImage::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(fw.len(), image.len());
        assert_eq!(fw.control_byte(), 0x1C);
        assert_eq!(fw.parse().unwrap().checksum_matches(), Some(true));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            FirmwareImage::load("/nonexistent/fx3/firmware.img"),
            Err(ParseError::Io(_))
        ));
    }
}
