//! Common types and constants shared by every decoder in the family
//!
//! This module defines the codec identifiers, the block and quantum header
//! structures of the container format, the crate-wide error type and the
//! sizing constants for the scratch arena and quantum geometry.

use thiserror::Error;

/// Which codec a block header selects.
///
/// The numeric values are the on-disk decoder-type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// LZNA, adaptive arithmetic coding (id 5)
    Lzna = 5,
    /// Kraken (id 6)
    Kraken = 6,
    /// Mermaid and Selkie, which share one on-disk format (id 10)
    Mermaid = 10,
    /// Bitknit, adaptive rANS (id 11)
    Bitknit = 11,
    /// Leviathan (id 12)
    Leviathan = 12,
}

impl CodecKind {
    /// Create a CodecKind from the raw decoder-type byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            5 => Ok(CodecKind::Lzna),
            6 => Ok(CodecKind::Kraken),
            10 => Ok(CodecKind::Mermaid),
            11 => Ok(CodecKind::Bitknit),
            12 => Ok(CodecKind::Leviathan),
            _ => Err(OozError::InvalidCodec(value)),
        }
    }

    /// Kraken, Mermaid and Leviathan share the large-quantum container
    /// layout; LZNA and Bitknit use the compact small-quantum one.
    pub fn is_kraken_family(self) -> bool {
        matches!(
            self,
            CodecKind::Kraken | CodecKind::Mermaid | CodecKind::Leviathan
        )
    }

    /// Output bytes covered by one quantum of this codec.
    pub fn quantum_size(self) -> usize {
        if self.is_kraken_family() {
            BLOCK_SIZE
        } else {
            SMALL_QUANTUM_SIZE
        }
    }
}

/// Error type for every decode operation in this crate
#[derive(Debug, Error)]
pub enum OozError {
    /// A declared size exceeds the bytes actually present.
    #[error("compressed input truncated")]
    TruncatedInput,

    /// Reserved bits set, bad magic nibble or an inconsistent header field.
    #[error("malformed block or chunk header")]
    MalformedHeader,

    /// The decoder-type byte does not name a known codec.
    #[error("invalid decoder type: {0}")]
    InvalidCodec(u8),

    /// A Huffman or tANS table failed an internal consistency check.
    #[error("malformed entropy table")]
    MalformedEntropyTable,

    /// A sub-stream cursor did not land exactly on its declared end.
    #[error("sub-stream length mismatch")]
    StreamLengthMismatch,

    /// A back-reference points before the start of the decoded window.
    #[error("match offset outside decoded window")]
    OffsetOutOfWindow,

    /// A copy would write past the declared output bound.
    #[error("copy overflows output buffer")]
    DestinationOverflow,

    /// The scratch arena is too small for a requested region.
    #[error("scratch arena exhausted")]
    ScratchExhausted,
}

/// Result type alias for decode operations
pub type Result<T> = std::result::Result<T, OozError>;

/// Size of the scratch arena one decoder owns, reused across quanta.
pub const SCRATCH_SIZE: usize = 0x6C000;

/// Logical block size; a block header precedes every 256KB of output.
pub const BLOCK_SIZE: usize = 0x40000;

/// Quantum size for the LZNA and Bitknit codecs.
pub const SMALL_QUANTUM_SIZE: usize = 0x4000;

/// A quantum is decoded as up to two half-blocks of this size.
pub const HALF_BLOCK_SIZE: usize = 0x20000;

/// Header of one 256KB logical block.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Codec every quantum in this block is decoded with
    pub codec: CodecKind,
    /// Adaptive decoder state (LZNA/Bitknit) must be re-initialized
    pub restart_decoder: bool,
    /// Block is stored uncompressed
    pub uncompressed: bool,
    /// Quantum headers carry a checksum field
    pub use_checksums: bool,
}

impl BlockHeader {
    /// Parse a 2-byte block header.
    ///
    /// Byte 0: low nibble must be 0xC, bits 4-5 reserved zero, bit 6 =
    /// uncompressed, bit 7 = restart. Byte 1: bits 0-6 = decoder type,
    /// bit 7 = use-checksums.
    pub fn parse(src: &[u8]) -> Result<(Self, usize)> {
        if src.len() < 2 {
            return Err(OozError::TruncatedInput);
        }
        let b = src[0];
        if (b & 0xF) != 0xC || ((b >> 4) & 3) != 0 {
            return Err(OozError::MalformedHeader);
        }
        let restart_decoder = (b >> 7) & 1 != 0;
        let uncompressed = (b >> 6) & 1 != 0;
        let b = src[1];
        let codec = CodecKind::from_u8(b & 0x7F)?;
        let use_checksums = (b >> 7) != 0;
        Ok((
            BlockHeader {
                codec,
                restart_decoder,
                uncompressed,
                use_checksums,
            },
            2,
        ))
    }
}

/// Header of one quantum.
///
/// `compressed_size == 0` marks a special quantum: a memset (the fill byte
/// travels in `checksum`) or a whole match (`whole_match_distance != 0`).
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantumHeader {
    /// Compressed payload size; 0 for memset / whole-match quanta
    pub compressed_size: usize,
    /// 24-bit checksum of the payload, or the fill byte for a memset
    pub checksum: u32,
    /// Flag bit 18 of the size word
    pub flag1: u8,
    /// Flag bit 19 of the size word
    pub flag2: u8,
    /// Distance of a whole-match quantum, 0 otherwise
    pub whole_match_distance: usize,
}

impl QuantumHeader {
    /// Parse the large-quantum header used by the Kraken family.
    ///
    /// 3 bytes (6 with checksums): an 18-bit size field plus two flag
    /// bits. The all-ones size 0x3FFFF marks a special quantum whose
    /// 2-bit subfield currently only defines the memset form.
    pub fn parse_kraken(src: &[u8], use_checksum: bool) -> Result<(Self, usize)> {
        if src.len() < 3 {
            return Err(OozError::TruncatedInput);
        }
        let v = (src[0] as u32) << 16 | (src[1] as u32) << 8 | src[2] as u32;
        let size = v & 0x3FFFF;
        let mut hdr = QuantumHeader::default();
        if size != 0x3FFFF {
            hdr.compressed_size = size as usize + 1;
            hdr.flag1 = ((v >> 18) & 1) as u8;
            hdr.flag2 = ((v >> 19) & 1) as u8;
            if use_checksum {
                if src.len() < 6 {
                    return Err(OozError::TruncatedInput);
                }
                hdr.checksum = (src[3] as u32) << 16 | (src[4] as u32) << 8 | src[5] as u32;
                return Ok((hdr, 6));
            }
            return Ok((hdr, 3));
        }
        if (v >> 18) == 1 {
            // memset quantum, fill byte in the checksum slot
            if src.len() < 4 {
                return Err(OozError::TruncatedInput);
            }
            hdr.checksum = src[3] as u32;
            hdr.compressed_size = 0;
            hdr.whole_match_distance = 0;
            return Ok((hdr, 4));
        }
        Err(OozError::MalformedHeader)
    }

    /// Parse the compact quantum header used by LZNA and Bitknit.
    ///
    /// 2 bytes carrying a 14-bit size; the all-ones size marks either a
    /// memset or a whole match whose distance follows as a varint.
    pub fn parse_lzna(src: &[u8], use_checksum: bool) -> Result<(Self, usize)> {
        if src.len() < 2 {
            return Err(OozError::TruncatedInput);
        }
        let v = (src[0] as u32) << 8 | src[1] as u32;
        let size = v & 0x3FFF;
        let mut hdr = QuantumHeader::default();
        if size != 0x3FFF {
            hdr.compressed_size = size as usize + 1;
            hdr.flag1 = ((v >> 14) & 1) as u8;
            hdr.flag2 = ((v >> 15) & 1) as u8;
            if use_checksum {
                if src.len() < 5 {
                    return Err(OozError::TruncatedInput);
                }
                hdr.checksum = (src[2] as u32) << 16 | (src[3] as u32) << 8 | src[4] as u32;
                return Ok((hdr, 5));
            }
            return Ok((hdr, 2));
        }
        match v >> 14 {
            3 => {
                let (dist, n) = parse_whole_match_info(&src[2..])?;
                hdr.compressed_size = 0;
                hdr.whole_match_distance = dist;
                Ok((hdr, 2 + n))
            }
            _ => {
                if src.len() < 3 {
                    return Err(OozError::TruncatedInput);
                }
                hdr.checksum = src[2] as u32;
                hdr.compressed_size = 0;
                hdr.whole_match_distance = 0;
                Ok((hdr, 3))
            }
        }
    }
}

/// Parse the variable-length whole-match distance of a compact quantum
/// header: a 15-bit near form, or a base-128 extension for far distances.
fn parse_whole_match_info(src: &[u8]) -> Result<(usize, usize)> {
    if src.len() < 2 {
        return Err(OozError::TruncatedInput);
    }
    let v = (src[0] as u32) << 8 | src[1] as u32;
    if v < 0x8000 {
        let mut x: u32 = 0;
        let mut pos = 0;
        let mut consumed = 2;
        loop {
            let Some(&b) = src.get(consumed) else {
                return Err(OozError::TruncatedInput);
            };
            consumed += 1;
            if b & 0x80 != 0 {
                x = x
                    .checked_add(((b as u32) - 128) << pos)
                    .ok_or(OozError::MalformedHeader)?;
                break;
            }
            x = x
                .checked_add(((b as u32) + 0x80) << pos)
                .ok_or(OozError::MalformedHeader)?;
            pos += 7;
            if pos > 28 {
                return Err(OozError::MalformedHeader);
            }
        }
        Ok(((0x8000 + v + (x << 15) + 1) as usize, consumed))
    } else {
        Ok(((v - 0x8000 + 1) as usize, 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_kind() {
        assert_eq!(CodecKind::from_u8(6).unwrap(), CodecKind::Kraken);
        assert_eq!(CodecKind::from_u8(10).unwrap(), CodecKind::Mermaid);
        assert_eq!(CodecKind::from_u8(12).unwrap(), CodecKind::Leviathan);
        assert_eq!(CodecKind::from_u8(5).unwrap(), CodecKind::Lzna);
        assert_eq!(CodecKind::from_u8(11).unwrap(), CodecKind::Bitknit);
        assert!(CodecKind::from_u8(7).is_err());
        assert!(CodecKind::from_u8(0).is_err());

        assert!(CodecKind::Kraken.is_kraken_family());
        assert!(!CodecKind::Lzna.is_kraken_family());
        assert_eq!(CodecKind::Kraken.quantum_size(), 0x40000);
        assert_eq!(CodecKind::Bitknit.quantum_size(), 0x4000);
    }

    #[test]
    fn test_block_header() {
        // Kraken, no flags
        let (hdr, n) = BlockHeader::parse(&[0x0C, 0x06]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(hdr.codec, CodecKind::Kraken);
        assert!(!hdr.restart_decoder && !hdr.uncompressed && !hdr.use_checksums);

        // restart + uncompressed + checksums, Leviathan
        let (hdr, _) = BlockHeader::parse(&[0xCC, 0x8C]).unwrap();
        assert!(hdr.restart_decoder);
        assert!(hdr.uncompressed);
        assert!(hdr.use_checksums);
        assert_eq!(hdr.codec, CodecKind::Leviathan);

        // wrong magic nibble
        assert!(BlockHeader::parse(&[0x0D, 0x06]).is_err());
        // reserved bits 4-5 set
        assert!(BlockHeader::parse(&[0x1C, 0x06]).is_err());
        assert!(BlockHeader::parse(&[0x2C, 0x06]).is_err());
        // invalid decoder type
        assert!(BlockHeader::parse(&[0x0C, 0x07]).is_err());
        assert!(BlockHeader::parse(&[0x0C]).is_err());
    }

    #[test]
    fn test_quantum_header() {
        // 18-bit size field, size byte order is big-endian
        let (hdr, n) = QuantumHeader::parse_kraken(&[0x00, 0x01, 0x00], false).unwrap();
        assert_eq!(n, 3);
        assert_eq!(hdr.compressed_size, 0x101);

        // with checksum
        let (hdr, n) =
            QuantumHeader::parse_kraken(&[0x00, 0x01, 0x00, 0xAA, 0xBB, 0xCC], true).unwrap();
        assert_eq!(n, 6);
        assert_eq!(hdr.checksum, 0xAABBCC);

        // memset quantum: size 0x3FFFF with subfield 1, fill byte follows
        let (hdr, n) = QuantumHeader::parse_kraken(&[0x07, 0xFF, 0xFF, 0x55], false).unwrap();
        assert_eq!(n, 4);
        assert_eq!(hdr.compressed_size, 0);
        assert_eq!(hdr.checksum, 0x55);

        // special quantum with unknown subfield
        assert!(QuantumHeader::parse_kraken(&[0x0B, 0xFF, 0xFF, 0x55], false).is_err());
    }

    #[test]
    fn test_lzna_quantum_header() {
        let (hdr, n) = QuantumHeader::parse_lzna(&[0x00, 0x7F], false).unwrap();
        assert_eq!(n, 2);
        assert_eq!(hdr.compressed_size, 0x80);

        // memset form
        let (hdr, n) = QuantumHeader::parse_lzna(&[0x7F, 0xFF, 0x13], false).unwrap();
        assert_eq!(n, 3);
        assert_eq!(hdr.compressed_size, 0);
        assert_eq!(hdr.checksum, 0x13);

        // whole-match form, near distance
        let (hdr, n) = QuantumHeader::parse_lzna(&[0xFF, 0xFF, 0x80, 0x07], false).unwrap();
        assert_eq!(n, 4);
        assert_eq!(hdr.compressed_size, 0);
        assert_eq!(hdr.whole_match_distance, 8);
    }

    #[test]
    fn test_constants() {
        assert_eq!(SCRATCH_SIZE, 0x6C000);
        assert_eq!(BLOCK_SIZE, 256 * 1024);
        assert_eq!(HALF_BLOCK_SIZE, 128 * 1024);
        assert_eq!(SMALL_QUANTUM_SIZE, 16 * 1024);
    }
}
