//! Block orchestration
//!
//! `Decompressor` drives the top-level loop: parse a block header at
//! every 256KB boundary, parse one quantum header per step, handle the
//! special quanta (uncompressed blocks, memset fills, whole matches) and
//! dispatch everything else to the codec the block selected. The scratch
//! arena is owned here and reused across quanta; the adaptive LZNA and
//! Bitknit states persist until the container raises the restart flag.

use crate::bitknit::{self, BitknitState};
use crate::common::{
    BlockHeader, CodecKind, OozError, QuantumHeader, Result, SCRATCH_SIZE,
};
use crate::entropy::Ctx;
use crate::lzna::{self, LznaState};
use crate::{kraken, leviathan, mermaid};

/// The quantum CRC is a stub: when checksums are enabled, only streams
/// whose stored checksum equals this value pass the comparison.
fn quantum_checksum(_data: &[u8]) -> u32 {
    0
}

/// Copy a whole-match quantum: the entire output range repeats the data
/// `dist` bytes back, byte-serially so short distances replicate.
fn copy_whole_match(out: &mut [u8], dst: usize, dist: usize, length: usize) {
    for i in 0..length {
        out[dst + i] = out[dst - dist + i];
    }
}

/// Reusable decoder owning the scratch arena and any persistent
/// adaptive-codec state.
#[derive(Debug)]
pub struct Decompressor {
    scratch: Vec<u8>,
    hdr: Option<BlockHeader>,
    bitknit: Option<Box<BitknitState>>,
    lzna: Option<Box<LznaState>>,
}

impl Decompressor {
    /// Create a decoder with a fresh scratch arena.
    pub fn new() -> Decompressor {
        Decompressor {
            scratch: vec![0u8; SCRATCH_SIZE],
            hdr: None,
            bitknit: None,
            lzna: None,
        }
    }

    /// Decompress `src` into the whole of `dst`, returning the number of
    /// bytes produced. Partial output is unspecified on error; callers
    /// discard it.
    pub fn decompress_into(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let mut src_pos = 0usize;
        let mut offset = 0usize;
        while offset < dst.len() {
            let (src_used, dst_used) = self.decode_step(dst, offset, src, src_pos)?;
            if src_used == 0 || dst_used == 0 {
                return Err(OozError::TruncatedInput);
            }
            src_pos += src_used;
            offset += dst_used;
        }
        if src_pos != src.len() {
            return Err(OozError::StreamLengthMismatch);
        }
        Ok(offset)
    }

    /// Decode one quantum (or one uncompressed block slice).
    fn decode_step(
        &mut self,
        output: &mut [u8],
        offset: usize,
        src: &[u8],
        src_start: usize,
    ) -> Result<(usize, usize)> {
        let mut pos = src_start;

        if offset & 0x3FFFF == 0 {
            let (hdr, n) = BlockHeader::parse(&src[pos.min(src.len())..])?;
            log::debug!(
                "block header: codec {:?}, uncompressed {}, checksums {}",
                hdr.codec,
                hdr.uncompressed,
                hdr.use_checksums
            );
            self.hdr = Some(hdr);
            pos += n;
        }
        let hdr = self.hdr.ok_or(OozError::MalformedHeader)?;

        let dst_bytes_left = (output.len() - offset).min(hdr.codec.quantum_size());

        if hdr.uncompressed {
            if src.len().saturating_sub(pos) < dst_bytes_left {
                return Err(OozError::TruncatedInput);
            }
            output[offset..offset + dst_bytes_left]
                .copy_from_slice(&src[pos..pos + dst_bytes_left]);
            return Ok((pos + dst_bytes_left - src_start, dst_bytes_left));
        }

        let (qhdr, n) = if hdr.codec.is_kraken_family() {
            QuantumHeader::parse_kraken(&src[pos.min(src.len())..], hdr.use_checksums)?
        } else {
            QuantumHeader::parse_lzna(&src[pos.min(src.len())..], hdr.use_checksums)?
        };
        pos += n;

        if src.len().saturating_sub(pos) < qhdr.compressed_size {
            return Err(OozError::TruncatedInput);
        }
        if qhdr.compressed_size > dst_bytes_left {
            return Err(OozError::MalformedHeader);
        }

        if qhdr.compressed_size == 0 {
            if qhdr.whole_match_distance != 0 {
                if qhdr.whole_match_distance > offset {
                    return Err(OozError::OffsetOutOfWindow);
                }
                copy_whole_match(output, offset, qhdr.whole_match_distance, dst_bytes_left);
            } else {
                output[offset..offset + dst_bytes_left].fill(qhdr.checksum as u8);
            }
            return Ok((pos - src_start, dst_bytes_left));
        }

        if hdr.use_checksums
            && quantum_checksum(&src[pos..pos + qhdr.compressed_size]) & 0xFFFFFF != qhdr.checksum
        {
            return Err(OozError::MalformedHeader);
        }

        if qhdr.compressed_size == dst_bytes_left {
            output[offset..offset + dst_bytes_left]
                .copy_from_slice(&src[pos..pos + dst_bytes_left]);
            return Ok((pos + dst_bytes_left - src_start, dst_bytes_left));
        }

        let src_end = pos + qhdr.compressed_size;
        let n = match hdr.codec {
            CodecKind::Kraken => {
                let mut ctx = Ctx {
                    input: src,
                    output,
                    scratch: &mut self.scratch,
                };
                kraken::decode_quantum(&mut ctx, offset, offset + dst_bytes_left, 0, pos, src_end)?
            }
            CodecKind::Mermaid => {
                let mut ctx = Ctx {
                    input: src,
                    output,
                    scratch: &mut self.scratch,
                };
                mermaid::decode_quantum(&mut ctx, offset, offset + dst_bytes_left, 0, pos, src_end)?
            }
            CodecKind::Leviathan => {
                let mut ctx = Ctx {
                    input: src,
                    output,
                    scratch: &mut self.scratch,
                };
                leviathan::decode_quantum(
                    &mut ctx,
                    offset,
                    offset + dst_bytes_left,
                    0,
                    pos,
                    src_end,
                )?
            }
            CodecKind::Lzna => {
                if hdr.restart_decoder {
                    self.set_restart_done();
                    self.lzna = Some(Box::new(LznaState::new()));
                }
                let state = self.lzna.get_or_insert_with(|| Box::new(LznaState::new()));
                lzna::decode_quantum(
                    state,
                    src,
                    pos,
                    src_end,
                    output,
                    offset,
                    offset + dst_bytes_left,
                    0,
                )?
            }
            CodecKind::Bitknit => {
                if hdr.restart_decoder {
                    self.set_restart_done();
                    self.bitknit = Some(Box::new(BitknitState::new()));
                }
                let state = self
                    .bitknit
                    .get_or_insert_with(|| Box::new(BitknitState::new()));
                bitknit::decode(
                    state,
                    src,
                    pos,
                    src_end,
                    output,
                    offset,
                    offset + dst_bytes_left,
                    0,
                )?
            }
        };

        if n != qhdr.compressed_size {
            return Err(OozError::StreamLengthMismatch);
        }
        Ok((pos + n - src_start, dst_bytes_left))
    }

    fn set_restart_done(&mut self) {
        if let Some(hdr) = &mut self.hdr {
            hdr.restart_decoder = false;
        }
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_block_round_trip() {
        // header byte 0x4C: magic nibble C, uncompressed flag
        let mut src = vec![0x4C, 0x06];
        src.extend_from_slice(b"plain data bytes");
        let mut out = [0u8; 16];
        let mut dec = Decompressor::new();
        let n = dec.decompress_into(&src, &mut out).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&out, b"plain data bytes");
    }

    #[test]
    fn memset_quantum_fills_output() {
        // kraken block, special quantum with subfield 1 and fill 0xAB
        let src = [0x0C, 0x06, 0x07, 0xFF, 0xFF, 0xAB];
        let mut out = [0u8; 100];
        let mut dec = Decompressor::new();
        dec.decompress_into(&src, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn stored_quantum_copies_verbatim() {
        // compressed_size == quantum size stores the bytes raw
        let payload = b"0123456789abcdef";
        let mut src = vec![0x0C, 0x06];
        let size_field = (payload.len() - 1) as u32;
        src.extend_from_slice(&[
            (size_field >> 16) as u8,
            (size_field >> 8) as u8,
            size_field as u8,
        ]);
        src.extend_from_slice(payload);
        let mut out = [0u8; 16];
        let mut dec = Decompressor::new();
        dec.decompress_into(&src, &mut out).unwrap();
        assert_eq!(&out, payload);
    }

    #[test]
    fn whole_match_repeats_earlier_output() {
        // 16-byte memset quantum, then a whole-match quantum in a second
        // block is impossible below 256KB; instead verify the copy helper
        let mut out = *b"abcdefgh________";
        copy_whole_match(&mut out, 8, 8, 8);
        assert_eq!(&out, b"abcdefghabcdefgh");

        // short distances replicate
        let mut out = *b"x_______";
        copy_whole_match(&mut out, 1, 1, 7);
        assert_eq!(&out, b"xxxxxxxx");
    }

    #[test]
    fn bad_magic_rejected() {
        let src = [0x0D, 0x06, 0x00];
        let mut out = [0u8; 4];
        let mut dec = Decompressor::new();
        assert!(dec.decompress_into(&src, &mut out).is_err());
    }

    #[test]
    fn trailing_source_bytes_rejected() {
        let mut src = vec![0x4C, 0x06];
        src.extend_from_slice(b"data");
        src.push(0xFF); // surplus byte
        let mut out = [0u8; 4];
        let mut dec = Decompressor::new();
        assert!(dec.decompress_into(&src, &mut out).is_err());
    }

    #[test]
    fn empty_output_accepts_empty_source() {
        let mut out = [0u8; 0];
        let mut dec = Decompressor::new();
        assert_eq!(dec.decompress_into(&[], &mut out).unwrap(), 0);
    }

    #[test]
    fn nonzero_checksum_with_stub_crc_rejected() {
        // checksummed kraken block: quantum header carries 6 bytes; the
        // stub CRC only matches a stored checksum of zero
        let payload = [0u8; 8];
        let mut src = vec![0x0C, 0x86];
        src.extend_from_slice(&[0x00, 0x00, 0x07]); // compressed_size 8
        src.extend_from_slice(&[0x12, 0x34, 0x56]); // nonzero checksum
        src.extend_from_slice(&payload);
        let mut out = [0u8; 8];
        let mut dec = Decompressor::new();
        assert!(dec.decompress_into(&src, &mut out).is_err());
    }
}
