//! Kraken LZ decoding
//!
//! A Kraken quantum decodes in two phases: `read_lz_table` entropy-decodes
//! the literal/command/offset/length sub-streams and unpacks the offset
//! and length arrays to 32 bits, then `process_lz_runs` interprets one
//! command byte per literal+match event against a 3-slot recent-offset
//! ring. Chunk mode 0 codes literals as deltas against the bytes at the
//! most recent match distance; mode 1 copies them verbatim.

use crate::bits::BitReader;
use crate::common::{OozError, Result, HALF_BLOCK_SIZE};
use crate::entropy::{self, Ctx, Decoded, Mem, Ptr};

/// Sub-streams of one quantum, produced by phase one.
#[derive(Debug)]
pub(crate) struct KrakenLzTable {
    pub cmd: Decoded,
    pub lits: Decoded,
    pub offs: Vec<i32>,
    pub lens: Vec<i32>,
}

/// Unpack the packed 8-bit offset and length streams into 32-bit arrays.
///
/// Offsets read extra bits from a forward and a backward bit cursor in
/// alternation; the cursors share `input[src..src_end]` and must meet
/// exactly. Length bytes of 255 escape to a separately coded u32 stream.
#[allow(clippy::too_many_arguments)]
pub(crate) fn unpack_offsets(
    ctx: &Ctx,
    src: usize,
    src_end: usize,
    packed_offs: Decoded,
    packed_offs_extra: Option<Decoded>,
    multi_dist_scale: i32,
    packed_litlen: Decoded,
    excess_flag: bool,
) -> Result<(Vec<i32>, Vec<i32>)> {
    let input = ctx.input;
    let mut bits_a = BitReader::new(input, src, src_end);
    let mut bits_b = BitReader::new_backwards(input, src, src_end);

    let mut u32_len_stream_size = 0usize;
    if !excess_flag {
        if bits_b.bits < 0x2000 {
            return Err(OozError::MalformedHeader);
        }
        let mut n = bits_b.bits.leading_zeros() as i32;
        bits_b.bitpos += n;
        bits_b.bits <<= n;
        bits_b.refill_backwards();
        n += 1;
        u32_len_stream_size = ((bits_b.bits >> (32 - n)) - 1) as usize;
        bits_b.bitpos += n;
        bits_b.bits <<= n;
        bits_b.refill_backwards();
    }

    let packed = ctx.stream(packed_offs)?;
    let mut offs: Vec<i32> = Vec::with_capacity(packed.len());

    if multi_dist_scale == 0 {
        // traditional offset coding
        let mut i = 0;
        while i < packed.len() {
            let d = bits_a.read_distance(packed[i] as u32);
            offs.push((d as i32).wrapping_neg());
            i += 1;
            if i == packed.len() {
                break;
            }
            let d = bits_b.read_distance_backwards(packed[i] as u32);
            offs.push((d as i32).wrapping_neg());
            i += 1;
        }
    } else {
        // scaled offsets: coarse exponent/mantissa class plus raw bits
        let mut i = 0;
        while i < packed.len() {
            let cmd = packed[i] as i32;
            i += 1;
            if cmd >> 3 > 26 {
                return Err(OozError::MalformedHeader);
            }
            let o = (((8 + (cmd & 7)) << (cmd >> 3)) as u32)
                | bits_a.read_more_than_24_bits(cmd >> 3);
            offs.push(8i32.wrapping_sub(o as i32));
            if i == packed.len() {
                break;
            }
            let cmd = packed[i] as i32;
            i += 1;
            if cmd >> 3 > 26 {
                return Err(OozError::MalformedHeader);
            }
            let o = (((8 + (cmd & 7)) << (cmd >> 3)) as u32)
                | bits_b.read_more_than_24_bits_backwards(cmd >> 3);
            offs.push(8i32.wrapping_sub(o as i32));
        }
        if multi_dist_scale != 1 {
            let low_bits = ctx.stream(
                packed_offs_extra.ok_or(OozError::MalformedHeader)?,
            )?;
            if low_bits.len() != offs.len() {
                return Err(OozError::StreamLengthMismatch);
            }
            for (o, &lb) in offs.iter_mut().zip(low_bits) {
                *o = multi_dist_scale
                    .wrapping_mul(*o)
                    .wrapping_sub(lb as i32);
            }
        }
    }

    // max count is 128kb / 256 = 512
    let mut u32_len_stream_buf = [0u32; 512];
    if u32_len_stream_size > 512 {
        return Err(OozError::MalformedHeader);
    }
    let mut i = 0;
    while i + 1 < u32_len_stream_size {
        u32_len_stream_buf[i] = bits_a.read_length()?;
        u32_len_stream_buf[i + 1] = bits_b.read_length_backwards()?;
        i += 2;
    }
    if i < u32_len_stream_size {
        u32_len_stream_buf[i] = bits_a.read_length()?;
    }

    bits_a.p -= ((24 - bits_a.bitpos) >> 3) as isize;
    bits_b.p += ((24 - bits_b.bitpos) >> 3) as isize;
    if bits_a.p != bits_b.p {
        return Err(OozError::StreamLengthMismatch);
    }

    let litlen = ctx.stream(packed_litlen)?;
    let mut lens: Vec<i32> = Vec::with_capacity(litlen.len());
    let mut used = 0usize;
    for &pb in litlen {
        let mut v = pb as u32;
        if v == 255 {
            if used >= 512 {
                return Err(OozError::StreamLengthMismatch);
            }
            v = u32_len_stream_buf[used] + 255;
            used += 1;
        }
        lens.push((v + 3) as i32);
    }
    if used != u32_len_stream_size {
        return Err(OozError::StreamLengthMismatch);
    }

    Ok((offs, lens))
}

/// Phase one: decode the four sub-streams of one quantum.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_lz_table(
    ctx: &mut Ctx,
    mode: u32,
    mut src: usize,
    src_end: usize,
    dst: usize,
    dst_size: usize,
    offset: usize,
    mut scratch: usize,
    scratch_end: usize,
) -> Result<KrakenLzTable> {
    if mode > 1 {
        return Err(OozError::MalformedHeader);
    }
    if src_end.saturating_sub(src) < 13 {
        return Err(OozError::TruncatedInput);
    }

    if offset == 0 {
        // the first 8 bytes of the window travel uncompressed
        ctx.copy(Ptr::out(dst), Ptr::inp(src), 8)?;
        src += 8;
    }

    if ctx.get_u8(Ptr::inp(src))? & 0x80 != 0 {
        let flag = ctx.get_u8(Ptr::inp(src))?;
        if flag & 0xC0 != 0x80 {
            return Err(OozError::MalformedHeader);
        }
        // excess bytes not supported
        return Err(OozError::MalformedHeader);
    }

    // input and output never alias here, so stored streams stay zero-copy
    let limit = |scratch: usize, cap: usize| scratch_end.saturating_sub(scratch).min(cap);

    let (n, lits) = entropy::decode_bytes(
        ctx,
        Ptr::tmp(scratch),
        src,
        src_end,
        limit(scratch, dst_size),
        false,
        scratch,
        scratch_end,
        0,
    )?;
    src += n;
    scratch += lits.len;

    let (n, cmd) = entropy::decode_bytes(
        ctx,
        Ptr::tmp(scratch),
        src,
        src_end,
        limit(scratch, dst_size),
        false,
        scratch,
        scratch_end,
        0,
    )?;
    src += n;
    scratch += cmd.len;

    if src_end.saturating_sub(src) < 3 {
        return Err(OozError::TruncatedInput);
    }

    let mut offs_scaling: i32 = 0;
    let mut packed_offs_extra: Option<Decoded> = None;

    let packed_offs;
    if ctx.get_u8(Ptr::inp(src))? & 0x80 != 0 {
        // distances coded with two tables: offs * scale - low_bits
        offs_scaling = ctx.get_u8(Ptr::inp(src))? as i32 - 127;
        src += 1;

        let (n, d) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, cmd.len),
            false,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        scratch += d.len;
        packed_offs = d;

        if offs_scaling != 1 {
            let (n, d) = entropy::decode_bytes(
                ctx,
                Ptr::tmp(scratch),
                src,
                src_end,
                limit(scratch, packed_offs.len),
                false,
                scratch,
                scratch_end,
                0,
            )?;
            if d.len != packed_offs.len {
                return Err(OozError::StreamLengthMismatch);
            }
            src += n;
            scratch += d.len;
            packed_offs_extra = Some(d);
        }
    } else {
        // packed offset stream, bounded by the command count
        let (n, d) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, cmd.len),
            false,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        scratch += d.len;
        packed_offs = d;
    }

    // packed literal/length stream, bounded by a quarter of the output
    let (n, packed_len) = entropy::decode_bytes(
        ctx,
        Ptr::tmp(scratch),
        src,
        src_end,
        limit(scratch, dst_size >> 2),
        false,
        scratch,
        scratch_end,
        0,
    )?;
    src += n;
    scratch += packed_len.len;

    // headroom for the unpacked 32-bit arrays
    let mut needed = (scratch + 15) & !15;
    needed += packed_offs.len * 4;
    needed = (needed + 15) & !15;
    needed += packed_len.len * 4;
    if needed + 64 > scratch_end {
        return Err(OozError::ScratchExhausted);
    }

    let (offs, lens) = unpack_offsets(
        ctx,
        src,
        src_end,
        packed_offs,
        packed_offs_extra,
        offs_scaling,
        packed_len,
        false,
    )?;

    Ok(KrakenLzTable {
        cmd,
        lits,
        offs,
        lens,
    })
}

fn resolve<'a>(input: &'a [u8], scratch: &'a [u8], d: Decoded) -> Result<&'a [u8]> {
    let buf = match d.at.mem {
        Mem::In => input,
        Mem::Tmp => scratch,
        Mem::Out => return Err(OozError::MalformedHeader),
    };
    buf.get(d.at.pos..d.at.pos + d.len)
        .ok_or(OozError::ScratchExhausted)
}

/// Phase two: execute the command stream into the output window.
pub(crate) fn process_lz_runs(
    ctx: &mut Ctx,
    mode: u32,
    dst: usize,
    dst_size: usize,
    offset: usize,
    lzt: &KrakenLzTable,
) -> Result<()> {
    let input = ctx.input;
    let scratch = &*ctx.scratch;
    let out = &mut *ctx.output;

    let lit = resolve(input, scratch, lzt.lits)?;
    let cmd = resolve(input, scratch, lzt.cmd)?;

    let start = dst + if offset == 0 { 8 } else { 0 };
    let window_start = dst - offset;

    run_lz(
        cmd,
        lit,
        &lzt.offs,
        &lzt.lens,
        out,
        start,
        dst + dst_size,
        window_start,
        mode == 0,
    )
}

/// The command interpreter shared by both chunk modes. `delta_literals`
/// selects mode 0, where every literal is added to the byte one
/// last-offset back instead of copied.
#[allow(clippy::too_many_arguments)]
fn run_lz(
    cmd: &[u8],
    lit: &[u8],
    offs: &[i32],
    lens: &[i32],
    out: &mut [u8],
    mut dst: usize,
    dst_end: usize,
    window_start: usize,
    delta_literals: bool,
) -> Result<()> {
    let mut last_offset: i32 = -8;
    let mut recent = [0i32; 7];
    recent[3] = -8;
    recent[4] = -8;
    recent[5] = -8;

    let mut lit_i = 0usize;
    let mut offs_i = 0usize;
    let mut len_i = 0usize;

    for &f in cmd {
        let f = f as u32;
        let mut litlen = (f & 3) as usize;
        let offs_index = (f >> 6) as usize;
        let mut matchlen = ((f >> 2) & 0xF) as usize;

        if litlen == 3 {
            let Some(&v) = lens.get(len_i) else {
                return Err(OozError::StreamLengthMismatch);
            };
            len_i += 1;
            litlen = v as usize;
        }

        recent[6] = offs.get(offs_i).copied().unwrap_or(0);

        // literal run
        if litlen > dst_end - dst {
            return Err(OozError::DestinationOverflow);
        }
        if litlen > lit.len() - lit_i {
            return Err(OozError::StreamLengthMismatch);
        }
        if delta_literals {
            let lag = dst as i64 + last_offset as i64;
            if lag < window_start as i64 {
                return Err(OozError::OffsetOutOfWindow);
            }
            for k in 0..litlen {
                out[dst + k] = lit[lit_i + k].wrapping_add(out[(lag as usize) + k]);
            }
        } else {
            out[dst..dst + litlen].copy_from_slice(&lit[lit_i..lit_i + litlen]);
        }
        dst += litlen;
        lit_i += litlen;

        // recent-offset ring: the reused slot's previous distance is
        // promoted to the front, not discarded
        let offset = recent[offs_index + 3];
        recent[offs_index + 3] = recent[offs_index + 2];
        recent[offs_index + 2] = recent[offs_index + 1];
        recent[offs_index + 1] = recent[offs_index];
        recent[3] = offset;
        last_offset = offset;
        if offs_index == 3 {
            offs_i += 1;
        }

        if offset >= 0 || (-(offset as i64)) as u64 > (dst - window_start) as u64 {
            return Err(OozError::OffsetOutOfWindow);
        }
        let copy_from = (dst as i64 + offset as i64) as usize;

        if matchlen != 15 {
            matchlen += 2;
        } else {
            let Some(&v) = lens.get(len_i) else {
                return Err(OozError::StreamLengthMismatch);
            };
            len_i += 1;
            // why is the bias not 16 here, the short form copies up to 16
            matchlen = 14 + v as usize;
        }
        if matchlen > dst_end - dst {
            return Err(OozError::DestinationOverflow);
        }
        for k in 0..matchlen {
            out[dst + k] = out[copy_from + k];
        }
        dst += matchlen;
    }

    if offs_i != offs.len() || len_i != lens.len() {
        return Err(OozError::StreamLengthMismatch);
    }

    // the remaining output is one final literal run
    let final_len = dst_end - dst;
    if final_len != lit.len() - lit_i {
        return Err(OozError::StreamLengthMismatch);
    }
    if delta_literals {
        let lag = dst as i64 + last_offset as i64;
        if lag < window_start as i64 {
            return Err(OozError::OffsetOutOfWindow);
        }
        for k in 0..final_len {
            out[dst + k] = lit[lit_i + k].wrapping_add(out[(lag as usize) + k]);
        }
    } else {
        out[dst..dst_end].copy_from_slice(&lit[lit_i..lit_i + final_len]);
    }
    Ok(())
}

/// Decode one quantum of up to 256KB, processed as two 128KB half-blocks
/// that are compressed separately but share history.
pub(crate) fn decode_quantum(
    ctx: &mut Ctx,
    mut dst: usize,
    dst_end: usize,
    window_start: usize,
    mut src: usize,
    src_end: usize,
) -> Result<usize> {
    let src_in = src;
    let scratch_len = ctx.scratch.len();

    while dst_end - dst != 0 {
        let dst_count = (dst_end - dst).min(HALF_BLOCK_SIZE);
        if src_end.saturating_sub(src) < 4 {
            return Err(OozError::TruncatedInput);
        }
        let chunkhdr = (ctx.get_u8(Ptr::inp(src))? as usize) << 16
            | (ctx.get_u8(Ptr::inp(src + 1))? as usize) << 8
            | ctx.get_u8(Ptr::inp(src + 2))? as usize;
        log::debug!("kraken chunk header {:#x}", chunkhdr);
        let src_used;
        if chunkhdr & 0x800000 == 0 {
            // stored as entropy without any match copying
            let (n, d) = entropy::decode_bytes(
                ctx,
                Ptr::out(dst),
                src,
                src_end,
                dst_count,
                false,
                0,
                scratch_len,
                0,
            )?;
            if d.len != dst_count {
                return Err(OozError::StreamLengthMismatch);
            }
            src_used = n;
        } else {
            src += 3;
            src_used = chunkhdr & 0x7FFFF;
            let mode = ((chunkhdr >> 19) & 0xF) as u32;
            if src_end.saturating_sub(src) < src_used {
                return Err(OozError::TruncatedInput);
            }
            if src_used < dst_count {
                let scratch_usage = (3 * dst_count + 32 + 0xD000).min(0x6C000).min(scratch_len);
                let lzt = read_lz_table(
                    ctx,
                    mode,
                    src,
                    src + src_used,
                    dst,
                    dst_count,
                    dst - window_start,
                    0,
                    scratch_usage,
                )?;
                process_lz_runs(ctx, mode, dst, dst_count, dst - window_start, &lzt)?;
            } else if src_used > dst_count || mode != 0 {
                return Err(OozError::MalformedHeader);
            } else {
                ctx.copy(Ptr::out(dst), Ptr::inp(src), dst_count)?;
            }
        }
        src += src_used;
        dst += dst_count;
    }
    Ok(src - src_in)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lz_table(cmd: &[u8], lit: &[u8], offs: Vec<i32>, lens: Vec<i32>) -> (Vec<u8>, KrakenLzTable) {
        // pack cmd then lit into one input buffer and reference them
        let mut input = cmd.to_vec();
        input.extend_from_slice(lit);
        let t = KrakenLzTable {
            cmd: Decoded {
                at: Ptr::inp(0),
                len: cmd.len(),
            },
            lits: Decoded {
                at: Ptr::inp(cmd.len()),
                len: lit.len(),
            },
            offs,
            lens,
        };
        (input, t)
    }

    #[test]
    fn raw_literal_run_engine() {
        // one command: 2 literals, match of 4 at a fresh offset of -8,
        // then 2 final literals
        let f = 2 | (2 << 2) | (3 << 6);
        let (input, lzt) = lz_table(&[f], b"xyzw", vec![-8], vec![]);
        let mut out = *b"ABCDEFGH________";
        let mut tmp = [0u8; 16];
        let mut c = Ctx {
            input: &input,
            output: &mut out,
            scratch: &mut tmp,
        };
        process_lz_runs(&mut c, 1, 8, 8, 8, &lzt).unwrap();
        assert_eq!(&out, b"ABCDEFGHxyCDEFzw");
    }

    #[test]
    fn delta_literal_run_engine() {
        // mode 0 literals add onto the byte last_offset back
        let f = 2 | (2 << 2) | (3 << 6);
        let (input, lzt) = lz_table(&[f], &[1, 1, 2, 2], vec![-8], vec![]);
        let mut out = *b"ABCDEFGH________";
        let mut tmp = [0u8; 16];
        let mut c = Ctx {
            input: &input,
            output: &mut out,
            scratch: &mut tmp,
        };
        process_lz_runs(&mut c, 0, 8, 8, 8, &lzt).unwrap();
        assert_eq!(&out, b"ABCDEFGHBCCDEFIJ");
    }

    #[test]
    fn matchlen_escape_reads_len_stream() {
        // matchlen field 15 escapes to the len stream with the +14 bias;
        // a len value of 3 therefore copies 17 bytes
        let f = 0 | (15 << 2) | (3 << 6);
        let (input, lzt) = lz_table(&[f], b"", vec![-8], vec![3]);
        let mut out = [0u8; 8 + 17];
        out[..8].copy_from_slice(b"ABCDEFGH");
        let mut tmp = [0u8; 16];
        let mut c = Ctx {
            input: &input,
            output: &mut out,
            scratch: &mut tmp,
        };
        process_lz_runs(&mut c, 1, 8, 17, 8, &lzt).unwrap();
        // distance 8 repeats the 8-byte history pattern
        assert_eq!(&out[8..16], b"ABCDEFGH");
        assert_eq!(&out[16..24], b"ABCDEFGH");
        assert_eq!(out[24], b'A');
    }

    #[test]
    fn offset_before_window_rejected() {
        let f = 0 | (0 << 2) | (3 << 6);
        let (input, lzt) = lz_table(&[f], b"", vec![-64], vec![]);
        let mut out = [0u8; 16];
        let mut tmp = [0u8; 16];
        let mut c = Ctx {
            input: &input,
            output: &mut out,
            scratch: &mut tmp,
        };
        assert!(matches!(
            process_lz_runs(&mut c, 1, 8, 8, 8, &lzt),
            Err(OozError::OffsetOutOfWindow)
        ));
    }

    #[test]
    fn unconsumed_offsets_rejected() {
        // command stream ends with offsets left over
        let f = 0u8; // litlen 0, matchlen 2, recent slot 0
        let (input, lzt) = lz_table(&[f], &[0, 0, 0, 0, 0, 0], vec![-8], vec![]);
        let mut out = [0u8; 16];
        let mut tmp = [0u8; 16];
        let mut c = Ctx {
            input: &input,
            output: &mut out,
            scratch: &mut tmp,
        };
        assert!(matches!(
            process_lz_runs(&mut c, 1, 8, 8, 8, &lzt),
            Err(OozError::StreamLengthMismatch)
        ));
    }

    #[test]
    fn recent_offset_ring_promotes() {
        // two commands: first loads -8 from the stream, second reuses
        // recent slot 0, consuming no further offsets
        let f1 = 0 | (0 << 2) | (3 << 6);
        let f2 = 0 | (0 << 2) | (0 << 6);
        let (input, lzt) = lz_table(&[f1, f2], b"", vec![-8], vec![]);
        let mut out = [0u8; 12];
        out[..8].copy_from_slice(b"ABCDEFGH");
        let mut tmp = [0u8; 16];
        let mut c = Ctx {
            input: &input,
            output: &mut out,
            scratch: &mut tmp,
        };
        process_lz_runs(&mut c, 1, 8, 4, 8, &lzt).unwrap();
        assert_eq!(&out[8..], b"ABCD");
    }
}
