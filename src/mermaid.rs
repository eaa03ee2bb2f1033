//! Mermaid/Selkie LZ decoding
//!
//! Mermaid and Selkie share one on-disk format; only the compressor
//! differs. A quantum again decodes in two phases, but the match copier
//! splits distances into a near stream of 16-bit offsets and per-half
//! far streams of 24/32-bit offsets relative to the half-quantum base,
//! and the command stream is split at a recorded boundary so each 64KB
//! half of the quantum has its own slice of it.
//!
//! Command classes, by flag byte:
//! - `flag >= 24`: bits 0-2 literal count, bits 3-6 match count, bit 7
//!   clear pulls a fresh distance from the near-offset stream.
//! - `flag == 0/1/2`: a long run with its length in the length stream
//!   (byte, extended by `4 * u16` above 251) biased by 64/91/29: a
//!   literal run, a near match, or a far match.
//! - `flag in 3..24`: a far match of length `flag + 5`.
//!
//! Chunk mode 0 applies literals as deltas against the byte at the
//! current match distance; mode 1 copies them verbatim.

use crate::common::{OozError, Result, HALF_BLOCK_SIZE};
use crate::entropy::{self, Ctx, Decoded, Mem, Ptr};

/// Sub-streams of one Mermaid quantum.
#[derive(Debug)]
pub(crate) struct MermaidLzTable {
    pub cmd: Decoded,
    /// Command-stream boundary between the two 64KB halves
    pub cmd_stream_2_offs: usize,
    pub lits: Decoded,
    pub off16: Vec<u16>,
    pub off32_1: Vec<u32>,
    pub off32_2: Vec<u32>,
    /// Cursor of the in-place length stream, an input position
    pub length_stream_pos: usize,
}

/// Decode a far-offset array. Offsets are 24-bit little-endian, extended
/// by a fourth byte above 0xC00000 once the window is deep enough, and
/// each must stay inside the window behind the half-quantum base.
fn decode_far_offsets(
    ctx: &Ctx,
    mut src: usize,
    src_end: usize,
    count: usize,
    window_offset: usize,
) -> Result<(Vec<u32>, usize)> {
    let src_org = src;
    let mut out = Vec::with_capacity(count);
    let extended = window_offset >= 0xC00000 - 1;
    for _ in 0..count {
        if src_end.saturating_sub(src) < 3 {
            return Err(OozError::TruncatedInput);
        }
        let mut off = ctx.get_u8(Ptr::inp(src))? as u32
            | (ctx.get_u8(Ptr::inp(src + 1))? as u32) << 8
            | (ctx.get_u8(Ptr::inp(src + 2))? as u32) << 16;
        src += 3;
        if extended && off >= 0xC00000 {
            if src == src_end {
                return Err(OozError::TruncatedInput);
            }
            off += (ctx.get_u8(Ptr::inp(src))? as u32) << 22;
            src += 1;
        }
        if off as usize > window_offset {
            return Err(OozError::OffsetOutOfWindow);
        }
        out.push(off);
    }
    Ok((out, src - src_org))
}

fn combine_offs16(lo: &[u8], hi: &[u8]) -> Vec<u16> {
    lo.iter()
        .zip(hi)
        .map(|(&l, &h)| l as u16 | (h as u16) << 8)
        .collect()
}

/// Phase one: decode the sub-streams of one quantum.
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
) -> Result<MermaidLzTable> {
    if mode > 1 {
        return Err(OozError::MalformedHeader);
    }
    if src_end.saturating_sub(src) < 10 {
        return Err(OozError::TruncatedInput);
    }

    if offset == 0 {
        ctx.copy(Ptr::out(dst), Ptr::inp(src), 8)?;
        src += 8;
    }

    let limit = |scratch: usize, cap: usize| scratch_end.saturating_sub(scratch).min(cap);

    // literal stream, bounded by the output size
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

    // command stream
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

    // boundary splitting the command stream between the two halves
    let cmd_stream_2_offs;
    if dst_size <= 0x10000 {
        cmd_stream_2_offs = cmd.len;
    } else {
        if src_end.saturating_sub(src) < 2 {
            return Err(OozError::TruncatedInput);
        }
        cmd_stream_2_offs =
            ctx.get_u8(Ptr::inp(src))? as usize | (ctx.get_u8(Ptr::inp(src + 1))? as usize) << 8;
        src += 2;
        if cmd_stream_2_offs > cmd.len {
            return Err(OozError::MalformedHeader);
        }
    }

    if src_end.saturating_sub(src) < 2 {
        return Err(OozError::TruncatedInput);
    }

    let off16_count =
        ctx.get_u8(Ptr::inp(src))? as usize | (ctx.get_u8(Ptr::inp(src + 1))? as usize) << 8;
    let off16;
    if off16_count == 0xFFFF {
        // near offsets split into entropy-coded low and high halves
        src += 2;
        let (n, hi) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, dst_size >> 1),
            false,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        scratch += hi.len;

        let (n, lo) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, dst_size >> 1),
            false,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        scratch += lo.len;

        if lo.len != hi.len {
            return Err(OozError::StreamLengthMismatch);
        }
        off16 = combine_offs16(ctx.stream(lo)?, ctx.stream(hi)?);
    } else {
        src += 2;
        if src_end.saturating_sub(src) < off16_count * 2 {
            return Err(OozError::TruncatedInput);
        }
        let mut v = Vec::with_capacity(off16_count);
        for i in 0..off16_count {
            v.push(
                ctx.get_u8(Ptr::inp(src + 2 * i))? as u16
                    | (ctx.get_u8(Ptr::inp(src + 2 * i + 1))? as u16) << 8,
            );
        }
        src += off16_count * 2;
        off16 = v;
    }

    if src_end.saturating_sub(src) < 3 {
        return Err(OozError::TruncatedInput);
    }
    let packed = ctx.get_u8(Ptr::inp(src))? as usize
        | (ctx.get_u8(Ptr::inp(src + 1))? as usize) << 8
        | (ctx.get_u8(Ptr::inp(src + 2))? as usize) << 16;
    src += 3;

    let off32_1;
    let off32_2;
    if packed != 0 {
        let mut off32_size_1 = packed >> 12;
        let mut off32_size_2 = packed & 0xFFF;
        if off32_size_1 == 4095 {
            if src_end.saturating_sub(src) < 2 {
                return Err(OozError::TruncatedInput);
            }
            off32_size_1 = ctx.get_u8(Ptr::inp(src))? as usize
                | (ctx.get_u8(Ptr::inp(src + 1))? as usize) << 8;
            src += 2;
        }
        if off32_size_2 == 4095 {
            if src_end.saturating_sub(src) < 2 {
                return Err(OozError::TruncatedInput);
            }
            off32_size_2 = ctx.get_u8(Ptr::inp(src))? as usize
                | (ctx.get_u8(Ptr::inp(src + 1))? as usize) << 8;
            src += 2;
        }

        let (v, n) = decode_far_offsets(ctx, src, src_end, off32_size_1, offset)?;
        src += n;
        off32_1 = v;

        let (v, n) = decode_far_offsets(ctx, src, src_end, off32_size_2, offset + 0x10000)?;
        src += n;
        off32_2 = v;
    } else {
        off32_1 = Vec::new();
        off32_2 = Vec::new();
    }

    if src > src_end {
        return Err(OozError::TruncatedInput);
    }

    Ok(MermaidLzTable {
        cmd,
        cmd_stream_2_offs,
        lits,
        off16,
        off32_1,
        off32_2,
        length_stream_pos: src,
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

fn read_length(input: &[u8], pos: &mut usize, src_end: usize) -> Result<usize> {
    if *pos >= src_end {
        return Err(OozError::TruncatedInput);
    }
    let mut l = input[*pos] as usize;
    if l > 251 {
        if src_end - *pos < 3 {
            return Err(OozError::TruncatedInput);
        }
        l += 4 * (input[*pos + 1] as usize | (input[*pos + 2] as usize) << 8);
        *pos += 2;
    }
    *pos += 1;
    Ok(l)
}

/// Phase two: run the command stream over both 64KB halves.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_lz_runs(
    ctx: &mut Ctx,
    mode: u32,
    src_end: usize,
    dst: usize,
    dst_size: usize,
    offset: usize,
    lzt: &MermaidLzTable,
) -> Result<()> {
    let input = ctx.input;
    let scratch = &*ctx.scratch;
    let out = &mut *ctx.output;

    let cmd = resolve(input, scratch, lzt.cmd)?;
    let lit = resolve(input, scratch, lzt.lits)?;

    let window_base = dst - offset;
    let mut saved_dist: i32 = -8;
    let mut lit_i = 0usize;
    let mut off16_i = 0usize;
    let mut length_pos = lzt.length_stream_pos;

    let mut dst = dst;
    let mut remaining = dst_size;
    for iteration in 0..2 {
        let dst_size_cur = remaining.min(0x10000);

        let (cmd_half, off32) = if iteration == 0 {
            (&cmd[..lzt.cmd_stream_2_offs], &lzt.off32_1)
        } else {
            (&cmd[lzt.cmd_stream_2_offs..], &lzt.off32_2)
        };

        let startoff = if offset == 0 && iteration == 0 { 8 } else { 0 };

        run_half(
            out,
            dst,
            dst_size_cur,
            window_base,
            cmd_half,
            lit,
            &mut lit_i,
            &lzt.off16,
            &mut off16_i,
            off32,
            input,
            &mut length_pos,
            src_end,
            &mut saved_dist,
            startoff,
            mode == 0,
        )?;

        dst += dst_size_cur;
        remaining -= dst_size_cur;
        if remaining == 0 {
            break;
        }
    }

    // every stream must be exactly exhausted
    if lit_i != lit.len() || off16_i != lzt.off16.len() || length_pos != src_end {
        return Err(OozError::StreamLengthMismatch);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_half(
    out: &mut [u8],
    half_base: usize,
    dst_size: usize,
    window_base: usize,
    cmd: &[u8],
    lit: &[u8],
    lit_i: &mut usize,
    off16: &[u16],
    off16_i: &mut usize,
    off32: &[u32],
    input: &[u8],
    length_pos: &mut usize,
    src_end: usize,
    saved_dist: &mut i32,
    startoff: usize,
    delta_literals: bool,
) -> Result<()> {
    let dst_end = half_base + dst_size;
    let mut dst = half_base + startoff;
    let mut recent = *saved_dist;
    let mut off32_i = 0usize;

    let copy_literals = |out: &mut [u8],
                             dst: usize,
                             litlen: usize,
                             lit_i: &mut usize,
                             recent: i32|
     -> Result<()> {
        if litlen > dst_end - dst {
            return Err(OozError::DestinationOverflow);
        }
        if litlen > lit.len() - *lit_i {
            return Err(OozError::StreamLengthMismatch);
        }
        if delta_literals {
            let lag = dst as i64 + recent as i64;
            if lag < window_base as i64 {
                return Err(OozError::OffsetOutOfWindow);
            }
            for k in 0..litlen {
                out[dst + k] = lit[*lit_i + k].wrapping_add(out[lag as usize + k]);
            }
        } else {
            out[dst..dst + litlen].copy_from_slice(&lit[*lit_i..*lit_i + litlen]);
        }
        *lit_i += litlen;
        Ok(())
    };

    for &flag in cmd {
        let flag = flag as usize;
        if flag >= 24 {
            let litlen = flag & 7;
            let matchlen = (flag >> 3) & 0xF;

            copy_literals(out, dst, litlen, lit_i, recent)?;
            dst += litlen;

            if flag & 0x80 == 0 {
                // pull a fresh near distance
                let Some(&d) = off16.get(*off16_i) else {
                    return Err(OozError::StreamLengthMismatch);
                };
                *off16_i += 1;
                recent = -(d as i32);
            }

            if recent >= 0 || (-(recent as i64)) as u64 > (dst - window_base) as u64 {
                return Err(OozError::OffsetOutOfWindow);
            }
            if matchlen > dst_end - dst {
                return Err(OozError::DestinationOverflow);
            }
            let copy_from = (dst as i64 + recent as i64) as usize;
            for k in 0..matchlen {
                out[dst + k] = out[copy_from + k];
            }
            dst += matchlen;
        } else if flag > 2 {
            // short far match, length implied by the flag
            let length = flag + 5;
            let Some(&off) = off32.get(off32_i) else {
                return Err(OozError::StreamLengthMismatch);
            };
            off32_i += 1;
            let m = half_base as i64 - off as i64;
            if m < window_base as i64 {
                return Err(OozError::OffsetOutOfWindow);
            }
            recent = (m - dst as i64) as i32;
            if length > dst_end - dst {
                return Err(OozError::DestinationOverflow);
            }
            let m = m as usize;
            for k in 0..length {
                out[dst + k] = out[m + k];
            }
            dst += length;
        } else if flag == 0 {
            let length = read_length(input, length_pos, src_end)? + 64;
            copy_literals(out, dst, length, lit_i, recent)?;
            dst += length;
        } else if flag == 1 {
            let length = read_length(input, length_pos, src_end)? + 91;
            let Some(&d) = off16.get(*off16_i) else {
                return Err(OozError::StreamLengthMismatch);
            };
            *off16_i += 1;
            recent = -(d as i32);
            if (d as u64) > (dst - window_base) as u64 || d == 0 {
                return Err(OozError::OffsetOutOfWindow);
            }
            if length > dst_end - dst {
                return Err(OozError::DestinationOverflow);
            }
            let copy_from = dst - d as usize;
            for k in 0..length {
                out[dst + k] = out[copy_from + k];
            }
            dst += length;
        } else {
            // flag == 2: long far match
            let length = read_length(input, length_pos, src_end)? + 29;
            let Some(&off) = off32.get(off32_i) else {
                return Err(OozError::StreamLengthMismatch);
            };
            off32_i += 1;
            let m = half_base as i64 - off as i64;
            if m < window_base as i64 {
                return Err(OozError::OffsetOutOfWindow);
            }
            recent = (m - dst as i64) as i32;
            if length > dst_end - dst {
                return Err(OozError::DestinationOverflow);
            }
            let m = m as usize;
            for k in 0..length {
                out[dst + k] = out[m + k];
            }
            dst += length;
        }
    }

    if off32_i != off32.len() {
        return Err(OozError::StreamLengthMismatch);
    }

    // trailing literals fill the half exactly
    let final_len = dst_end - dst;
    copy_literals(out, dst, final_len, lit_i, recent)?;

    *saved_dist = recent;
    Ok(())
}

/// Decode one quantum of up to 256KB as two 128KB half-blocks sharing
/// history.
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
        log::debug!("mermaid chunk header {:#x}", chunkhdr);
        let src_used;
        if chunkhdr & 0x800000 == 0 {
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
                let scratch_usage = (2 * dst_count + 32).min(0x40000).min(scratch_len);
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
                process_lz_runs(
                    ctx,
                    mode,
                    src + src_used,
                    dst,
                    dst_count,
                    dst - window_start,
                    &lzt,
                )?;
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
