//! Leviathan LZ decoding
//!
//! Leviathan shares the Kraken two-phase shape but widens both ends: the
//! command byte carries a 3-bit recent-offset index and a 3-bit match
//! length, the length stream is consumed from the front for literal runs
//! and from the back for match escapes, literals may be split across up
//! to 16 prediction lanes selected by output position, and the command
//! stream itself may be split into 8 position-selected lanes.
//!
//! The six literal strategies are a closed set chosen once per chunk:
//! verbatim copy, delta against the last match distance (plus the
//! last-added-match variant), position-masked delta over 4 or 16 lanes,
//! and an order-1 model keyed on the high nibble of the previous byte.

use crate::common::{OozError, Result, HALF_BLOCK_SIZE};
use crate::entropy::{self, Ctx, Decoded, Mem, Ptr};
use crate::kraken;

/// Sub-streams of one Leviathan quantum.
#[derive(Debug)]
pub(crate) struct LeviathanLzTable {
    pub offs: Vec<i32>,
    pub lens: Vec<i32>,
    pub lits: Vec<Decoded>,
    pub cmd: Option<Decoded>,
    pub multi_cmd: Vec<Decoded>,
    pub cmd_stream_size: usize,
}

/// Literal-copy strategy, selected by the chunk type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiteralMode {
    Sub,
    Raw,
    LamSub,
    SubAnd3,
    O1,
    SubAndF,
}

impl LiteralMode {
    fn from_chunk_type(chunk_type: u32) -> Result<(Self, usize)> {
        // mode and its literal lane count
        Ok(match chunk_type {
            0 => (LiteralMode::Sub, 1),
            1 => (LiteralMode::Raw, 1),
            2 => (LiteralMode::LamSub, 2),
            3 => (LiteralMode::SubAnd3, 4),
            4 => (LiteralMode::O1, 16),
            5 => (LiteralMode::SubAndF, 16),
            _ => return Err(OozError::MalformedHeader),
        })
    }
}

/// Phase one: decode offsets, lengths, literal lanes and commands.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_lz_table(
    ctx: &mut Ctx,
    chunk_type: u32,
    mut src: usize,
    src_end: usize,
    dst: usize,
    dst_size: usize,
    offset: usize,
    mut scratch: usize,
    scratch_end: usize,
) -> Result<LeviathanLzTable> {
    if chunk_type > 5 {
        return Err(OozError::MalformedHeader);
    }
    if src_end.saturating_sub(src) < 13 {
        return Err(OozError::TruncatedInput);
    }

    if offset == 0 {
        ctx.copy(Ptr::out(dst), Ptr::inp(src), 8)?;
        src += 8;
    }

    let limit = |scratch: usize, cap: usize| scratch_end.saturating_sub(scratch).min(cap);

    let mut offs_scaling: i32 = 0;
    let mut packed_offs_extra: Option<Decoded> = None;
    let offs_stream_limit = dst_size / 3;

    let packed_offs;
    if ctx.get_u8(Ptr::inp(src))? & 0x80 == 0 {
        // packed offset stream, bounded by the command count
        let (n, d) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, offs_stream_limit),
            false,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        scratch += d.len;
        packed_offs = d;
    } else {
        // distances use two tables: offs * scale - low_bits
        offs_scaling = ctx.get_u8(Ptr::inp(src))? as i32 - 127;
        src += 1;

        let (n, d) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, offs_stream_limit),
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
                limit(scratch, offs_stream_limit),
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
    }

    // length stream, bounded by a fifth of the output
    let (n, packed_len) = entropy::decode_bytes(
        ctx,
        Ptr::tmp(scratch),
        src,
        src_end,
        limit(scratch, dst_size / 5),
        false,
        scratch,
        scratch_end,
        0,
    )?;
    src += n;
    scratch += packed_len.len;

    // room for the unpacked 32-bit arrays
    let mut needed = (scratch + 15) & !15;
    needed += packed_offs.len * 4;
    needed = (needed + 15) & !15;
    needed += packed_len.len * 4;
    if needed > scratch_end {
        return Err(OozError::ScratchExhausted);
    }

    let (_, lane_count) = LiteralMode::from_chunk_type(chunk_type)?;

    let mut lits: Vec<Decoded> = Vec::new();
    let lit_total;
    if chunk_type <= 1 {
        let (n, d) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, dst_size),
            true,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        lit_total = d.len;
        lits.push(d);
    } else {
        let (n, total) = entropy::decode_multi_array(
            ctx,
            src,
            src_end,
            Ptr::tmp(scratch),
            scratch_end,
            &mut lits,
            lane_count,
            true,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        lit_total = total;
    }
    scratch += lit_total;

    if src >= src_end {
        return Err(OozError::TruncatedInput);
    }

    let mut cmd: Option<Decoded> = None;
    let mut multi_cmd: Vec<Decoded> = Vec::new();
    let cmd_stream_size;
    if ctx.get_u8(Ptr::inp(src))? & 0x80 == 0 {
        let (n, d) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src_end,
            limit(scratch, dst_size),
            true,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        cmd_stream_size = d.len;
        scratch += d.len;
        cmd = Some(d);
    } else {
        if ctx.get_u8(Ptr::inp(src))? != 0x83 {
            return Err(OozError::MalformedHeader);
        }
        src += 1;
        let (n, total) = entropy::decode_multi_array(
            ctx,
            src,
            src_end,
            Ptr::tmp(scratch),
            scratch_end,
            &mut multi_cmd,
            8,
            true,
            scratch,
            scratch_end,
            0,
        )?;
        src += n;
        cmd_stream_size = total;
        scratch += total;
    }

    if dst_size > scratch_end.saturating_sub(scratch) {
        return Err(OozError::ScratchExhausted);
    }

    let (offs, lens) = kraken::unpack_offsets(
        ctx,
        src,
        src_end,
        packed_offs,
        packed_offs_extra,
        offs_scaling,
        packed_len,
        false,
    )?;

    Ok(LeviathanLzTable {
        offs,
        lens,
        lits,
        cmd,
        multi_cmd,
        cmd_stream_size,
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

/// Phase two: run the command stream.
pub(crate) fn process_lz_runs(
    ctx: &mut Ctx,
    chunk_type: u32,
    dst: usize,
    dst_size: usize,
    offset: usize,
    lzt: &LeviathanLzTable,
) -> Result<()> {
    let input = ctx.input;
    let scratch = &*ctx.scratch;
    let out = &mut *ctx.output;

    let (mode, lane_count) = LiteralMode::from_chunk_type(chunk_type)?;
    if lzt.lits.len() < lane_count {
        return Err(OozError::StreamLengthMismatch);
    }
    let mut lanes: Vec<&[u8]> = Vec::with_capacity(lane_count);
    for d in &lzt.lits[..lane_count] {
        lanes.push(resolve(input, scratch, *d)?);
    }

    let cmd_single = match lzt.cmd {
        Some(d) => Some(resolve(input, scratch, d)?),
        None => None,
    };
    let mut cmd_lanes: Vec<&[u8]> = Vec::with_capacity(lzt.multi_cmd.len());
    for d in &lzt.multi_cmd {
        cmd_lanes.push(resolve(input, scratch, *d)?);
    }
    if cmd_single.is_none() && cmd_lanes.len() != 8 {
        return Err(OozError::StreamLengthMismatch);
    }

    let engine = Engine {
        mode,
        lanes,
        cmd_single,
        cmd_lanes,
        cmd_total: lzt.cmd_stream_size,
        offs: &lzt.offs,
        lens: &lzt.lens,
    };
    engine.run(
        out,
        dst + if offset == 0 { 8 } else { 0 },
        dst,
        dst + dst_size,
        dst - offset,
    )
}

struct Engine<'a> {
    mode: LiteralMode,
    lanes: Vec<&'a [u8]>,
    cmd_single: Option<&'a [u8]>,
    cmd_lanes: Vec<&'a [u8]>,
    cmd_total: usize,
    offs: &'a [i32],
    lens: &'a [i32],
}

struct LitState {
    pos: [usize; 16],
    next: [u8; 16],
}

impl Engine<'_> {
    fn run(
        &self,
        out: &mut [u8],
        mut dst: usize,
        quantum_base: usize,
        dst_end: usize,
        window_base: usize,
    ) -> Result<()> {
        let mut recent = [0i32; 16];
        recent[8..15].fill(-8);
        let mut offset: i32 = -8;

        let match_zone_end = if dst_end - quantum_base >= 16 {
            dst_end - 16
        } else {
            quantum_base
        };

        let mut lit = LitState {
            pos: [0; 16],
            next: [0; 16],
        };
        if self.mode == LiteralMode::O1 {
            // the order-1 lanes run one byte ahead
            for (i, lane) in self.lanes.iter().enumerate() {
                lit.next[i] = lane.first().copied().unwrap_or(0);
                lit.pos[i] = 1;
            }
        }

        let mut len_i = 0usize;
        let mut len_end = self.lens.len();
        let mut offs_i = 0usize;

        let mut cmd_i = 0usize;
        let mut cmd_left = self.cmd_total;
        let mut cmd_lane_pos = [0usize; 8];

        loop {
            let cmd;
            if let Some(cmd_stream) = self.cmd_single {
                if cmd_i >= cmd_stream.len() {
                    break;
                }
                cmd = cmd_stream[cmd_i] as u32;
                cmd_i += 1;
            } else {
                if cmd_left == 0 {
                    break;
                }
                cmd_left -= 1;
                let lane = dst.wrapping_sub(quantum_base) & 7;
                let p = cmd_lane_pos[lane];
                cmd = self.cmd_lanes[lane].get(p).copied().unwrap_or(0) as u32;
                cmd_lane_pos[lane] = p + 1;
            }

            let offs_index = (cmd >> 5) as usize;
            let mut matchlen = ((cmd & 7) + 2) as usize;

            recent[15] = self.offs.get(offs_i).copied().unwrap_or(0);

            dst = self.copy_literals(
                cmd,
                out,
                dst,
                dst_end,
                &mut len_i,
                len_end,
                match_zone_end,
                offset,
                quantum_base,
                window_base,
                &mut lit,
            )?;

            offset = recent[offs_index + 8];
            recent.copy_within(offs_index..offs_index + 8, offs_index + 1);
            recent[8] = offset;
            if offs_index == 7 {
                offs_i += 1;
            }

            if offset >= 0 || (-(offset as i64)) as u64 > (dst - window_base) as u64 {
                return Err(OozError::OffsetOutOfWindow);
            }
            let copy_from = (dst as i64 + offset as i64) as usize;

            if matchlen == 9 {
                if len_i >= len_end {
                    return Err(OozError::StreamLengthMismatch);
                }
                len_end -= 1;
                // match lengths escape to the back of the length stream
                matchlen = self.lens[len_end] as usize + 6;
            }
            if matchlen > dst_end - dst {
                return Err(OozError::DestinationOverflow);
            }
            for k in 0..matchlen {
                out[dst + k] = out[copy_from + k];
            }
            dst += matchlen;
        }

        if offs_i != self.offs.len() || len_i != len_end {
            return Err(OozError::StreamLengthMismatch);
        }

        if dst < dst_end {
            self.copy_final_literals(out, dst, dst_end, offset, quantum_base, window_base, &mut lit)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_literals(
        &self,
        cmd: u32,
        out: &mut [u8],
        mut dst: usize,
        dst_end: usize,
        len_i: &mut usize,
        len_end: usize,
        match_zone_end: usize,
        last_offset: i32,
        quantum_base: usize,
        window_base: usize,
        lit: &mut LitState,
    ) -> Result<usize> {
        match self.mode {
            LiteralMode::Raw | LiteralMode::Sub => {
                let mut litlen = ((cmd >> 3) & 3) as usize;
                if litlen == 3 {
                    if *len_i >= len_end {
                        return Err(OozError::StreamLengthMismatch);
                    }
                    litlen = (self.lens[*len_i] & 0xffffff) as usize;
                    *len_i += 1;
                    if litlen > 24 && litlen > match_zone_end.saturating_sub(dst) {
                        return Err(OozError::DestinationOverflow);
                    }
                }
                self.bulk_literals(out, dst, dst_end, litlen, last_offset, window_base, lit)?;
                dst += litlen;
            }
            LiteralMode::LamSub => {
                let lit_cmd = cmd & 0x18;
                if lit_cmd == 0 {
                    return Ok(dst);
                }
                let mut litlen = (lit_cmd >> 3) as usize;
                if litlen == 3 {
                    if *len_i >= len_end {
                        return Err(OozError::StreamLengthMismatch);
                    }
                    litlen = (self.lens[*len_i] & 0xffffff) as usize;
                    *len_i += 1;
                }
                if litlen == 0 {
                    // this mode spends one literal on the last-added match
                    return Err(OozError::StreamLengthMismatch);
                }
                litlen -= 1;
                if litlen > 24 && litlen > match_zone_end.saturating_sub(dst + 1) {
                    return Err(OozError::DestinationOverflow);
                }
                let lag = self.lag(dst, last_offset, window_base)?;
                let b = self.pop_lane(lit, 1)?;
                if dst >= dst_end {
                    return Err(OozError::DestinationOverflow);
                }
                out[dst] = b.wrapping_add(out[lag]);
                dst += 1;
                self.bulk_literals(out, dst, dst_end, litlen, last_offset, window_base, lit)?;
                dst += litlen;
            }
            LiteralMode::SubAnd3 | LiteralMode::SubAndF => {
                let mask = if self.mode == LiteralMode::SubAnd3 { 3 } else { 15 };
                let lit_cmd = cmd & 0x18;
                if lit_cmd == 0x18 {
                    if *len_i >= len_end {
                        return Err(OozError::StreamLengthMismatch);
                    }
                    let litlen = (self.lens[*len_i] & 0xffffff) as usize;
                    *len_i += 1;
                    if litlen > match_zone_end.saturating_sub(dst) {
                        return Err(OozError::DestinationOverflow);
                    }
                    for _ in 0..litlen {
                        dst = self.masked_literal(out, dst, dst_end, last_offset, quantum_base, window_base, mask, lit)?;
                    }
                } else if lit_cmd != 0 {
                    dst = self.masked_literal(out, dst, dst_end, last_offset, quantum_base, window_base, mask, lit)?;
                    if lit_cmd == 0x10 {
                        dst = self.masked_literal(out, dst, dst_end, last_offset, quantum_base, window_base, mask, lit)?;
                    }
                }
            }
            LiteralMode::O1 => {
                let lit_cmd = cmd & 0x18;
                if lit_cmd == 0x18 {
                    if *len_i >= len_end {
                        return Err(OozError::StreamLengthMismatch);
                    }
                    let litlen = self.lens[*len_i];
                    *len_i += 1;
                    if litlen <= 0 {
                        return Err(OozError::StreamLengthMismatch);
                    }
                    for _ in 0..litlen {
                        dst = self.order1_literal(out, dst, dst_end, lit)?;
                    }
                } else if lit_cmd != 0 {
                    dst = self.order1_literal(out, dst, dst_end, lit)?;
                    if lit_cmd == 0x10 {
                        dst = self.order1_literal(out, dst, dst_end, lit)?;
                    }
                }
            }
        }
        Ok(dst)
    }

    /// Run of literals from lane 0, raw or delta depending on mode.
    #[allow(clippy::too_many_arguments)]
    fn bulk_literals(
        &self,
        out: &mut [u8],
        dst: usize,
        dst_end: usize,
        litlen: usize,
        last_offset: i32,
        window_base: usize,
        lit: &mut LitState,
    ) -> Result<()> {
        if litlen == 0 {
            return Ok(());
        }
        if litlen > dst_end - dst {
            return Err(OozError::DestinationOverflow);
        }
        let lane = self.lanes[0];
        let p = lit.pos[0];
        if litlen > lane.len().saturating_sub(p) {
            return Err(OozError::StreamLengthMismatch);
        }
        if self.mode == LiteralMode::Raw {
            out[dst..dst + litlen].copy_from_slice(&lane[p..p + litlen]);
        } else {
            let lag = self.lag(dst, last_offset, window_base)?;
            for k in 0..litlen {
                out[dst + k] = lane[p + k].wrapping_add(out[lag + k]);
            }
        }
        lit.pos[0] = p + litlen;
        Ok(())
    }

    fn lag(&self, dst: usize, last_offset: i32, window_base: usize) -> Result<usize> {
        let lag = dst as i64 + last_offset as i64;
        if lag < window_base as i64 {
            return Err(OozError::OffsetOutOfWindow);
        }
        Ok(lag as usize)
    }

    fn pop_lane(&self, lit: &mut LitState, lane: usize) -> Result<u8> {
        let p = lit.pos[lane];
        let Some(&b) = self.lanes[lane].get(p) else {
            return Err(OozError::StreamLengthMismatch);
        };
        lit.pos[lane] = p + 1;
        Ok(b)
    }

    #[allow(clippy::too_many_arguments)]
    fn masked_literal(
        &self,
        out: &mut [u8],
        dst: usize,
        dst_end: usize,
        last_offset: i32,
        quantum_base: usize,
        window_base: usize,
        mask: usize,
        lit: &mut LitState,
    ) -> Result<usize> {
        if dst >= dst_end {
            return Err(OozError::DestinationOverflow);
        }
        let lane = dst.wrapping_sub(quantum_base) & mask;
        let b = self.pop_lane(lit, lane)?;
        let lag = self.lag(dst, last_offset, window_base)?;
        out[dst] = b.wrapping_add(out[lag]);
        Ok(dst + 1)
    }

    fn order1_literal(
        &self,
        out: &mut [u8],
        dst: usize,
        dst_end: usize,
        lit: &mut LitState,
    ) -> Result<usize> {
        if dst >= dst_end {
            return Err(OozError::DestinationOverflow);
        }
        let context = out[dst - 1] as usize;
        let slot = context >> 4;
        let b = lit.next[slot];
        out[dst] = b;
        let p = lit.pos[slot];
        lit.next[slot] = self.lanes[slot].get(p).copied().unwrap_or(0);
        lit.pos[slot] = p + 1;
        Ok(dst + 1)
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_final_literals(
        &self,
        out: &mut [u8],
        mut dst: usize,
        dst_end: usize,
        last_offset: i32,
        quantum_base: usize,
        window_base: usize,
        lit: &mut LitState,
    ) -> Result<()> {
        match self.mode {
            LiteralMode::Raw | LiteralMode::Sub => {
                self.bulk_literals(out, dst, dst_end, dst_end - dst, last_offset, window_base, lit)?;
            }
            LiteralMode::LamSub => {
                let lag = self.lag(dst, last_offset, window_base)?;
                let b = self.pop_lane(lit, 1)?;
                out[dst] = b.wrapping_add(out[lag]);
                dst += 1;
                self.bulk_literals(out, dst, dst_end, dst_end - dst, last_offset, window_base, lit)?;
            }
            LiteralMode::SubAnd3 | LiteralMode::SubAndF => {
                let mask = if self.mode == LiteralMode::SubAnd3 { 3 } else { 15 };
                while dst < dst_end {
                    dst = self.masked_literal(out, dst, dst_end, last_offset, quantum_base, window_base, mask, lit)?;
                }
            }
            LiteralMode::O1 => {
                while dst < dst_end {
                    dst = self.order1_literal(out, dst, dst_end, lit)?;
                }
            }
        }
        Ok(())
    }
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
        log::debug!("leviathan chunk header {:#x}", chunkhdr);
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
            let chunk_type = ((chunkhdr >> 19) & 0xF) as u32;
            if src_end.saturating_sub(src) < src_used {
                return Err(OozError::TruncatedInput);
            }
            if src_used < dst_count {
                let scratch_usage = (3 * dst_count + 32 + 0xD000).min(0x6C000).min(scratch_len);
                let lzt = read_lz_table(
                    ctx,
                    chunk_type,
                    src,
                    src + src_used,
                    dst,
                    dst_count,
                    dst - window_start,
                    0,
                    scratch_usage,
                )?;
                process_lz_runs(ctx, chunk_type, dst, dst_count, dst - window_start, &lzt)?;
            } else if src_used > dst_count || chunk_type != 0 {
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
