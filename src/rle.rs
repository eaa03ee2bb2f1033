//! Run-length command decoding
//!
//! An RLE chunk interleaves a forward literal stream with a command
//! stream scanned backward from the chunk's end. Commands either copy
//! literals, emit runs of the current repeat byte, change the repeat
//! byte, or scale up a previous run/copy. The command buffer itself may
//! be entropy coded, flagged by a non-zero first source byte.

use crate::common::{OozError, Result};
use crate::entropy::{self, Ctx, Ptr};

/// Decode one RLE chunk; returns the source bytes consumed.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode(
    ctx: &mut Ctx,
    src: usize,
    src_size: usize,
    mut dst: Ptr,
    dst_size: usize,
    scratch: usize,
    scratch_end: usize,
    depth: u32,
) -> Result<usize> {
    if src_size == 0 {
        return Err(OozError::TruncatedInput);
    }
    if src_size == 1 {
        ctx.memset(dst, ctx.get_u8(Ptr::inp(src))?, dst_size)?;
        return Ok(1);
    }

    let dst_end = dst.pos + dst_size;
    let mut cmd_ptr = Ptr::inp(src + 1);
    let mut cmd_ptr_end = Ptr::inp(src + src_size);

    // unpack the command buffer first?
    if ctx.get_u8(Ptr::inp(src))? != 0 {
        let (n, d) = entropy::decode_bytes(
            ctx,
            Ptr::tmp(scratch),
            src,
            src + src_size,
            scratch_end.saturating_sub(scratch),
            true,
            scratch,
            scratch_end,
            depth + 1,
        )?;
        if n == 0 {
            return Err(OozError::MalformedHeader);
        }
        let cmd_len = src_size - n + d.len;
        if cmd_len > scratch_end.saturating_sub(scratch) {
            return Err(OozError::ScratchExhausted);
        }
        // raw tail bytes follow the decoded part
        ctx.copy(d.at.offset(d.len), Ptr::inp(src + n), src_size - n)?;
        cmd_ptr = d.at;
        cmd_ptr_end = d.at.offset(cmd_len);
    }

    let mut rle_byte = 0u8;

    while cmd_ptr.pos < cmd_ptr_end.pos {
        let cmd = ctx.get_u8(Ptr {
            mem: cmd_ptr_end.mem,
            pos: cmd_ptr_end.pos - 1,
        })? as usize;
        if cmd == 0 || cmd > 0x2F {
            cmd_ptr_end.pos -= 1;
            let bytes_to_copy = !cmd & 0xF;
            let bytes_to_rle = cmd >> 4;
            if bytes_to_copy + bytes_to_rle > dst_end - dst.pos {
                return Err(OozError::DestinationOverflow);
            }
            if bytes_to_copy > cmd_ptr_end.pos - cmd_ptr.pos {
                return Err(OozError::StreamLengthMismatch);
            }
            ctx.copy(dst, cmd_ptr, bytes_to_copy)?;
            cmd_ptr.pos += bytes_to_copy;
            dst.pos += bytes_to_copy;
            ctx.memset(dst, rle_byte, bytes_to_rle)?;
            dst.pos += bytes_to_rle;
        } else if cmd >= 0x10 {
            if cmd_ptr_end.pos - cmd_ptr.pos < 2 {
                return Err(OozError::StreamLengthMismatch);
            }
            cmd_ptr_end.pos -= 2;
            let data = ctx_le16(ctx, cmd_ptr_end)?.wrapping_sub(4096);
            let bytes_to_copy = data & 0x3F;
            let bytes_to_rle = data >> 6;
            if bytes_to_copy + bytes_to_rle > dst_end - dst.pos {
                return Err(OozError::DestinationOverflow);
            }
            if bytes_to_copy > cmd_ptr_end.pos - cmd_ptr.pos {
                return Err(OozError::StreamLengthMismatch);
            }
            ctx.copy(dst, cmd_ptr, bytes_to_copy)?;
            cmd_ptr.pos += bytes_to_copy;
            dst.pos += bytes_to_copy;
            ctx.memset(dst, rle_byte, bytes_to_rle)?;
            dst.pos += bytes_to_rle;
        } else if cmd == 1 {
            rle_byte = ctx.get_u8(cmd_ptr)?;
            cmd_ptr.pos += 1;
            cmd_ptr_end.pos -= 1;
        } else if cmd >= 9 {
            if cmd_ptr_end.pos - cmd_ptr.pos < 2 {
                return Err(OozError::StreamLengthMismatch);
            }
            cmd_ptr_end.pos -= 2;
            let bytes_to_rle = ctx_le16(ctx, cmd_ptr_end)?.wrapping_sub(0x8FF) * 128;
            if bytes_to_rle > dst_end - dst.pos {
                return Err(OozError::DestinationOverflow);
            }
            ctx.memset(dst, rle_byte, bytes_to_rle)?;
            dst.pos += bytes_to_rle;
        } else {
            if cmd_ptr_end.pos - cmd_ptr.pos < 2 {
                return Err(OozError::StreamLengthMismatch);
            }
            cmd_ptr_end.pos -= 2;
            let bytes_to_copy = ctx_le16(ctx, cmd_ptr_end)?.wrapping_sub(511) * 64;
            if bytes_to_copy > cmd_ptr_end.pos - cmd_ptr.pos {
                return Err(OozError::StreamLengthMismatch);
            }
            if bytes_to_copy > dst_end - dst.pos {
                return Err(OozError::DestinationOverflow);
            }
            ctx.copy(dst, cmd_ptr, bytes_to_copy)?;
            dst.pos += bytes_to_copy;
            cmd_ptr.pos += bytes_to_copy;
        }
    }

    if cmd_ptr.pos != cmd_ptr_end.pos {
        return Err(OozError::StreamLengthMismatch);
    }
    if dst.pos != dst_end {
        return Err(OozError::StreamLengthMismatch);
    }

    Ok(src_size)
}

fn ctx_le16(ctx: &Ctx, p: Ptr) -> Result<usize> {
    let lo = ctx.get_u8(p)? as usize;
    let hi = ctx.get_u8(p.offset(1))? as usize;
    Ok(lo | hi << 8)
}
