//! oozlib - decompressor for the Kraken block-compression family
//!
//! This crate implements decompression for a family of proprietary
//! block-compression formats sharing one container: Kraken, Mermaid and
//! Selkie, Leviathan, Bitknit and LZNA. The container splits output into
//! 256KB logical blocks of quanta; each quantum is entropy decoded
//! (Huffman, tANS, RLE or raw) into literal/command/offset/length
//! streams, then an LZ run engine replays them against the full decoded
//! window. Input is treated as untrusted: every malformed stream surfaces
//! as an error, never a panic or an out-of-bounds access.
//!
//! Compression is out of scope; this is a decoder only.
//!
//! # Example
//!
//! ```no_run
//! let compressed = std::fs::read("data.kraken")?;
//! let decompressed = oozlib::decompress(&compressed, 0x10000)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Reuse a [`Decompressor`] to amortize its scratch arena across calls:
//!
//! ```
//! use oozlib::Decompressor;
//!
//! let mut dec = Decompressor::new();
//! let mut out = vec![0u8; 16];
//! // a block flagged uncompressed is copied through verbatim
//! let mut src = vec![0x4C, 0x06];
//! src.extend_from_slice(b"sixteen raw byte");
//! dec.decompress_into(&src, &mut out)?;
//! assert_eq!(&out, b"sixteen raw byte");
//! # Ok::<(), oozlib::OozError>(())
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod common;
pub mod decoder;
pub mod error;

mod bitknit;
mod bits;
mod entropy;
mod huffman;
mod kraken;
mod leviathan;
mod lzna;
mod mermaid;
mod rice;
mod rle;
mod tables;
mod tans;

pub use common::{
    BlockHeader, CodecKind, OozError, QuantumHeader, Result, BLOCK_SIZE, SCRATCH_SIZE,
};
pub use decoder::Decompressor;

/// Decompress `src` into a new buffer of exactly `dst_len` bytes.
///
/// The caller supplies the uncompressed length; the container does not
/// carry it. Fails on any malformed input, on trailing source bytes and
/// on streams that produce the wrong amount of output.
pub fn decompress(src: &[u8], dst_len: usize) -> Result<Vec<u8>> {
    let mut dec = Decompressor::new();
    let mut out = vec![0u8; dst_len];
    dec.decompress_into(src, &mut out)?;
    Ok(out)
}
