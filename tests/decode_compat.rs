//! Wire-format compatibility tests
//!
//! These tests hand-assemble container streams byte for byte from the
//! header layouts and check the decoded output exactly, covering the
//! special quanta (uncompressed blocks, memsets, whole matches), the
//! stored/RLE/degenerate-Huffman chunk paths and the malformed-header
//! taxonomy.

use oozlib::{decompress, Decompressor, OozError};

/// Block header: Kraken codec, no flags.
const KRAKEN_BLOCK: [u8; 2] = [0x0C, 0x06];

fn kraken_quantum(payload: &[u8]) -> Vec<u8> {
    // 3-byte quantum header carrying (compressed_size - 1)
    let size = (payload.len() - 1) as u32;
    let mut v = vec![(size >> 16) as u8, (size >> 8) as u8, size as u8];
    v.extend_from_slice(payload);
    v
}

#[test]
fn uncompressed_block_copies_through() {
    let data: Vec<u8> = (0..255u8).collect();
    let mut src = vec![0x4C, 0x06];
    src.extend_from_slice(&data);
    assert_eq!(decompress(&src, data.len()).unwrap(), data);
}

#[test]
fn uncompressed_blocks_reparse_headers_at_256k() {
    // two logical blocks: 256KB + 100 bytes, each behind its own header
    let mut src = vec![0x4C, 0x06];
    src.extend(std::iter::repeat(0x11u8).take(0x40000));
    src.extend_from_slice(&[0x4C, 0x06]);
    src.extend(std::iter::repeat(0x22u8).take(100));

    let out = decompress(&src, 0x40000 + 100).unwrap();
    assert!(out[..0x40000].iter().all(|&b| b == 0x11));
    assert!(out[0x40000..].iter().all(|&b| b == 0x22));
}

#[test]
fn memset_quantum() {
    // special quantum, subfield 1: fill byte travels in the checksum slot
    let mut src = KRAKEN_BLOCK.to_vec();
    src.extend_from_slice(&[0x07, 0xFF, 0xFF, 0x5C]);
    let out = decompress(&src, 1000).unwrap();
    assert!(out.iter().all(|&b| b == 0x5C));
}

#[test]
fn stored_quantum() {
    // compressed_size == quantum size: bytes pass through verbatim
    let payload: Vec<u8> = (0..64u8).collect();
    let mut src = KRAKEN_BLOCK.to_vec();
    src.extend_from_slice(&kraken_quantum(&payload));
    assert_eq!(decompress(&src, 64).unwrap(), payload);
}

#[test]
fn rle_chunk_inside_kraken_quantum() {
    // entropy-only quantum holding one RLE chunk: set the repeat byte,
    // then an extended-run command emits 128 * 3 bytes of it
    let rle = [0x00, 0xEE, 0x02, 0x09, 0x01];
    // long-mode chunk header: type 3, src_size 5, dst_size 384
    let mut payload = vec![0x30, 0x05, 0xFC, 0x00, 0x05];
    payload.extend_from_slice(&rle);

    let mut src = KRAKEN_BLOCK.to_vec();
    src.extend_from_slice(&kraken_quantum(&payload));
    let out = decompress(&src, 384).unwrap();
    assert!(out.iter().all(|&b| b == 0xEE));
}

#[test]
fn single_symbol_huffman_chunk_is_a_memset() {
    // a Huffman table with one symbol (0x5A) has no bitstream body at
    // all; the chunk decodes to that symbol repeated
    let table = [0x00, 0x56, 0x80];
    // long-mode chunk header: type 2, src_size 3, dst_size 64
    let mut payload = vec![0x20, 0x00, 0xFC, 0x00, 0x03];
    payload.extend_from_slice(&table);

    let mut src = KRAKEN_BLOCK.to_vec();
    src.extend_from_slice(&kraken_quantum(&payload));
    let out = decompress(&src, 64).unwrap();
    assert!(out.iter().all(|&b| b == 0x5A));
}

#[test]
fn lzna_whole_match_quantum_repeats_earlier_output() {
    // LZNA-family compact headers: a 16KB memset quantum, then a
    // whole-match quantum repeating it from 16KB back
    let mut src = vec![0x0C, 0x05];
    src.extend_from_slice(&[0x7F, 0xFF, 0x42]); // memset quantum
    src.extend_from_slice(&[0xFF, 0xFF, 0xBF, 0xFF]); // whole match, dist 0x4000

    let out = decompress(&src, 0x8000).unwrap();
    assert!(out.iter().all(|&b| b == 0x42));
}

#[test]
fn whole_match_beyond_history_rejected() {
    // whole match in the very first quantum has no history to copy
    let mut src = vec![0x0C, 0x05];
    src.extend_from_slice(&[0xFF, 0xFF, 0xBF, 0xFF]);
    let mut out = vec![0u8; 0x4000];
    let mut dec = Decompressor::new();
    assert!(matches!(
        dec.decompress_into(&src, &mut out),
        Err(OozError::OffsetOutOfWindow)
    ));
}

#[test]
fn reserved_header_bits_rejected() {
    for first in [0x1C, 0x2C, 0x3C, 0x0D, 0x0E, 0x00] {
        let src = [first, 0x06, 0x00, 0x00, 0x00];
        assert!(decompress(&src, 16).is_err(), "accepted {:#x}", first);
    }
}

#[test]
fn invalid_decoder_types_rejected() {
    for codec in [0u8, 1, 2, 3, 4, 7, 8, 9, 13, 0x7F] {
        let src = [0x0C, codec, 0x00, 0x00, 0x00];
        assert!(matches!(
            decompress(&src, 16),
            Err(OozError::InvalidCodec(c)) if c == codec
        ));
    }
}

#[test]
fn truncation_anywhere_fails_cleanly() {
    // build one valid stream per interesting path, then cut it at every
    // length; every prefix must error, never panic or succeed
    let mut streams: Vec<Vec<u8>> = Vec::new();

    let mut s = vec![0x4C, 0x06];
    s.extend_from_slice(&[9u8; 32]);
    streams.push(s);

    let mut s = KRAKEN_BLOCK.to_vec();
    s.extend_from_slice(&[0x07, 0xFF, 0xFF, 0x5C]);
    streams.push(s);

    let mut payload = vec![0x30, 0x05, 0xFC, 0x00, 0x05];
    payload.extend_from_slice(&[0x00, 0xEE, 0x02, 0x09, 0x01]);
    let mut s = KRAKEN_BLOCK.to_vec();
    s.extend_from_slice(&kraken_quantum(&payload));
    streams.push(s);

    for (si, stream) in streams.iter().enumerate() {
        let full = decompress(stream, expected_len(si)).unwrap();
        for cut in 0..stream.len() {
            let r = decompress(&stream[..cut], full.len());
            assert!(r.is_err(), "stream {} accepted truncation at {}", si, cut);
        }
    }
}

fn expected_len(stream: usize) -> usize {
    match stream {
        0 => 32,
        1 => 1000,
        _ => 384,
    }
}

#[test]
fn bit_flips_never_panic() {
    let mut payload = vec![0x30, 0x05, 0xFC, 0x00, 0x05];
    payload.extend_from_slice(&[0x00, 0xEE, 0x02, 0x09, 0x01]);
    let mut stream = KRAKEN_BLOCK.to_vec();
    stream.extend_from_slice(&kraken_quantum(&payload));

    for byte in 0..stream.len() {
        for bit in 0..8 {
            let mut mutated = stream.clone();
            mutated[byte] ^= 1 << bit;
            // corrupted streams may fail or decode to different bytes;
            // they must never panic or write outside the buffer
            let _ = decompress(&mutated, 384);
        }
    }
}

#[test]
fn wrong_output_length_rejected() {
    let mut src = KRAKEN_BLOCK.to_vec();
    src.extend_from_slice(&[0x07, 0xFF, 0xFF, 0x5C]);
    // stream describes 0x40000 bytes max per quantum; asking for more
    // output than the source provides must fail, not loop
    assert!(decompress(&src, 0x50000).is_err());
}

#[test]
fn hex_fixture_round_trip() {
    // the full memset-quantum stream as a flat fixture
    let src = hex::decode("0c0607ffff5c").unwrap();
    let out = decompress(&src, 256).unwrap();
    assert_eq!(out, vec![0x5C; 256]);
}
