//! The XPRESS (Huffman variant) compression format.
//!
//! An XPRESS-compressed chunk begins with 256 bytes holding the 4-bit
//! codeword lengths of the 512-symbol alphabet (two lengths per byte, low
//! nibble first). Symbols 0..=255 are literals; symbol `256 + (slot << 4) +
//! len_hdr` encodes a match whose offset is `(1 << slot) | <slot extra
//! bits>` and whose length starts from the 4-bit header, extended through an
//! interleaved byte and, past `0xf + 0xff`, an interleaved 16-bit value.
//! The minimum match length 3 is implicit.

use crate::bits::InputBitstream;
use crate::huffman::{lens_to_codewords, make_decode_table, read_huffsym, CodeBuilder};
use crate::matchfind::{lz_copy, match_len, MatchFinder};
use crate::CodecError;

const NUM_CHARS: usize = 256;
const NUM_SYMS: usize = 512;
const MAX_CODEWORD_LEN: u32 = 15;
const MIN_MATCH_LEN: usize = 3;
/// The longest length the extended 16-bit field can represent, plus the
/// implicit minimum.
const MAX_MATCH_LEN: usize = 0xffff + MIN_MATCH_LEN;
const TABLE_BITS: u32 = 11;
/// Worst-case decode-table entries for (512 syms, 11 table bits, 15 max len).
const DECODE_TABLE_LEN: usize = 2566;

/// Decompressor for XPRESS chunks.
pub struct XpressDecompressor {
    lens: [u8; NUM_SYMS],
    decode_table: Vec<u16>,
}

impl XpressDecompressor {
    pub fn new() -> Self {
        Self {
            lens: [0; NUM_SYMS],
            decode_table: vec![0; DECODE_TABLE_LEN],
        }
    }

    pub fn decompress(&mut self, cdata: &[u8], out: &mut [u8]) -> Result<(), CodecError> {
        if cdata.len() < NUM_SYMS / 2 {
            return Err(CodecError::Corrupt);
        }
        for (i, &b) in cdata[..NUM_SYMS / 2].iter().enumerate() {
            self.lens[i * 2] = b & 0xf;
            self.lens[i * 2 + 1] = b >> 4;
        }
        make_decode_table(
            &mut self.decode_table,
            NUM_SYMS,
            TABLE_BITS,
            &self.lens,
            MAX_CODEWORD_LEN,
        )?;

        let mut is = InputBitstream::new(&cdata[NUM_SYMS / 2..]);
        let mut pos = 0;
        while pos < out.len() {
            let sym = read_huffsym(&mut is, &self.decode_table, TABLE_BITS, MAX_CODEWORD_LEN)
                as usize;
            if sym < NUM_CHARS {
                out[pos] = sym as u8;
                pos += 1;
                continue;
            }

            let mut length = sym & 0xf;
            let offset_high_bit = ((sym >> 4) & 0xf) as u32;
            is.ensure_bits(16);
            let offset = ((1u32 << offset_high_bit) | is.pop_bits(offset_high_bit)) as usize;
            if length == 0xf {
                length += is.read_byte() as usize;
                if length == 0xf + 0xff {
                    length = is.read_u16() as usize;
                }
            }
            length += MIN_MATCH_LEN;

            if offset > pos || length > out.len() - pos {
                return Err(CodecError::Corrupt);
            }
            lz_copy(out, pos, length, offset);
            pos += length;
        }
        Ok(())
    }
}

enum Item {
    Literal(u8),
    Match { length: u32, offset: u32 },
}

/// Compressor for XPRESS chunks: greedy hash-chain parse, then a single
/// canonical code built from the observed symbol frequencies.
pub struct XpressCompressor {
    freqs: [u32; NUM_SYMS],
    lens: [u8; NUM_SYMS],
    codewords: [u32; NUM_SYMS],
    code_builder: CodeBuilder,
    items: Vec<Item>,
    mf: MatchFinder,
}

impl XpressCompressor {
    pub fn new(max_chunk_size: u32) -> Self {
        Self {
            freqs: [0; NUM_SYMS],
            lens: [0; NUM_SYMS],
            codewords: [0; NUM_SYMS],
            code_builder: CodeBuilder::new(NUM_SYMS),
            items: Vec::with_capacity(max_chunk_size as usize / 4),
            mf: MatchFinder::new(max_chunk_size as usize),
        }
    }

    pub fn compress(&mut self, input: &[u8], out: &mut [u8]) -> Option<usize> {
        // The lengths header alone is 256 bytes.
        if input.len() <= NUM_SYMS / 2 + 4 {
            return None;
        }

        self.freqs.fill(0);
        self.items.clear();
        self.mf.reset();

        let mut pos = 0;
        while pos < input.len() {
            let max_len = MAX_MATCH_LEN.min(input.len() - pos);
            match self.mf.find_match(input, pos, 0, MIN_MATCH_LEN, max_len) {
                Some((length, offset)) => {
                    let len_hdr = (length - MIN_MATCH_LEN).min(0xf);
                    let slot = (offset as u32).ilog2() as usize;
                    self.freqs[NUM_CHARS + (slot << 4) + len_hdr] += 1;
                    self.items.push(Item::Match {
                        length: length as u32,
                        offset: offset as u32,
                    });
                    for p in pos..pos + length {
                        self.mf.insert(input, p);
                    }
                    pos += length;
                }
                None => {
                    self.freqs[input[pos] as usize] += 1;
                    self.items.push(Item::Literal(input[pos]));
                    self.mf.insert(input, pos);
                    pos += 1;
                }
            }
        }
        // Chunk terminator symbol; decoders stop on output size, but the
        // format always carries it.
        self.freqs[NUM_CHARS] += 1;

        self.code_builder
            .build_lens(&self.freqs, MAX_CODEWORD_LEN, &mut self.lens);
        lens_to_codewords(&self.lens, &mut self.codewords);

        if out.len() < NUM_SYMS / 2 {
            return None;
        }
        let (header, body) = out.split_at_mut(NUM_SYMS / 2);
        for (i, b) in header.iter_mut().enumerate() {
            *b = self.lens[i * 2] | (self.lens[i * 2 + 1] << 4);
        }

        let mut os = XpressOutput::new(body);
        for item in &self.items {
            match *item {
                Item::Literal(b) => {
                    os.write_sym(self.codewords[b as usize], self.lens[b as usize] as u32);
                }
                Item::Match { length, offset } => {
                    let length = length as usize;
                    let len_hdr = (length - MIN_MATCH_LEN).min(0xf);
                    let slot = offset.ilog2();
                    let sym = NUM_CHARS + ((slot as usize) << 4) + len_hdr;
                    os.write_sym(self.codewords[sym], self.lens[sym] as u32);
                    os.write_offset_bits(offset & !(1 << slot), slot);
                    if len_hdr == 0xf {
                        let adjusted = length - MIN_MATCH_LEN;
                        if adjusted < 0xf + 0xff {
                            os.write_byte((adjusted - 0xf) as u8);
                        } else {
                            os.write_byte(0xff);
                            os.write_u16(adjusted as u16);
                        }
                    }
                }
            }
        }
        os.write_sym(
            self.codewords[NUM_CHARS],
            self.lens[NUM_CHARS] as u32,
        );

        let body_len = os.flush()?;
        let total = NUM_SYMS / 2 + body_len;
        if total < input.len() {
            Some(total)
        } else {
            None
        }
    }
}

/// XPRESS output stream: 16-bit coding units interleaved with literal bytes.
///
/// The decompressor prefetches coding units ahead of the bytes it reads, so
/// the positions of the units in the output depend on when the *reader* will
/// demand them, not on when the writer produces the bits. This writer tracks
/// the reader's buffered-bit count and reserves each unit's position at the
/// moment the reader's `ensure_bits` would fetch it.
struct XpressOutput<'a> {
    out: &'a mut [u8],
    /// Next unreserved output byte.
    pos: usize,
    /// Reserved-but-unfilled unit positions, oldest first. `usize::MAX`
    /// marks a slot reserved past the end of the buffer.
    slots: std::collections::VecDeque<usize>,
    bitbuf: u32,
    bitcount: u32,
    /// The reader's number of buffered bits at this point of the stream.
    reader_bitsleft: u32,
    overflow: bool,
}

impl<'a> XpressOutput<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self {
            out,
            pos: 0,
            slots: std::collections::VecDeque::with_capacity(4),
            bitbuf: 0,
            bitcount: 0,
            reader_bitsleft: 0,
            overflow: false,
        }
    }

    fn reserve_unit(&mut self) {
        if self.pos + 2 <= self.out.len() {
            self.slots.push_back(self.pos);
        } else {
            self.slots.push_back(usize::MAX);
            self.overflow = true;
        }
        self.pos += 2;
        self.reader_bitsleft += 16;
    }

    fn ensure(&mut self, num_bits: u32) {
        while self.reader_bitsleft < num_bits {
            self.reserve_unit();
        }
    }

    fn put_bits(&mut self, bits: u32, num_bits: u32) {
        self.bitbuf = (self.bitbuf << num_bits) | bits;
        self.bitcount += num_bits;
        self.reader_bitsleft -= num_bits;
        while self.bitcount >= 16 {
            self.bitcount -= 16;
            let unit = (self.bitbuf >> self.bitcount) as u16;
            self.fill_slot(unit);
        }
    }

    fn fill_slot(&mut self, unit: u16) {
        let slot = self.slots.pop_front().expect("unit written before reserved");
        if slot != usize::MAX {
            self.out[slot..slot + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    /// Writes a Huffman codeword; the reader ensures 15 bits before peeking.
    fn write_sym(&mut self, codeword: u32, len: u32) {
        self.ensure(MAX_CODEWORD_LEN);
        self.put_bits(codeword, len);
    }

    /// Writes offset extra bits; the reader ensures 16 bits first.
    fn write_offset_bits(&mut self, bits: u32, num_bits: u32) {
        self.ensure(16);
        self.put_bits(bits, num_bits);
    }

    fn write_byte(&mut self, b: u8) {
        if self.pos < self.out.len() {
            self.out[self.pos] = b;
        } else {
            self.overflow = true;
        }
        self.pos += 1;
    }

    fn write_u16(&mut self, v: u16) {
        if self.pos + 2 <= self.out.len() {
            self.out[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        } else {
            self.overflow = true;
        }
        self.pos += 2;
    }

    fn flush(mut self) -> Option<usize> {
        if self.bitcount > 0 {
            let unit = (self.bitbuf << (16 - self.bitcount)) as u16;
            self.fill_slot(unit);
        }
        // Any remaining reserved slots were prefetched by the reader model
        // but never filled with data bits; zero them.
        while let Some(slot) = self.slots.pop_front() {
            if slot != usize::MAX {
                self.out[slot..slot + 2].fill(0);
            }
        }
        if self.overflow {
            None
        } else {
            Some(self.pos)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) -> Option<Vec<u8>> {
        let mut c = XpressCompressor::new(crate::WIM_CHUNK_SIZE);
        let mut out = vec![0u8; data.len()];
        let n = c.compress(data, &mut out)?;
        assert!(n < data.len());
        let mut d = XpressDecompressor::new();
        let mut back = vec![0u8; data.len()];
        d.decompress(&out[..n], &mut back).unwrap();
        Some(back)
    }

    #[test]
    fn zeros_chunk_compresses() {
        let data = vec![0u8; 32768];
        let back = roundtrip(&data).expect("zeros must compress");
        assert_eq!(back, data);
    }

    #[test]
    fn text_roundtrips() {
        let data: Vec<u8> = (0..400)
            .flat_map(|i| format!("line {i}: the quick brown fox\n").into_bytes())
            .collect();
        let back = roundtrip(&data).expect("text must compress");
        assert_eq!(back, data);
    }

    #[test]
    fn long_match_uses_u16_extension() {
        // One long run forces a match length beyond 0xf + 0xff.
        let mut data = vec![0u8; 2048];
        data[0] = 7;
        let back = roundtrip(&data).expect("run must compress");
        assert_eq!(back, data);
    }

    #[test]
    fn incompressible_returns_none() {
        use rand::{RngCore, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut data = vec![0u8; 4096];
        rng.fill_bytes(&mut data);
        let mut c = XpressCompressor::new(crate::WIM_CHUNK_SIZE);
        let mut out = vec![0u8; data.len()];
        assert!(c.compress(&data, &mut out).is_none());
    }

    #[test]
    fn tiny_input_not_compressed() {
        let mut c = XpressCompressor::new(crate::WIM_CHUNK_SIZE);
        let mut out = vec![0u8; 64];
        assert!(c.compress(b"hello", &mut out).is_none());
    }
}
