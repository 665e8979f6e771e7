//! The LZX compression format, as used in WIM resources.
//!
//! Each chunk is an independent LZX bitstream of one or more blocks. A block
//! is VERBATIM (Huffman-coded literals and matches), ALIGNED (adds an 8-entry
//! aligned-offsets code for the low three offset bits), or UNCOMPRESSED
//! (byte-aligned raw data preceded by replacement values for the three-entry
//! recent-offset queue). Codeword lengths for the main and length alphabets
//! are transmitted as deltas against the previous lengths, themselves
//! Huffman-coded via a 20-symbol pretree with run-length codes 17/18/19.
//!
//! Before compression, `CALL rel32` (0xE8) operands are rewritten from
//! relative to pseudo-absolute form against a fixed magic file size;
//! decompression reverses the rewrite.

use crate::bits::{InputBitstream, OutputBitstream};
use crate::huffman::{lens_to_codewords, make_decode_table, read_huffsym, CodeBuilder};
use crate::matchfind::{lz_copy, match_len, MatchFinder};
use crate::CodecError;

const MIN_MATCH_LEN: usize = 2;
const MAX_MATCH_LEN: usize = 257;
const NUM_CHARS: usize = 256;
const NUM_PRIMARY_LENS: usize = 7;
const NUM_LEN_SYMS: usize = 249;
const NUM_PRETREE_SYMS: usize = 20;
const NUM_ALIGNED_SYMS: usize = 8;
const OFFSET_ADJUSTMENT: u32 = 2;
const DEFAULT_BLOCK_SIZE: usize = 32768;

const BLOCKTYPE_VERBATIM: u32 = 1;
const BLOCKTYPE_ALIGNED: u32 = 2;
const BLOCKTYPE_UNCOMPRESSED: u32 = 3;

const MAX_MAIN_SYMS: usize = NUM_CHARS + 8 * MAX_OFFSET_SLOTS;
const MAX_OFFSET_SLOTS: usize = 50;

const MAX_MAIN_CODEWORD_LEN: u32 = 16;
const MAX_LEN_CODEWORD_LEN: u32 = 16;
const MAX_PRE_CODEWORD_LEN: u32 = 15;
const MAX_ALIGNED_CODEWORD_LEN: u32 = 7;

const MAIN_TABLE_BITS: u32 = 11;
const LEN_TABLE_BITS: u32 = 10;
const PRE_TABLE_BITS: u32 = 6;
const ALIGNED_TABLE_BITS: u32 = 7;

/// Worst-case decode-table sizes for the alphabets above.
const MAIN_TABLE_LEN: usize = 2726;
const LEN_TABLE_LEN: usize = 1326;
const PRE_TABLE_LEN: usize = 582;
const ALIGNED_TABLE_LEN: usize = 128;

/// The fixed pseudo file size the E8 filter translates against.
const E8_MAGIC_FILESIZE: i64 = 12_000_000;

/// Extra offset bits for an offset slot.
const fn footer_bits(slot: usize) -> u32 {
    if slot < 4 {
        0
    } else if slot >= 36 {
        17
    } else {
        ((slot - 2) / 2) as u32
    }
}

const fn build_offset_bases() -> [u32; MAX_OFFSET_SLOTS + 1] {
    let mut bases = [0u32; MAX_OFFSET_SLOTS + 1];
    let mut slot = 1;
    while slot <= MAX_OFFSET_SLOTS {
        bases[slot] = bases[slot - 1] + (1 << footer_bits(slot - 1));
        slot += 1;
    }
    bases
}

/// `OFFSET_SLOT_BASE[slot]` is the smallest formatted offset of `slot`.
const OFFSET_SLOT_BASE: [u32; MAX_OFFSET_SLOTS + 1] = build_offset_bases();

/// Number of offset slots in use for a given window order.
fn num_offset_slots(window_order: u32) -> usize {
    match window_order {
        15 => 30,
        16 => 32,
        17 => 34,
        18 => 36,
        19 => 38,
        20 => 42,
        _ => 50,
    }
}

fn offset_slot(formatted: u32) -> usize {
    // The bases are strictly increasing; pick the last one <= formatted.
    match OFFSET_SLOT_BASE.binary_search(&formatted) {
        Ok(slot) => slot,
        Err(ins) => ins - 1,
    }
}

/// Rewrites E8 operands from relative to pseudo-absolute form.
fn e8_preprocess(data: &mut [u8]) {
    e8_filter(data, |rel, pos| {
        let magic = E8_MAGIC_FILESIZE;
        if (rel as i64) >= -(pos as i64) && (rel as i64) < magic {
            if (rel as i64) < magic - pos as i64 {
                Some(rel.wrapping_add(pos as i32))
            } else {
                // Compensating translation: wraps into the negative range
                // that the decoder maps back through the magic size.
                Some(rel.wrapping_sub(magic as i32))
            }
        } else {
            None
        }
    });
}

/// Reverses [`e8_preprocess`].
fn e8_postprocess(data: &mut [u8]) {
    e8_filter(data, |abs, pos| {
        let magic = E8_MAGIC_FILESIZE;
        if abs >= 0 {
            if (abs as i64) < magic {
                Some(abs.wrapping_sub(pos as i32))
            } else {
                None
            }
        } else if (abs as i64) >= -(pos as i64) {
            Some(abs.wrapping_add(magic as i32))
        } else {
            None
        }
    });
}

fn e8_filter(data: &mut [u8], translate: impl Fn(i32, usize) -> Option<i32>) {
    if data.len() <= 10 {
        return;
    }
    let tail = data.len() - 10;
    let mut i = 0;
    while i < tail {
        if data[i] != 0xe8 {
            i += 1;
            continue;
        }
        let operand = &mut data[i + 1..i + 5];
        let value = i32::from_le_bytes([operand[0], operand[1], operand[2], operand[3]]);
        if let Some(new_value) = translate(value, i) {
            operand.copy_from_slice(&new_value.to_le_bytes());
        }
        i += 5;
    }
}

/// Decompressor for LZX chunks.
pub struct LzxDecompressor {
    window_order: u32,
    num_main_syms: usize,
    main_lens: [u8; MAX_MAIN_SYMS],
    len_lens: [u8; NUM_LEN_SYMS],
    pre_lens: [u8; NUM_PRETREE_SYMS],
    aligned_lens: [u8; NUM_ALIGNED_SYMS],
    main_table: Vec<u16>,
    len_table: Vec<u16>,
    pre_table: Vec<u16>,
    aligned_table: Vec<u16>,
}

impl LzxDecompressor {
    pub fn new(max_chunk_size: u32) -> Self {
        let window_order = max_chunk_size.trailing_zeros();
        Self {
            window_order,
            num_main_syms: NUM_CHARS + 8 * num_offset_slots(window_order),
            main_lens: [0; MAX_MAIN_SYMS],
            len_lens: [0; NUM_LEN_SYMS],
            pre_lens: [0; NUM_PRETREE_SYMS],
            aligned_lens: [0; NUM_ALIGNED_SYMS],
            main_table: vec![0; MAIN_TABLE_LEN],
            len_table: vec![0; LEN_TABLE_LEN],
            pre_table: vec![0; PRE_TABLE_LEN],
            aligned_table: vec![0; ALIGNED_TABLE_LEN],
        }
    }

    pub fn decompress(&mut self, cdata: &[u8], out: &mut [u8]) -> Result<(), CodecError> {
        // Codeword lengths are deltas against the previous block's lengths,
        // starting from all-zero at the beginning of each chunk.
        self.main_lens.fill(0);
        self.len_lens.fill(0);

        let mut is = InputBitstream::new(cdata);
        let mut recent = [1u32, 1, 1];
        let mut pos = 0usize;

        while pos < out.len() {
            let block_type = is.read_bits(3);
            let block_size = if is.read_bits(1) != 0 {
                DEFAULT_BLOCK_SIZE
            } else {
                let mut size = is.read_bits(16) as usize;
                if self.window_order >= 16 {
                    size = (size << 8) | is.read_bits(8) as usize;
                }
                size
            };
            if block_size == 0 || block_size > out.len() - pos {
                return Err(CodecError::Corrupt);
            }
            let block_end = pos + block_size;

            match block_type {
                BLOCKTYPE_VERBATIM | BLOCKTYPE_ALIGNED => {
                    let aligned = block_type == BLOCKTYPE_ALIGNED;
                    if aligned {
                        for len in self.aligned_lens.iter_mut() {
                            *len = is.read_bits(3) as u8;
                        }
                        make_decode_table(
                            &mut self.aligned_table,
                            NUM_ALIGNED_SYMS,
                            ALIGNED_TABLE_BITS,
                            &self.aligned_lens,
                            MAX_ALIGNED_CODEWORD_LEN,
                        )?;
                    }

                    self.read_main_and_len_lens(&mut is)?;
                    make_decode_table(
                        &mut self.main_table,
                        self.num_main_syms,
                        MAIN_TABLE_BITS,
                        &self.main_lens,
                        MAX_MAIN_CODEWORD_LEN,
                    )?;
                    make_decode_table(
                        &mut self.len_table,
                        NUM_LEN_SYMS,
                        LEN_TABLE_BITS,
                        &self.len_lens,
                        MAX_LEN_CODEWORD_LEN,
                    )?;

                    while pos < block_end {
                        let sym = read_huffsym(
                            &mut is,
                            &self.main_table,
                            MAIN_TABLE_BITS,
                            MAX_MAIN_CODEWORD_LEN,
                        ) as usize;
                        if sym < NUM_CHARS {
                            out[pos] = sym as u8;
                            pos += 1;
                            continue;
                        }

                        let main_sym = sym - NUM_CHARS;
                        let len_hdr = main_sym & NUM_PRIMARY_LENS;
                        let length = if len_hdr == NUM_PRIMARY_LENS {
                            let footer = read_huffsym(
                                &mut is,
                                &self.len_table,
                                LEN_TABLE_BITS,
                                MAX_LEN_CODEWORD_LEN,
                            ) as usize;
                            MIN_MATCH_LEN + NUM_PRIMARY_LENS + footer
                        } else {
                            MIN_MATCH_LEN + len_hdr
                        };

                        let slot = main_sym >> 3;
                        let offset = match slot {
                            0 => recent[0],
                            1 => {
                                recent.swap(0, 1);
                                recent[0]
                            }
                            2 => {
                                recent.swap(0, 2);
                                recent[0]
                            }
                            _ => {
                                if slot >= MAX_OFFSET_SLOTS {
                                    return Err(CodecError::Corrupt);
                                }
                                let num_extra = footer_bits(slot);
                                let formatted = if aligned && num_extra >= 3 {
                                    let verbatim = is.read_bits(num_extra - 3) << 3;
                                    let low = read_huffsym(
                                        &mut is,
                                        &self.aligned_table,
                                        ALIGNED_TABLE_BITS,
                                        MAX_ALIGNED_CODEWORD_LEN,
                                    );
                                    OFFSET_SLOT_BASE[slot] + verbatim + low
                                } else {
                                    OFFSET_SLOT_BASE[slot] + is.read_bits(num_extra)
                                };
                                let offset = formatted - OFFSET_ADJUSTMENT;
                                recent[2] = recent[1];
                                recent[1] = recent[0];
                                recent[0] = offset;
                                offset
                            }
                        };

                        if offset as usize > pos || length > block_end - pos {
                            return Err(CodecError::Corrupt);
                        }
                        lz_copy(out, pos, length, offset as usize);
                        pos += length;
                    }
                }

                BLOCKTYPE_UNCOMPRESSED => {
                    // Re-align on a coding-unit boundary; a stream that is
                    // already aligned discards a whole unit here.
                    is.ensure_bits(1);
                    is.align();
                    for r in recent.iter_mut() {
                        *r = is.read_u32();
                        if *r == 0 {
                            return Err(CodecError::Corrupt);
                        }
                    }
                    if !is.read_bytes(&mut out[pos..block_end]) {
                        return Err(CodecError::Corrupt);
                    }
                    if block_size % 2 == 1 {
                        is.read_byte();
                    }
                    pos = block_end;
                }

                _ => return Err(CodecError::Corrupt),
            }
        }

        e8_postprocess(out);
        Ok(())
    }

    fn read_main_and_len_lens(&mut self, is: &mut InputBitstream<'_>) -> Result<(), CodecError> {
        let num_main_syms = self.num_main_syms;
        read_pretree_coded_lens(is, &mut self.pre_lens, &mut self.pre_table, {
            &mut self.main_lens[..NUM_CHARS]
        })?;
        read_pretree_coded_lens(is, &mut self.pre_lens, &mut self.pre_table, {
            &mut self.main_lens[NUM_CHARS..num_main_syms]
        })?;
        read_pretree_coded_lens(is, &mut self.pre_lens, &mut self.pre_table, {
            &mut self.len_lens[..]
        })?;
        Ok(())
    }
}

/// Reads one pretree (20 4-bit lengths) and the run of delta-coded codeword
/// lengths it protects, updating `lens` in place.
fn read_pretree_coded_lens(
    is: &mut InputBitstream<'_>,
    pre_lens: &mut [u8; NUM_PRETREE_SYMS],
    pre_table: &mut [u16],
    lens: &mut [u8],
) -> Result<(), CodecError> {
    for len in pre_lens.iter_mut() {
        *len = is.read_bits(4) as u8;
    }
    make_decode_table(
        pre_table,
        NUM_PRETREE_SYMS,
        PRE_TABLE_BITS,
        pre_lens,
        MAX_PRE_CODEWORD_LEN,
    )?;

    let mut i = 0;
    while i < lens.len() {
        let code = read_huffsym(is, pre_table, PRE_TABLE_BITS, MAX_PRE_CODEWORD_LEN);
        match code {
            0..=16 => {
                lens[i] = ((17 + lens[i] as u32 - code) % 17) as u8;
                i += 1;
            }
            17 => {
                let n = 4 + is.read_bits(4) as usize;
                if n > lens.len() - i {
                    return Err(CodecError::Corrupt);
                }
                lens[i..i + n].fill(0);
                i += n;
            }
            18 => {
                let n = 20 + is.read_bits(5) as usize;
                if n > lens.len() - i {
                    return Err(CodecError::Corrupt);
                }
                lens[i..i + n].fill(0);
                i += n;
            }
            19 => {
                let n = 4 + is.read_bits(1) as usize;
                if n > lens.len() - i {
                    return Err(CodecError::Corrupt);
                }
                let code = read_huffsym(is, pre_table, PRE_TABLE_BITS, MAX_PRE_CODEWORD_LEN);
                if code > 16 {
                    return Err(CodecError::Corrupt);
                }
                let value = ((17 + lens[i] as u32 - code) % 17) as u8;
                lens[i..i + n].fill(value);
                i += n;
            }
            _ => return Err(CodecError::Corrupt),
        }
    }
    Ok(())
}

enum Item {
    Literal(u8),
    /// `formatted == 0` encodes a reuse of the most recent offset (slot 0).
    Match { length: u16, formatted: u32 },
}

/// Compressor for LZX chunks. Emits one VERBATIM block per chunk from a
/// greedy parse with most-recent-offset reuse.
pub struct LzxCompressor {
    window_order: u32,
    num_main_syms: usize,
    /// Largest encodable match offset: the offset-slot table for this
    /// window covers formatted offsets below its top base.
    max_offset: usize,
    buf: Vec<u8>,
    items: Vec<Item>,
    mf: MatchFinder,
    main_freqs: [u32; MAX_MAIN_SYMS],
    len_freqs: [u32; NUM_LEN_SYMS],
    pre_freqs: [u32; NUM_PRETREE_SYMS],
    main_lens: [u8; MAX_MAIN_SYMS],
    len_lens: [u8; NUM_LEN_SYMS],
    pre_lens: [u8; NUM_PRETREE_SYMS],
    main_codewords: [u32; MAX_MAIN_SYMS],
    len_codewords: [u32; NUM_LEN_SYMS],
    pre_codewords: [u32; NUM_PRETREE_SYMS],
    code_builder: CodeBuilder,
}

impl LzxCompressor {
    pub fn new(max_chunk_size: u32) -> Self {
        let window_order = max_chunk_size.trailing_zeros();
        let slots = num_offset_slots(window_order);
        Self {
            window_order,
            num_main_syms: NUM_CHARS + 8 * slots,
            max_offset: (OFFSET_SLOT_BASE[slots] - 1 - OFFSET_ADJUSTMENT) as usize,
            buf: Vec::with_capacity(max_chunk_size as usize),
            items: Vec::with_capacity(max_chunk_size as usize / 4),
            mf: MatchFinder::new(max_chunk_size as usize),
            main_freqs: [0; MAX_MAIN_SYMS],
            len_freqs: [0; NUM_LEN_SYMS],
            pre_freqs: [0; NUM_PRETREE_SYMS],
            main_lens: [0; MAX_MAIN_SYMS],
            len_lens: [0; NUM_LEN_SYMS],
            pre_lens: [0; NUM_PRETREE_SYMS],
            main_codewords: [0; MAX_MAIN_SYMS],
            len_codewords: [0; NUM_LEN_SYMS],
            pre_codewords: [0; NUM_PRETREE_SYMS],
            code_builder: CodeBuilder::new(MAX_MAIN_SYMS),
        }
    }

    pub fn compress(&mut self, input: &[u8], out: &mut [u8]) -> Option<usize> {
        if input.len() < 32 {
            return None;
        }

        self.buf.clear();
        self.buf.extend_from_slice(input);
        e8_preprocess(&mut self.buf);

        self.parse();
        self.build_codes();

        let mut os = OutputBitstream::new(out);

        // Block header.
        os.put_bits(BLOCKTYPE_VERBATIM, 3);
        if self.buf.len() == DEFAULT_BLOCK_SIZE {
            os.put_bits(1, 1);
        } else {
            os.put_bits(0, 1);
            if self.window_order >= 16 {
                os.put_bits((self.buf.len() >> 8) as u32, 16);
                os.put_bits((self.buf.len() & 0xff) as u32, 8);
            } else {
                os.put_bits(self.buf.len() as u32, 16);
            }
        }

        // Codeword lengths, delta-coded against zeros via pretrees.
        let main_lens = self.main_lens;
        let len_lens = self.len_lens;
        self.write_pretree_coded_lens(&mut os, &main_lens[..NUM_CHARS]);
        self.write_pretree_coded_lens(&mut os, &main_lens[NUM_CHARS..self.num_main_syms]);
        self.write_pretree_coded_lens(&mut os, &len_lens);

        // Items.
        for item in &self.items {
            match *item {
                Item::Literal(b) => {
                    let sym = b as usize;
                    os.put_bits(self.main_codewords[sym], self.main_lens[sym] as u32);
                }
                Item::Match { length, formatted } => {
                    let length = length as usize;
                    let len_hdr = (length - MIN_MATCH_LEN).min(NUM_PRIMARY_LENS);
                    let slot = if formatted == 0 { 0 } else { offset_slot(formatted) };
                    let sym = NUM_CHARS + (slot << 3) + len_hdr;
                    os.put_bits(self.main_codewords[sym], self.main_lens[sym] as u32);
                    if len_hdr == NUM_PRIMARY_LENS {
                        let footer = length - MIN_MATCH_LEN - NUM_PRIMARY_LENS;
                        os.put_bits(self.len_codewords[footer], self.len_lens[footer] as u32);
                    }
                    if formatted != 0 {
                        let extra = formatted - OFFSET_SLOT_BASE[slot];
                        os.put_varbits(extra, footer_bits(slot));
                    }
                }
            }
        }

        let total = os.flush()?;
        tracing::trace!(input = input.len(), output = total, "LZX chunk encoded");
        if total < input.len() {
            Some(total)
        } else {
            None
        }
    }

    fn parse(&mut self) {
        self.items.clear();
        self.main_freqs.fill(0);
        self.len_freqs.fill(0);
        self.mf.reset();

        let buf = &self.buf;
        let mut recent0 = 1u32;
        let mut pos = 0;
        while pos < buf.len() {
            let max_len = MAX_MATCH_LEN.min(buf.len() - pos);

            // The most recent offset is free to encode; prefer it whenever
            // it is nearly as long as the best explicit match.
            let rep_len = if (recent0 as usize) <= pos {
                match_len(buf, pos - recent0 as usize, pos, max_len)
            } else {
                0
            };
            let min_pos = pos.saturating_sub(self.max_offset);
            let explicit = self.mf.find_match(buf, pos, min_pos, 3, max_len);

            let (length, formatted) = if rep_len >= MIN_MATCH_LEN
                && rep_len + 1 >= explicit.map_or(0, |(l, _)| l)
            {
                (rep_len, 0)
            } else if let Some((len, offset)) = explicit {
                recent0 = offset as u32;
                (len, offset as u32 + OFFSET_ADJUSTMENT)
            } else {
                let b = buf[pos];
                self.main_freqs[b as usize] += 1;
                self.items.push(Item::Literal(b));
                self.mf.insert(buf, pos);
                pos += 1;
                continue;
            };

            let len_hdr = (length - MIN_MATCH_LEN).min(NUM_PRIMARY_LENS);
            let slot = if formatted == 0 { 0 } else { offset_slot(formatted) };
            self.main_freqs[NUM_CHARS + (slot << 3) + len_hdr] += 1;
            if len_hdr == NUM_PRIMARY_LENS {
                self.len_freqs[length - MIN_MATCH_LEN - NUM_PRIMARY_LENS] += 1;
            }
            self.items.push(Item::Match {
                length: length as u16,
                formatted,
            });
            for p in pos..pos + length {
                self.mf.insert(buf, p);
            }
            pos += length;
        }
    }

    fn build_codes(&mut self) {
        self.code_builder.build_lens(
            &self.main_freqs[..self.num_main_syms],
            MAX_MAIN_CODEWORD_LEN,
            &mut self.main_lens[..self.num_main_syms],
        );
        self.code_builder
            .build_lens(&self.len_freqs, MAX_LEN_CODEWORD_LEN, &mut self.len_lens);
        lens_to_codewords(&self.main_lens, &mut self.main_codewords);
        lens_to_codewords(&self.len_lens, &mut self.len_codewords);
    }

    /// Run-length-codes `lens` (deltas against zero), builds the pretree,
    /// and writes both.
    fn write_pretree_coded_lens(&mut self, os: &mut OutputBitstream<'_>, lens: &[u8]) {
        // (pretree symbol, extra-bits value, extra-bits count)
        let mut codes: Vec<(u8, u32, u32)> = Vec::with_capacity(lens.len());
        let mut i = 0;
        while i < lens.len() {
            let len = lens[i];
            let mut run = 1;
            while i + run < lens.len() && lens[i + run] == len {
                run += 1;
            }
            if len == 0 {
                let mut left = run;
                while left >= 20 {
                    let n = left.min(51);
                    codes.push((18, (n - 20) as u32, 5));
                    left -= n;
                }
                while left >= 4 {
                    let n = left.min(19);
                    codes.push((17, (n - 4) as u32, 4));
                    left -= n;
                }
                for _ in 0..left {
                    codes.push((0, 0, 0));
                }
            } else {
                let delta = ((17 - len as u32) % 17) as u8;
                let mut left = run;
                while left >= 4 {
                    let n = left.min(5);
                    codes.push((19, (n - 4) as u32, 1));
                    codes.push((delta, 0, 0));
                    left -= n;
                }
                for _ in 0..left {
                    codes.push((delta, 0, 0));
                }
            }
            i += run;
        }

        self.pre_freqs.fill(0);
        for &(sym, _, _) in &codes {
            self.pre_freqs[sym as usize] += 1;
        }
        self.code_builder
            .build_lens(&self.pre_freqs, MAX_PRE_CODEWORD_LEN, &mut self.pre_lens);
        lens_to_codewords(&self.pre_lens, &mut self.pre_codewords);

        for &len in &self.pre_lens {
            os.put_bits(len as u32, 4);
        }
        for &(sym, extra, extra_bits) in &codes {
            os.put_bits(
                self.pre_codewords[sym as usize],
                self.pre_lens[sym as usize] as u32,
            );
            if extra_bits > 0 {
                os.put_bits(extra, extra_bits);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8], chunk_size: u32) -> Option<Vec<u8>> {
        let mut c = LzxCompressor::new(chunk_size);
        let mut out = vec![0u8; data.len()];
        let n = c.compress(data, &mut out)?;
        let mut d = LzxDecompressor::new(chunk_size);
        let mut back = vec![0u8; data.len()];
        d.decompress(&out[..n], &mut back).unwrap();
        Some(back)
    }

    #[test]
    fn mod256_ramp_roundtrips() {
        let data: Vec<u8> = (0..32768u32).map(|i| i as u8).collect();
        let back = roundtrip(&data, 32768).expect("ramp must compress");
        assert_eq!(back, data);
    }

    #[test]
    fn text_roundtrips() {
        let data: Vec<u8> = (0..600)
            .flat_map(|i| format!("the {i}th line of some log output\n").into_bytes())
            .collect();
        let back = roundtrip(&data, 32768).expect("text must compress");
        assert_eq!(back, data);
    }

    #[test]
    fn short_final_chunk_roundtrips() {
        let data = vec![b'x'; 1000];
        let back = roundtrip(&data, 32768).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn e8_filter_is_invertible() {
        let mut data = vec![0u8; 64];
        data[3] = 0xe8;
        data[4..8].copy_from_slice(&100i32.to_le_bytes());
        data[20] = 0xe8;
        data[21..25].copy_from_slice(&(-15i32).to_le_bytes());
        data[40] = 0xe8;
        data[41..45].copy_from_slice(&(11_999_990i32).to_le_bytes());
        let orig = data.clone();
        e8_preprocess(&mut data);
        assert_ne!(data, orig);
        e8_postprocess(&mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn e8_data_roundtrips_through_codec() {
        let mut data = vec![0u8; 8192];
        for i in (0..8000).step_by(16) {
            data[i] = 0xe8;
            data[i + 1..i + 5].copy_from_slice(&((i as i32) * 3 - 7000).to_le_bytes());
        }
        let back = roundtrip(&data, 32768).expect("e8 data must compress");
        assert_eq!(back, data);
    }

    #[test]
    fn offset_slot_bases_are_canonical() {
        assert_eq!(&OFFSET_SLOT_BASE[..9], &[0, 1, 2, 3, 4, 6, 8, 12, 16]);
        for slot in 0..MAX_OFFSET_SLOTS {
            assert_eq!(
                OFFSET_SLOT_BASE[slot + 1] - OFFSET_SLOT_BASE[slot],
                1 << footer_bits(slot)
            );
        }
    }

    #[test]
    fn truncated_input_is_an_error() {
        let data: Vec<u8> = (0..32768u32).map(|i| (i * 7) as u8).collect();
        let mut c = LzxCompressor::new(32768);
        let mut out = vec![0u8; data.len()];
        let n = c.compress(&data, &mut out).unwrap();
        let mut d = LzxDecompressor::new(32768);
        let mut back = vec![0u8; data.len()];
        // Cutting the stream mid-block must not panic; it either errors or
        // decodes wrong data that higher layers catch by hash.
        let _ = d.decompress(&out[..n / 2], &mut back);
    }
}
