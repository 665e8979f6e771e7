//! The LZMS compression format.
//!
//! An LZMS-compressed chunk carries two logical bitstreams over one buffer
//! of 16-bit little-endian units: range-coded item-type bits read forwards
//! from the start, and adaptive-Huffman symbols plus verbatim bits read
//! backwards from the end. Items are literals, LZ matches (explicit or
//! repeat offset), and delta matches. Repeat-offset queues hold three
//! visible entries but four slots, because inserting a just-used offset is
//! delayed by one item.
//!
//! Range-coded bits take their probabilities from per-context tables indexed
//! by the last few bits decoded in that context; each probability adapts as
//! n/64 where n counts the zeros among the last 64 bits seen by that entry.
//! The five Huffman codes adapt by periodic rebuild from symbol frequencies,
//! which are halved (plus one) at every rebuild.
//!
//! After decoding, an x86 filter translates absolute call/jump targets back
//! to relative form; compression applies the forward translation first.
//!
//! When used for a solid resource, the match window spans chunk boundaries:
//! `buf[..start]` holds earlier chunks of the resource and matches may reach
//! into it. Range-coder, probability, and Huffman state restart per chunk.

use std::sync::OnceLock;

use crate::huffman::{lens_to_codewords, make_decode_table, CodeBuilder};
use crate::matchfind::{lz_copy, match_len, MatchFinder};
use crate::CodecError;

const PROBABILITY_BITS: u32 = 6;
const INITIAL_PROBABILITY: u32 = 48;
const INITIAL_RECENT_BITS: u64 = 0x0000_0000_5555_5555;

const NUM_RECENT_OFFSETS: usize = 3;

const MAX_CODEWORD_LEN: u32 = 15;
const DECODE_TABLE_BITS: u32 = 10;

const NUM_LITERAL_SYMS: usize = 256;
const NUM_LENGTH_SYMS: usize = 54;
const NUM_DELTA_POWER_SYMS: usize = 8;
const MAX_NUM_OFFSET_SYMS: usize = 799;

const LITERAL_CODE_REBUILD_FREQ: u32 = 1024;
const LZ_OFFSET_CODE_REBUILD_FREQ: u32 = 1024;
const LENGTH_CODE_REBUILD_FREQ: u32 = 512;
const DELTA_OFFSET_CODE_REBUILD_FREQ: u32 = 1024;
const DELTA_POWER_CODE_REBUILD_FREQ: u32 = 512;

const NUM_MAIN_STATES: usize = 16;
const NUM_MATCH_STATES: usize = 32;
const NUM_LZ_MATCH_STATES: usize = 64;
const NUM_LZ_REPEAT_MATCH_STATES: usize = 64;
const NUM_DELTA_MATCH_STATES: usize = 64;
const NUM_DELTA_REPEAT_MATCH_STATES: usize = 64;

/// Worst-case decode-table sizes for (syms, 10 table bits, 15 max len).
const LITERAL_TABLE_LEN: usize = 1302;
const LENGTH_TABLE_LEN: usize = 1098;
const OFFSET_TABLE_LEN: usize = 1846;
const DELTA_POWER_TABLE_LEN: usize = 1 << DECODE_TABLE_BITS;

const X86_ID_WINDOW_SIZE: i64 = 65535;
const X86_MAX_TRANSLATION_OFFSET: i64 = 1023;

// ---------------------------------------------------------------------------
// Slot tables
// ---------------------------------------------------------------------------

/// (extra-bit count, number of consecutive slots with that count). The gap
/// between consecutive slot bases is `1 << extra_bits`.
const OFFSET_SLOT_RUNS: [(u32, u32); 21] = [
    (0, 9),
    (1, 0),
    (2, 9),
    (3, 7),
    (4, 10),
    (5, 15),
    (6, 15),
    (7, 20),
    (8, 20),
    (9, 30),
    (10, 33),
    (11, 40),
    (12, 42),
    (13, 45),
    (14, 60),
    (15, 73),
    (16, 80),
    (17, 85),
    (18, 95),
    (19, 105),
    (20, 6),
];

const LENGTH_SLOT_RUNS: [(u32, u32); 15] = [
    (0, 27),
    (1, 2),
    (2, 2),
    (3, 2),
    (4, 2),
    (5, 2),
    (6, 2),
    (7, 2),
    (8, 2),
    (9, 2),
    (10, 2),
    (11, 2),
    (12, 2),
    (13, 2),
    (30, 1),
];

struct SlotTables {
    /// `offset_base[slot]` is the smallest offset of `slot`; one extra
    /// sentinel entry past the last slot.
    offset_base: Vec<u64>,
    offset_extra_bits: Vec<u8>,
    length_base: Vec<u64>,
    length_extra_bits: Vec<u8>,
}

fn build_slot_tables(runs: &[(u32, u32)]) -> (Vec<u64>, Vec<u8>) {
    let num_slots: u32 = runs.iter().map(|&(_, n)| n).sum();
    let mut bases = Vec::with_capacity(num_slots as usize + 1);
    let mut extra = Vec::with_capacity(num_slots as usize);
    let mut base = 1u64;
    for &(order, count) in runs {
        for _ in 0..count {
            bases.push(base);
            extra.push(order as u8);
            base += 1 << order;
        }
    }
    bases.push(base);
    (bases, extra)
}

fn slot_tables() -> &'static SlotTables {
    static TABLES: OnceLock<SlotTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let (offset_base, offset_extra_bits) = build_slot_tables(&OFFSET_SLOT_RUNS);
        let (length_base, length_extra_bits) = build_slot_tables(&LENGTH_SLOT_RUNS);
        debug_assert_eq!(offset_extra_bits.len(), MAX_NUM_OFFSET_SYMS);
        debug_assert_eq!(length_extra_bits.len(), NUM_LENGTH_SYMS);
        SlotTables {
            offset_base,
            offset_extra_bits,
            length_base,
            length_extra_bits,
        }
    })
}

/// The slot whose base range contains `value`.
fn slot_for(bases: &[u64], value: u64) -> usize {
    debug_assert!(value >= bases[0] && value < *bases.last().unwrap());
    bases.partition_point(|&b| b <= value) - 1
}

fn num_offset_slots_for(max_offset: u64) -> usize {
    slot_for(&slot_tables().offset_base, max_offset) + 1
}

// ---------------------------------------------------------------------------
// Range coding
// ---------------------------------------------------------------------------

/// One adaptive binary probability: the count of zeros among the last 64
/// bits coded with this entry.
#[derive(Copy, Clone)]
struct ProbEntry {
    num_recent_zero_bits: u32,
    recent_bits: u64,
}

impl ProbEntry {
    fn new() -> Self {
        Self {
            num_recent_zero_bits: INITIAL_PROBABILITY,
            recent_bits: INITIAL_RECENT_BITS,
        }
    }

    /// Chance out of 64 that the next bit is 0, clamped away from the
    /// degenerate 0 and 64.
    fn probability(&self) -> u32 {
        self.num_recent_zero_bits.clamp(1, 63)
    }

    fn update(&mut self, bit: u32) {
        let leaving = (self.recent_bits >> 63) as i32;
        self.num_recent_zero_bits =
            (self.num_recent_zero_bits as i32 + leaving - bit as i32) as u32;
        self.recent_bits = (self.recent_bits << 1) | bit as u64;
    }
}

struct RangeDecoder<'a> {
    range: u32,
    code: u32,
    next: &'a [u8],
}

impl<'a> RangeDecoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        let unit0 = u16::from_le_bytes([input[0], input[1]]) as u32;
        let unit1 = u16::from_le_bytes([input[2], input[3]]) as u32;
        Self {
            range: 0xffff_ffff,
            code: (unit0 << 16) | unit1,
            next: &input[4..],
        }
    }

    fn next_unit(&mut self) -> u32 {
        if self.next.len() >= 2 {
            let v = u16::from_le_bytes([self.next[0], self.next[1]]) as u32;
            self.next = &self.next[2..];
            v
        } else {
            0
        }
    }

    fn decode_bit(&mut self, prob: u32) -> u32 {
        if self.range <= 0xffff {
            self.range <<= 16;
            let unit = self.next_unit();
            self.code = (self.code << 16) | unit;
        }
        let bound = (self.range >> PROBABILITY_BITS) * prob;
        if self.code < bound {
            self.range = bound;
            0
        } else {
            self.range -= bound;
            self.code -= bound;
            1
        }
    }
}

struct RangeEncoder {
    low: u64,
    range: u32,
    cache: u32,
    cache_size: u32,
    out: Vec<u8>,
}

impl RangeEncoder {
    fn new() -> Self {
        Self {
            low: 0,
            range: 0xffff_ffff,
            cache: 0,
            cache_size: 1,
            out: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.low = 0;
        self.range = 0xffff_ffff;
        self.cache = 0;
        self.cache_size = 1;
        self.out.clear();
    }

    fn shift_low(&mut self) {
        if (self.low as u32) < 0xffff_0000 || (self.low >> 32) != 0 {
            let carry = (self.low >> 32) as u32;
            while self.cache_size != 0 {
                let unit = (self.cache.wrapping_add(carry)) as u16;
                self.out.extend_from_slice(&unit.to_le_bytes());
                self.cache = 0xffff;
                self.cache_size -= 1;
            }
            self.cache = ((self.low >> 16) & 0xffff) as u32;
        }
        self.cache_size += 1;
        self.low = (self.low & 0xffff) << 16;
    }

    fn encode_bit(&mut self, prob: u32, bit: u32) {
        if self.range <= 0xffff {
            self.range <<= 16;
            self.shift_low();
        }
        let bound = (self.range >> PROBABILITY_BITS) * prob;
        if bit == 0 {
            self.range = bound;
        } else {
            self.low += bound as u64;
            self.range -= bound;
        }
    }

    fn flush(&mut self) {
        for _ in 0..4 {
            self.shift_low();
        }
    }
}

// ---------------------------------------------------------------------------
// Backward bitstream
// ---------------------------------------------------------------------------

/// Reads 16-bit units from the end of the buffer towards the start; bits
/// within each unit are consumed high to low. Overrun bits are zeros.
struct BackwardBitstream<'a> {
    bitbuf: u64,
    bitsleft: u32,
    data: &'a [u8],
    /// Byte index one past the next unit to read.
    pos: usize,
}

impl<'a> BackwardBitstream<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            bitbuf: 0,
            bitsleft: 0,
            data,
            pos: data.len(),
        }
    }

    fn ensure_bits(&mut self, num_bits: u32) {
        debug_assert!(num_bits <= 48);
        while self.bitsleft < num_bits {
            if self.pos >= 2 {
                self.pos -= 2;
                let unit = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
                self.bitbuf |= (unit as u64) << (64 - 16 - self.bitsleft);
            }
            self.bitsleft += 16;
        }
    }

    fn peek_bits(&self, num_bits: u32) -> u32 {
        ((self.bitbuf >> 1) >> (64 - num_bits - 1)) as u32
    }

    fn remove_bits(&mut self, num_bits: u32) {
        self.bitbuf <<= num_bits;
        self.bitsleft -= num_bits;
    }

    fn read_bits(&mut self, num_bits: u32) -> u32 {
        self.ensure_bits(num_bits);
        let bits = self.peek_bits(num_bits);
        self.remove_bits(num_bits);
        bits
    }
}

/// Collects the backward bitstream; the units are written in reverse order
/// at the tail of the compressed chunk.
struct BackwardBitWriter {
    bitbuf: u64,
    bitcount: u32,
    units: Vec<u16>,
}

impl BackwardBitWriter {
    fn new() -> Self {
        Self {
            bitbuf: 0,
            bitcount: 0,
            units: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.bitbuf = 0;
        self.bitcount = 0;
        self.units.clear();
    }

    fn put_bits(&mut self, bits: u32, num_bits: u32) {
        debug_assert!(num_bits <= 32);
        self.bitbuf = (self.bitbuf << num_bits) | bits as u64;
        self.bitcount += num_bits;
        while self.bitcount >= 16 {
            self.bitcount -= 16;
            self.units.push((self.bitbuf >> self.bitcount) as u16);
        }
    }

    fn flush(&mut self) {
        if self.bitcount > 0 {
            let unit = ((self.bitbuf << (16 - self.bitcount)) & 0xffff) as u16;
            self.units.push(unit);
            self.bitcount = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// Adaptive Huffman codes
// ---------------------------------------------------------------------------

struct AdaptiveCode {
    num_syms: usize,
    rebuild_freq: u32,
    num_syms_seen: u32,
    freqs: Vec<u32>,
    lens: Vec<u8>,
    codewords: Vec<u32>,
    decode_table: Vec<u16>,
    builder: CodeBuilder,
}

impl AdaptiveCode {
    fn new(max_num_syms: usize, rebuild_freq: u32, table_len: usize) -> Self {
        Self {
            num_syms: max_num_syms,
            rebuild_freq,
            num_syms_seen: rebuild_freq,
            freqs: vec![1; max_num_syms],
            lens: vec![0; max_num_syms],
            codewords: vec![0; max_num_syms],
            decode_table: vec![0; table_len],
            builder: CodeBuilder::new(max_num_syms),
        }
    }

    /// Re-arms the code for a new chunk with `num_syms` active symbols.
    fn reset(&mut self, num_syms: usize) {
        debug_assert!(num_syms <= self.freqs.len());
        self.num_syms = num_syms;
        self.num_syms_seen = self.rebuild_freq;
        self.freqs[..num_syms].fill(1);
    }

    /// Rebuilds the code from the current frequencies, then dilutes them so
    /// old symbols fade from future rebuilds.
    fn rebuild(&mut self) {
        self.builder.build_lens(
            &self.freqs[..self.num_syms],
            MAX_CODEWORD_LEN,
            &mut self.lens[..self.num_syms],
        );
        // All frequencies are at least 1, so the code is complete and the
        // table build cannot fail.
        make_decode_table(
            &mut self.decode_table,
            self.num_syms,
            DECODE_TABLE_BITS,
            &self.lens[..self.num_syms],
            MAX_CODEWORD_LEN,
        )
        .expect("adaptive code lengths always form a complete code");
        lens_to_codewords(&self.lens[..self.num_syms], &mut self.codewords[..self.num_syms]);
        for f in &mut self.freqs[..self.num_syms] {
            *f = (*f >> 1) + 1;
        }
        self.num_syms_seen = 0;
    }

    fn decode(&mut self, is: &mut BackwardBitstream<'_>) -> u32 {
        if self.num_syms_seen == self.rebuild_freq {
            self.rebuild();
        }
        is.ensure_bits(MAX_CODEWORD_LEN);
        let mut entry = self.decode_table[is.peek_bits(DECODE_TABLE_BITS) as usize];
        let mut sym = (entry >> 4) as u32;
        let mut len = (entry & 0xf) as u32;
        if (entry as u32) >= 1 << (DECODE_TABLE_BITS + 4) {
            is.remove_bits(DECODE_TABLE_BITS);
            entry = self.decode_table[sym as usize + is.peek_bits(len) as usize];
            sym = (entry >> 4) as u32;
            len = (entry & 0xf) as u32;
        }
        is.remove_bits(len);

        self.freqs[sym as usize] += 1;
        self.num_syms_seen += 1;
        sym
    }

    fn encode(&mut self, os: &mut BackwardBitWriter, sym: u32) {
        if self.num_syms_seen == self.rebuild_freq {
            self.rebuild();
        }
        os.put_bits(self.codewords[sym as usize], self.lens[sym as usize] as u32);
        self.freqs[sym as usize] += 1;
        self.num_syms_seen += 1;
    }
}

// ---------------------------------------------------------------------------
// Recent-offset queues
// ---------------------------------------------------------------------------

/// The LZ repeat-offset queue: three decodable entries plus the overflow
/// slot required by the delayed front insertion.
struct LzLru {
    recent_offsets: [u64; NUM_RECENT_OFFSETS + 1],
    prev_offset: u64,
    upcoming_offset: u64,
}

impl LzLru {
    fn new() -> Self {
        Self {
            recent_offsets: [1, 2, 3, 4],
            prev_offset: 0,
            upcoming_offset: 0,
        }
    }

    fn update(&mut self) {
        if self.prev_offset != 0 {
            for i in (0..NUM_RECENT_OFFSETS).rev() {
                self.recent_offsets[i + 1] = self.recent_offsets[i];
            }
            self.recent_offsets[0] = self.prev_offset;
        }
        self.prev_offset = self.upcoming_offset;
    }
}

struct DeltaLru {
    recent_powers: [u32; NUM_RECENT_OFFSETS + 1],
    recent_offsets: [u64; NUM_RECENT_OFFSETS + 1],
    prev_power: u32,
    prev_offset: u64,
    upcoming_power: u32,
    upcoming_offset: u64,
}

impl DeltaLru {
    fn new() -> Self {
        Self {
            recent_powers: [0, 0, 0, 0],
            recent_offsets: [1, 2, 3, 4],
            prev_power: 0,
            prev_offset: 0,
            upcoming_power: 0,
            upcoming_offset: 0,
        }
    }

    fn update(&mut self) {
        if self.prev_offset != 0 {
            for i in (0..NUM_RECENT_OFFSETS).rev() {
                self.recent_powers[i + 1] = self.recent_powers[i];
                self.recent_offsets[i + 1] = self.recent_offsets[i];
            }
            self.recent_powers[0] = self.prev_power;
            self.recent_offsets[0] = self.prev_offset;
        }
        self.prev_power = self.upcoming_power;
        self.prev_offset = self.upcoming_offset;
    }
}

// ---------------------------------------------------------------------------
// x86 filter
// ---------------------------------------------------------------------------

/// Translates the targets of x86 call/jump/load instructions between
/// relative and absolute form (`undo == true` restores relative form).
///
/// A translation is only performed when another translated target was seen
/// nearby; "nearby" is tracked through `last_target_usages`, indexed by the
/// low 16 bits of the relative displacement.
fn x86_filter(data: &mut [u8], last_target_usages: &mut [i32], undo: bool) {
    if data.len() < 17 {
        return;
    }
    last_target_usages.fill((-X86_ID_WINDOW_SIZE - 1) as i32);
    let mut closest_target_usage: i64 = -X86_MAX_TRANSLATION_OFFSET - 1;

    let tail = data.len() - 16;
    let mut i = 1usize;
    while i < tail {
        let (num_op_bytes, max_trans_offset) = match data[i] {
            0x48 => {
                if data[i + 1] == 0x8b && (data[i + 2] == 0x05 || data[i + 2] == 0x0d) {
                    // Load relative (x86_64).
                    (3, X86_MAX_TRANSLATION_OFFSET)
                } else if data[i + 1] == 0x8d && (data[i + 2] & 0x7) == 0x5 {
                    // Load effective address relative (x86_64).
                    (3, X86_MAX_TRANSLATION_OFFSET)
                } else {
                    i += 1;
                    continue;
                }
            }
            0x4c => {
                if data[i + 1] == 0x8d && (data[i + 2] & 0x7) == 0x5 {
                    (3, X86_MAX_TRANSLATION_OFFSET)
                } else {
                    i += 1;
                    continue;
                }
            }
            // Call relative. The translation window is halved: we must be
            // more confident this really is machine code.
            0xe8 => (1, X86_MAX_TRANSLATION_OFFSET / 2),
            // Jump relative: never translated, but the operand is skipped.
            0xe9 => {
                i += 5;
                continue;
            }
            0xf0 => {
                if data[i + 1] == 0x83 && data[i + 2] == 0x05 {
                    // Lock add relative.
                    (3, X86_MAX_TRANSLATION_OFFSET)
                } else {
                    i += 1;
                    continue;
                }
            }
            0xff => {
                if data[i + 1] == 0x15 {
                    // Call indirect.
                    (2, X86_MAX_TRANSLATION_OFFSET)
                } else {
                    i += 1;
                    continue;
                }
            }
            _ => {
                i += 1;
                continue;
            }
        };

        let op_off = i + num_op_bytes;
        let read_u32 = |d: &[u8]| u32::from_le_bytes([d[op_off], d[op_off + 1], d[op_off + 2], d[op_off + 3]]);

        // The identifying 16 bits are the low bits of the *relative* form,
        // so they are read after undoing but before doing the translation.
        let pos16;
        if undo {
            if i as i64 - closest_target_usage <= max_trans_offset {
                let n = read_u32(data);
                data[op_off..op_off + 4]
                    .copy_from_slice(&n.wrapping_sub(i as u32).to_le_bytes());
            }
            pos16 = u16::from_le_bytes([data[op_off], data[op_off + 1]]);
        } else {
            pos16 = u16::from_le_bytes([data[op_off], data[op_off + 1]]);
            if i as i64 - closest_target_usage <= max_trans_offset {
                let n = read_u32(data);
                data[op_off..op_off + 4]
                    .copy_from_slice(&n.wrapping_add(i as u32).to_le_bytes());
            }
        }

        let target_end = (op_off + 3) as i64;
        if target_end - last_target_usages[pos16 as usize] as i64 <= X86_ID_WINDOW_SIZE {
            closest_target_usage = target_end;
        }
        last_target_usages[pos16 as usize] = target_end as i32;
        i = target_end as usize + 1;
    }
}

// ---------------------------------------------------------------------------
// Shared per-chunk coder state
// ---------------------------------------------------------------------------

/// The range-coded context states and adaptive codes, identical between the
/// decompressor and the compressor so both sides stay in bitwise lockstep.
struct CoderState {
    main_state: u32,
    main_probs: [ProbEntry; NUM_MAIN_STATES],
    match_state: u32,
    match_probs: [ProbEntry; NUM_MATCH_STATES],
    lz_match_state: u32,
    lz_match_probs: [ProbEntry; NUM_LZ_MATCH_STATES],
    lz_repeat_match_states: [u32; NUM_RECENT_OFFSETS - 1],
    lz_repeat_match_probs: [[ProbEntry; NUM_LZ_REPEAT_MATCH_STATES]; NUM_RECENT_OFFSETS - 1],
    delta_match_state: u32,
    delta_match_probs: [ProbEntry; NUM_DELTA_MATCH_STATES],
    delta_repeat_match_states: [u32; NUM_RECENT_OFFSETS - 1],
    delta_repeat_match_probs:
        [[ProbEntry; NUM_DELTA_REPEAT_MATCH_STATES]; NUM_RECENT_OFFSETS - 1],

    literal_code: AdaptiveCode,
    lz_offset_code: AdaptiveCode,
    length_code: AdaptiveCode,
    delta_offset_code: AdaptiveCode,
    delta_power_code: AdaptiveCode,

    lz_lru: LzLru,
    delta_lru: DeltaLru,
}

impl CoderState {
    fn new() -> Self {
        Self {
            main_state: 0,
            main_probs: [ProbEntry::new(); NUM_MAIN_STATES],
            match_state: 0,
            match_probs: [ProbEntry::new(); NUM_MATCH_STATES],
            lz_match_state: 0,
            lz_match_probs: [ProbEntry::new(); NUM_LZ_MATCH_STATES],
            lz_repeat_match_states: [0; NUM_RECENT_OFFSETS - 1],
            lz_repeat_match_probs: [[ProbEntry::new(); NUM_LZ_REPEAT_MATCH_STATES];
                NUM_RECENT_OFFSETS - 1],
            delta_match_state: 0,
            delta_match_probs: [ProbEntry::new(); NUM_DELTA_MATCH_STATES],
            delta_repeat_match_states: [0; NUM_RECENT_OFFSETS - 1],
            delta_repeat_match_probs: [[ProbEntry::new(); NUM_DELTA_REPEAT_MATCH_STATES];
                NUM_RECENT_OFFSETS - 1],
            literal_code: AdaptiveCode::new(
                NUM_LITERAL_SYMS,
                LITERAL_CODE_REBUILD_FREQ,
                LITERAL_TABLE_LEN,
            ),
            lz_offset_code: AdaptiveCode::new(
                MAX_NUM_OFFSET_SYMS,
                LZ_OFFSET_CODE_REBUILD_FREQ,
                OFFSET_TABLE_LEN,
            ),
            length_code: AdaptiveCode::new(
                NUM_LENGTH_SYMS,
                LENGTH_CODE_REBUILD_FREQ,
                LENGTH_TABLE_LEN,
            ),
            delta_offset_code: AdaptiveCode::new(
                MAX_NUM_OFFSET_SYMS,
                DELTA_OFFSET_CODE_REBUILD_FREQ,
                OFFSET_TABLE_LEN,
            ),
            delta_power_code: AdaptiveCode::new(
                NUM_DELTA_POWER_SYMS,
                DELTA_POWER_CODE_REBUILD_FREQ,
                DELTA_POWER_TABLE_LEN,
            ),
            lz_lru: LzLru::new(),
            delta_lru: DeltaLru::new(),
        }
    }

    fn reset(&mut self, num_offset_slots: usize) {
        self.main_state = 0;
        self.main_probs = [ProbEntry::new(); NUM_MAIN_STATES];
        self.match_state = 0;
        self.match_probs = [ProbEntry::new(); NUM_MATCH_STATES];
        self.lz_match_state = 0;
        self.lz_match_probs = [ProbEntry::new(); NUM_LZ_MATCH_STATES];
        self.lz_repeat_match_states = [0; NUM_RECENT_OFFSETS - 1];
        self.lz_repeat_match_probs =
            [[ProbEntry::new(); NUM_LZ_REPEAT_MATCH_STATES]; NUM_RECENT_OFFSETS - 1];
        self.delta_match_state = 0;
        self.delta_match_probs = [ProbEntry::new(); NUM_DELTA_MATCH_STATES];
        self.delta_repeat_match_states = [0; NUM_RECENT_OFFSETS - 1];
        self.delta_repeat_match_probs =
            [[ProbEntry::new(); NUM_DELTA_REPEAT_MATCH_STATES]; NUM_RECENT_OFFSETS - 1];
        self.literal_code.reset(NUM_LITERAL_SYMS);
        self.lz_offset_code.reset(num_offset_slots);
        self.length_code.reset(NUM_LENGTH_SYMS);
        self.delta_offset_code.reset(num_offset_slots);
        self.delta_power_code.reset(NUM_DELTA_POWER_SYMS);
        self.lz_lru = LzLru::new();
        self.delta_lru = DeltaLru::new();
    }
}

fn range_decode_bit(
    rc: &mut RangeDecoder<'_>,
    state: &mut u32,
    state_mask: u32,
    probs: &mut [ProbEntry],
) -> u32 {
    let entry = &mut probs[*state as usize];
    let prob = entry.probability();
    let bit = rc.decode_bit(prob);
    *state = ((*state << 1) | bit) & state_mask;
    entry.update(bit);
    bit
}

fn range_encode_bit(
    rc: &mut RangeEncoder,
    bit: u32,
    state: &mut u32,
    state_mask: u32,
    probs: &mut [ProbEntry],
) {
    let entry = &mut probs[*state as usize];
    let prob = entry.probability();
    rc.encode_bit(prob, bit);
    *state = ((*state << 1) | bit) & state_mask;
    entry.update(bit);
}

// ---------------------------------------------------------------------------
// Decompressor
// ---------------------------------------------------------------------------

/// Decompressor for LZMS chunks.
pub struct LzmsDecompressor {
    state: CoderState,
    last_target_usages: Vec<i32>,
}

impl LzmsDecompressor {
    pub fn new() -> Self {
        Self {
            state: CoderState::new(),
            last_target_usages: vec![0; 65536],
        }
    }

    pub fn decompress(
        &mut self,
        cdata: &[u8],
        buf: &mut [u8],
        start: usize,
    ) -> Result<(), CodecError> {
        if cdata.len() < 4 || cdata.len() % 2 != 0 {
            return Err(CodecError::Corrupt);
        }

        let num_offset_slots = num_offset_slots_for((buf.len() as u64 - 1).max(1));
        self.state.reset(num_offset_slots);
        let s = &mut self.state;
        let tables = slot_tables();

        let mut rc = RangeDecoder::new(cdata);
        let mut is = BackwardBitstream::new(cdata);

        let mut pos = start;
        while pos < buf.len() {
            s.lz_lru.upcoming_offset = 0;
            s.delta_lru.upcoming_power = 0;
            s.delta_lru.upcoming_offset = 0;

            let main_bit =
                range_decode_bit(&mut rc, &mut s.main_state, NUM_MAIN_STATES as u32 - 1, &mut s.main_probs);
            if main_bit == 0 {
                // Literal.
                buf[pos] = s.literal_code.decode(&mut is) as u8;
                pos += 1;
            } else if range_decode_bit(
                &mut rc,
                &mut s.match_state,
                NUM_MATCH_STATES as u32 - 1,
                &mut s.match_probs,
            ) == 0
            {
                // LZ match.
                let offset;
                if range_decode_bit(
                    &mut rc,
                    &mut s.lz_match_state,
                    NUM_LZ_MATCH_STATES as u32 - 1,
                    &mut s.lz_match_probs,
                ) == 0
                {
                    // Explicit offset.
                    let slot = s.lz_offset_code.decode(&mut is) as usize;
                    let extra = is.read_bits(tables.offset_extra_bits[slot] as u32);
                    offset = tables.offset_base[slot] + extra as u64;
                } else {
                    // Repeat offset.
                    let mut i = 0;
                    while i < NUM_RECENT_OFFSETS - 1 {
                        if range_decode_bit(
                            &mut rc,
                            &mut s.lz_repeat_match_states[i],
                            NUM_LZ_REPEAT_MATCH_STATES as u32 - 1,
                            &mut s.lz_repeat_match_probs[i],
                        ) == 0
                        {
                            break;
                        }
                        i += 1;
                    }
                    offset = s.lz_lru.recent_offsets[i];
                    for j in i..NUM_RECENT_OFFSETS {
                        s.lz_lru.recent_offsets[j] = s.lz_lru.recent_offsets[j + 1];
                    }
                }
                s.lz_lru.upcoming_offset = offset;

                let length = decode_value(
                    &mut s.length_code,
                    &mut is,
                    &tables.length_base,
                    &tables.length_extra_bits,
                ) as usize;

                if length > buf.len() - pos || offset > pos as u64 {
                    return Err(CodecError::Corrupt);
                }
                lz_copy(buf, pos, length, offset as usize);
                pos += length;
            } else {
                // Delta match.
                let power;
                let raw_offset;
                if range_decode_bit(
                    &mut rc,
                    &mut s.delta_match_state,
                    NUM_DELTA_MATCH_STATES as u32 - 1,
                    &mut s.delta_match_probs,
                ) == 0
                {
                    power = s.delta_power_code.decode(&mut is);
                    raw_offset = decode_value(
                        &mut s.delta_offset_code,
                        &mut is,
                        &tables.offset_base,
                        &tables.offset_extra_bits,
                    );
                } else {
                    let mut i = 0;
                    while i < NUM_RECENT_OFFSETS - 1 {
                        if range_decode_bit(
                            &mut rc,
                            &mut s.delta_repeat_match_states[i],
                            NUM_DELTA_REPEAT_MATCH_STATES as u32 - 1,
                            &mut s.delta_repeat_match_probs[i],
                        ) == 0
                        {
                            break;
                        }
                        i += 1;
                    }
                    power = s.delta_lru.recent_powers[i];
                    raw_offset = s.delta_lru.recent_offsets[i];
                    for j in i..NUM_RECENT_OFFSETS {
                        s.delta_lru.recent_powers[j] = s.delta_lru.recent_powers[j + 1];
                        s.delta_lru.recent_offsets[j] = s.delta_lru.recent_offsets[j + 1];
                    }
                }
                s.delta_lru.upcoming_power = power;
                s.delta_lru.upcoming_offset = raw_offset;

                let length = decode_value(
                    &mut s.length_code,
                    &mut is,
                    &tables.length_base,
                    &tables.length_extra_bits,
                ) as usize;

                if power > 30 {
                    return Err(CodecError::Corrupt);
                }
                let offset1 = 1u64 << power;
                let offset2 = raw_offset << power;
                let offset = offset1 + offset2;

                if length > buf.len() - pos || offset > pos as u64 {
                    return Err(CodecError::Corrupt);
                }
                let (o1, o2, o) = (offset1 as usize, offset2 as usize, offset as usize);
                for k in 0..length {
                    let p = pos + k;
                    buf[p] = buf[p - o1].wrapping_add(buf[p - o2]).wrapping_sub(buf[p - o]);
                }
                pos += length;
            }

            s.lz_lru.update();
            s.delta_lru.update();
        }

        x86_filter(&mut buf[start..], &mut self.last_target_usages, true);
        Ok(())
    }
}

fn decode_value(
    code: &mut AdaptiveCode,
    is: &mut BackwardBitstream<'_>,
    bases: &[u64],
    extra_bits: &[u8],
) -> u64 {
    let slot = code.decode(is) as usize;
    let extra = is.read_bits(extra_bits[slot] as u32);
    bases[slot] + extra as u64
}

fn encode_value(
    code: &mut AdaptiveCode,
    os: &mut BackwardBitWriter,
    bases: &[u64],
    extra_bits: &[u8],
    value: u64,
) {
    let slot = slot_for(bases, value);
    code.encode(os, slot as u32);
    os.put_bits((value - bases[slot]) as u32, extra_bits[slot] as u32);
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

const MIN_MATCH_LEN: usize = 2;

/// Compressor for LZMS chunks: a greedy parse whose emitted item stream
/// drives the same adaptive coder state machine as the decompressor.
pub struct LzmsCompressor {
    state: CoderState,
    rc: RangeEncoder,
    os: BackwardBitWriter,
    mf: MatchFinder,
    /// Dictionary context plus the x86-filtered current chunk.
    buf: Vec<u8>,
    /// How many buffer positions the match finder has indexed; lets
    /// consecutive chunks of one solid resource reuse the index instead of
    /// re-walking the whole history. Stale entries are harmless: every
    /// candidate is verified byte-for-byte against the current buffer.
    indexed_len: usize,
    last_target_usages: Vec<i32>,
}

impl LzmsCompressor {
    pub fn new(max_chunk_size: u32) -> Self {
        Self {
            state: CoderState::new(),
            rc: RangeEncoder::new(),
            os: BackwardBitWriter::new(),
            mf: MatchFinder::new(max_chunk_size as usize * 2),
            buf: Vec::new(),
            indexed_len: 0,
            last_target_usages: vec![0; 65536],
        }
    }

    pub fn compress(&mut self, input: &[u8], start: usize, out: &mut [u8]) -> Option<usize> {
        let chunk_len = input.len() - start;
        if chunk_len < 8 {
            return None;
        }

        // Matches assert equality against the *decoded* stream, which holds
        // unfiltered bytes for prior chunks and filtered bytes for the
        // current chunk (the decoder unfilters each chunk only after its
        // items are decoded).
        self.buf.clear();
        self.buf.extend_from_slice(input);
        x86_filter(&mut self.buf[start..], &mut self.last_target_usages, false);

        let num_offset_slots = num_offset_slots_for((self.buf.len() as u64 - 1).max(1));
        self.state.reset(num_offset_slots);
        self.rc.reset();
        self.os.reset();
        if start == 0 || start != self.indexed_len {
            self.mf.reset();
        }
        self.indexed_len = self.buf.len();
        let tables = slot_tables();
        let s = &mut self.state;
        let buf = &self.buf;

        let mut pos = start;
        while pos < buf.len() {
            s.lz_lru.upcoming_offset = 0;
            s.delta_lru.upcoming_power = 0;
            s.delta_lru.upcoming_offset = 0;

            let max_len = buf.len() - pos;

            // Longest match at any of the three visible recent offsets.
            let mut rep_len = 0usize;
            let mut rep_idx = 0usize;
            for i in 0..NUM_RECENT_OFFSETS {
                let off = s.lz_lru.recent_offsets[i];
                if off <= pos as u64 {
                    let len = match_len(buf, pos - off as usize, pos, max_len);
                    if len > rep_len {
                        rep_len = len;
                        rep_idx = i;
                    }
                }
            }
            let explicit = self.mf.find_match(buf, pos, 0, 3, max_len);
            let explicit_len = explicit.map_or(0, |(l, _)| l);

            if rep_len >= MIN_MATCH_LEN && rep_len + 2 >= explicit_len {
                // Repeat-offset LZ match.
                let offset = s.lz_lru.recent_offsets[rep_idx];
                range_encode_bit(&mut self.rc, 1, &mut s.main_state, NUM_MAIN_STATES as u32 - 1, &mut s.main_probs);
                range_encode_bit(&mut self.rc, 0, &mut s.match_state, NUM_MATCH_STATES as u32 - 1, &mut s.match_probs);
                range_encode_bit(
                    &mut self.rc,
                    1,
                    &mut s.lz_match_state,
                    NUM_LZ_MATCH_STATES as u32 - 1,
                    &mut s.lz_match_probs,
                );
                for i in 0..rep_idx {
                    range_encode_bit(
                        &mut self.rc,
                        1,
                        &mut s.lz_repeat_match_states[i],
                        NUM_LZ_REPEAT_MATCH_STATES as u32 - 1,
                        &mut s.lz_repeat_match_probs[i],
                    );
                }
                if rep_idx < NUM_RECENT_OFFSETS - 1 {
                    range_encode_bit(
                        &mut self.rc,
                        0,
                        &mut s.lz_repeat_match_states[rep_idx],
                        NUM_LZ_REPEAT_MATCH_STATES as u32 - 1,
                        &mut s.lz_repeat_match_probs[rep_idx],
                    );
                }
                for j in rep_idx..NUM_RECENT_OFFSETS {
                    s.lz_lru.recent_offsets[j] = s.lz_lru.recent_offsets[j + 1];
                }
                s.lz_lru.upcoming_offset = offset;
                encode_value(
                    &mut s.length_code,
                    &mut self.os,
                    &tables.length_base,
                    &tables.length_extra_bits,
                    rep_len as u64,
                );
                for p in pos..pos + rep_len {
                    self.mf.insert(buf, p);
                }
                pos += rep_len;
            } else if let Some((len, offset)) = explicit.filter(|&(l, _)| l >= 3) {
                // Explicit-offset LZ match.
                range_encode_bit(&mut self.rc, 1, &mut s.main_state, NUM_MAIN_STATES as u32 - 1, &mut s.main_probs);
                range_encode_bit(&mut self.rc, 0, &mut s.match_state, NUM_MATCH_STATES as u32 - 1, &mut s.match_probs);
                range_encode_bit(
                    &mut self.rc,
                    0,
                    &mut s.lz_match_state,
                    NUM_LZ_MATCH_STATES as u32 - 1,
                    &mut s.lz_match_probs,
                );
                encode_value(
                    &mut s.lz_offset_code,
                    &mut self.os,
                    &tables.offset_base,
                    &tables.offset_extra_bits,
                    offset as u64,
                );
                s.lz_lru.upcoming_offset = offset as u64;
                encode_value(
                    &mut s.length_code,
                    &mut self.os,
                    &tables.length_base,
                    &tables.length_extra_bits,
                    len as u64,
                );
                for p in pos..pos + len {
                    self.mf.insert(buf, p);
                }
                pos += len;
            } else {
                // Literal.
                range_encode_bit(&mut self.rc, 0, &mut s.main_state, NUM_MAIN_STATES as u32 - 1, &mut s.main_probs);
                s.literal_code.encode(&mut self.os, buf[pos] as u32);
                self.mf.insert(buf, pos);
                pos += 1;
            }

            s.lz_lru.update();
            s.delta_lru.update();
        }

        self.rc.flush();
        self.os.flush();

        let total = self.rc.out.len() + self.os.units.len() * 2;
        tracing::trace!(
            chunk_len,
            range_coded = self.rc.out.len(),
            huffman_coded = self.os.units.len() * 2,
            "LZMS chunk encoded"
        );
        if total >= chunk_len {
            return None;
        }
        out[..self.rc.out.len()].copy_from_slice(&self.rc.out);
        let mut at = self.rc.out.len();
        for &unit in self.os.units.iter().rev() {
            out[at..at + 2].copy_from_slice(&unit.to_le_bytes());
            at += 2;
        }
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_chunks(data: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut c = LzmsCompressor::new(chunk_size.next_power_of_two().max(1 << 15) as u32);
        let mut d = LzmsDecompressor::new();
        let mut decoded = vec![0u8; 0];
        let mut encoded_chunks: Vec<Option<Vec<u8>>> = Vec::new();

        let mut start = 0;
        while start < data.len() {
            let end = (start + chunk_size).min(data.len());
            let mut out = vec![0u8; end - start];
            match c.compress(&data[..end], start, &mut out) {
                Some(n) => encoded_chunks.push(Some(out[..n].to_vec())),
                None => encoded_chunks.push(None),
            }
            start = end;
        }

        let mut start = 0;
        for chunk in encoded_chunks {
            let end = (start + chunk_size).min(data.len());
            decoded.resize(end, 0);
            match chunk {
                Some(cdata) => {
                    d.decompress(&cdata, &mut decoded, start).unwrap();
                }
                None => {
                    decoded[start..end].copy_from_slice(&data[start..end]);
                }
            }
            start = end;
        }
        decoded
    }

    #[test]
    fn single_chunk_text_roundtrips() {
        let data: Vec<u8> = (0..500)
            .flat_map(|i| format!("entry {i}: some compressible content here\n").into_bytes())
            .collect();
        assert_eq!(roundtrip_chunks(&data, data.len()), data);
    }

    #[test]
    fn zeros_roundtrip() {
        let data = vec![0u8; 65536];
        assert_eq!(roundtrip_chunks(&data, 65536), data);
    }

    #[test]
    fn solid_chunks_share_dictionary() {
        // Second chunk repeats the first; matches must reach across the
        // chunk boundary for this to compress.
        let unit: Vec<u8> = (0..200u32)
            .flat_map(|i| format!("record {:04} with shared text;", i * 17 % 1000).into_bytes())
            .collect();
        let mut data = unit.clone();
        data.extend_from_slice(&unit);
        let chunk = unit.len();
        assert_eq!(roundtrip_chunks(&data, chunk), data);
    }

    #[test]
    fn adaptive_rebuild_cadence_is_exercised() {
        // More than 1024 literals + matches forces several Huffman rebuilds.
        let data: Vec<u8> = (0..40_000u32).map(|i| (i * i % 251) as u8).collect();
        assert_eq!(roundtrip_chunks(&data, data.len()), data);
    }

    #[test]
    fn x86_filter_is_invertible() {
        let mut data = vec![0u8; 256];
        for i in (8..200).step_by(24) {
            data[i] = 0xe8;
            data[i + 1..i + 5].copy_from_slice(&(i as i32 * 31).to_le_bytes());
        }
        data[60] = 0x48;
        data[61] = 0x8b;
        data[62] = 0x05;
        let orig = data.clone();
        let mut usages = vec![0i32; 65536];
        x86_filter(&mut data, &mut usages, false);
        x86_filter(&mut data, &mut usages, true);
        assert_eq!(data, orig);
    }

    #[test]
    fn slot_tables_are_consistent() {
        let t = slot_tables();
        assert_eq!(t.offset_extra_bits.len(), MAX_NUM_OFFSET_SYMS);
        assert_eq!(t.length_base[0], 1);
        assert_eq!(t.offset_base[0], 1);
        for slot in 0..NUM_LENGTH_SYMS {
            assert_eq!(
                t.length_base[slot + 1] - t.length_base[slot],
                1 << t.length_extra_bits[slot]
            );
        }
        // Lengths 1..=27 each get their own slot.
        assert_eq!(t.length_base[27], 28);
        // Every offset up to the cap maps to a slot that round-trips.
        for offset in [1u64, 2, 9, 10, 100, 4096, 65535, 1 << 20] {
            let slot = slot_for(&t.offset_base, offset);
            assert!(t.offset_base[slot] <= offset && offset < t.offset_base[slot + 1]);
        }
    }

    #[test]
    fn corrupt_input_is_rejected() {
        let mut d = LzmsDecompressor::new();
        let mut out = vec![0u8; 100];
        assert!(d.decompress(&[1, 2, 3], &mut out, 0).is_err());
        assert!(d.decompress(&[0xff; 7], &mut out, 0).is_err());
    }
}
