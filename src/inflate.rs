//! A DEFLATE (RFC 1951) decompressor.
//!
//! ZIP stores most entries as raw DEFLATE streams: a sequence of blocks,
//! each stored verbatim or entropy-coded with fixed or per-block ("dynamic")
//! canonical Huffman codes, plus LZ77 back-references into the bytes already
//! produced.
//!
//! Huffman codes are kept in the two-array canonical form (a histogram of
//! code lengths and a symbol permutation) instead of a pointer-linked tree;
//! decoding walks the histogram one bit at a time. Both arrays are small and
//! cache-resident, which matters because every symbol goes through them.

use crate::result::*;

/// Longest Huffman code RFC 1951 allows.
const MAX_BITS: usize = 15;
/// The literal/length alphabet is the largest one: 288 symbols.
const MAX_SYMBOLS: usize = 288;

/// Positions of the code-length-code lengths in a dynamic block header.
const CLCL_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// LSB-first bit cursor over a byte slice.
///
/// Up to 32 bits sit in `tag`; `bitcount` of them are valid.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    tag: u32,
    bitcount: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            pos: 0,
            tag: 0,
            bitcount: 0,
        }
    }

    /// Tops the accumulator up by whole bytes. 24 valid bits covers any
    /// 16-bit read plus alignment slop.
    fn refill(&mut self) {
        while self.bitcount < 24 && self.pos < self.data.len() {
            self.tag |= (self.data[self.pos] as u32) << self.bitcount;
            self.pos += 1;
            self.bitcount += 8;
        }
    }

    fn get_bit(&mut self) -> ZipResult<u32> {
        if self.bitcount == 0 {
            if self.pos >= self.data.len() {
                return Err(ZipError::CorruptStream("unexpected end of input"));
            }
            self.tag = self.data[self.pos] as u32;
            self.pos += 1;
            self.bitcount = 8;
        }
        let bit = self.tag & 1;
        self.tag >>= 1;
        self.bitcount -= 1;
        Ok(bit)
    }

    /// Reads a `num`-bit little-endian value and adds `base`.
    /// `num == 0` returns `base` untouched.
    fn read_bits(&mut self, num: u32, base: usize) -> ZipResult<usize> {
        if num == 0 {
            return Ok(base);
        }
        self.refill();
        if self.bitcount < num {
            return Err(ZipError::CorruptStream("unexpected end of input"));
        }
        let val = self.tag & ((1u32 << num) - 1);
        self.tag >>= num;
        self.bitcount -= num;
        Ok(base + val as usize)
    }

    /// Drops fractional bits and steps back over whole bytes the refill
    /// pulled in early, so `pos` lands on the byte after the last one
    /// actually consumed.
    fn align_to_byte(&mut self) {
        self.pos -= (self.bitcount / 8) as usize;
        self.tag = 0;
        self.bitcount = 0;
    }

    /// Reads a little-endian u16 from the byte-aligned position.
    fn read_aligned_u16(&mut self) -> ZipResult<u32> {
        if self.pos + 2 > self.data.len() {
            return Err(ZipError::CorruptStream("unexpected end of input"));
        }
        let val = self.data[self.pos] as u32 | (self.data[self.pos + 1] as u32) << 8;
        self.pos += 2;
        Ok(val)
    }

    /// Hands out `len` raw bytes from the byte-aligned position.
    fn take_aligned(&mut self, len: usize) -> ZipResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(ZipError::CorruptStream("stored block overruns input"));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

/// A canonical Huffman code: how many codes exist of each length, and the
/// symbols ordered by code length, then by symbol value.
struct HuffmanTree {
    counts: [u16; MAX_BITS + 1],
    symbols: [u16; MAX_SYMBOLS],
}

impl HuffmanTree {
    /// Builds the decode arrays from per-symbol code lengths
    /// (length 0 = symbol unused).
    fn build(lengths: &[u16]) -> Self {
        let mut counts = [0u16; MAX_BITS + 1];
        for &len in lengths {
            counts[len as usize] += 1;
        }
        counts[0] = 0;

        // Running starting index in `symbols` for each code length.
        let mut offsets = [0u16; MAX_BITS + 1];
        for len in 1..=MAX_BITS {
            offsets[len] = offsets[len - 1] + counts[len - 1];
        }

        let mut symbols = [0u16; MAX_SYMBOLS];
        for (sym, &len) in lengths.iter().enumerate() {
            if len > 0 {
                symbols[offsets[len as usize] as usize] = sym as u16;
                offsets[len as usize] += 1;
            }
        }

        HuffmanTree { counts, symbols }
    }

    /// Reads one symbol off the bit stream.
    ///
    /// Accumulates the code MSB-first while tracking how many codes of each
    /// length precede it; `cur` going negative means the code is complete
    /// and `sum + cur` indexes the symbol permutation.
    fn decode_symbol(&self, reader: &mut BitReader) -> ZipResult<u16> {
        reader.refill();
        let mut sum: i32 = 0;
        let mut cur: i32 = 0;
        for len in 1..=MAX_BITS {
            cur = 2 * cur + reader.get_bit()? as i32;
            let count = self.counts[len] as i32;
            sum += count;
            cur -= count;
            if cur < 0 {
                return Ok(self.symbols[(sum + cur) as usize]);
            }
        }
        Err(ZipError::CorruptStream("invalid Huffman code"))
    }
}

/// Fills `bits`/`base` for one of the two offset alphabets: the first
/// `delta` codes take no extra bits, the extra-bit count then grows by one
/// every `delta` codes, and each base picks up where the previous range
/// ended.
fn build_bits_base(bits: &mut [u32; 30], base: &mut [usize; 30], delta: usize, first: usize) {
    for i in 0..delta {
        bits[i] = 0;
    }
    for i in 0..30 - delta {
        bits[i + delta] = (i / delta) as u32;
    }
    let mut sum = first;
    for i in 0..30 {
        base[i] = sum;
        sum += 1 << bits[i];
    }
}

/// A DEFLATE decoder: the fixed Huffman trees and the length/distance
/// translation tables, built once and reused across blocks.
pub(crate) struct Inflater {
    fixed_literal: HuffmanTree,
    fixed_distance: HuffmanTree,
    length_bits: [u32; 30],
    length_base: [usize; 30],
    dist_bits: [u32; 30],
    dist_base: [usize; 30],
}

impl Inflater {
    pub(crate) fn new() -> Self {
        // RFC 1951 3.2.6: the fixed literal/length code.
        let mut lengths = [0u16; MAX_SYMBOLS];
        for i in 0..=143 {
            lengths[i] = 8;
        }
        for i in 144..=255 {
            lengths[i] = 9;
        }
        for i in 256..=279 {
            lengths[i] = 7;
        }
        for i in 280..=287 {
            lengths[i] = 8;
        }
        let fixed_literal = HuffmanTree::build(&lengths);
        let fixed_distance = HuffmanTree::build(&[5u16; 32]);

        let mut length_bits = [0u32; 30];
        let mut length_base = [0usize; 30];
        build_bits_base(&mut length_bits, &mut length_base, 4, 3);
        // Code 285 stands alone: exactly 258, no extra bits.
        length_bits[28] = 0;
        length_base[28] = 258;

        let mut dist_bits = [0u32; 30];
        let mut dist_base = [0usize; 30];
        build_bits_base(&mut dist_bits, &mut dist_base, 2, 1);

        Inflater {
            fixed_literal,
            fixed_distance,
            length_bits,
            length_base,
            dist_bits,
            dist_base,
        }
    }

    /// Decompresses a complete DEFLATE stream.
    ///
    /// `expected_size`, when the caller knows it (ZIP central directories
    /// do), sizes the output buffer up front.
    pub(crate) fn inflate(&self, data: &[u8], expected_size: Option<usize>) -> ZipResult<Vec<u8>> {
        let mut reader = BitReader::new(data);
        let mut output = Vec::with_capacity(expected_size.unwrap_or(0));

        loop {
            let bfinal = reader.read_bits(1, 0)?;
            let btype = reader.read_bits(2, 0)?;

            match btype {
                0 => inflate_stored(&mut reader, &mut output)?,
                1 => self.inflate_block(
                    &mut reader,
                    &mut output,
                    &self.fixed_literal,
                    &self.fixed_distance,
                )?,
                2 => {
                    let (literal, distance) = decode_dynamic_trees(&mut reader)?;
                    self.inflate_block(&mut reader, &mut output, &literal, &distance)?;
                }
                _ => return Err(ZipError::CorruptStream("reserved block type")),
            }

            if bfinal == 1 {
                break;
            }
        }

        Ok(output)
    }

    /// Decodes one Huffman-coded block body into `output`.
    fn inflate_block(
        &self,
        reader: &mut BitReader,
        output: &mut Vec<u8>,
        literal: &HuffmanTree,
        distance: &HuffmanTree,
    ) -> ZipResult<()> {
        loop {
            let sym = literal.decode_symbol(reader)? as usize;

            if sym < 256 {
                output.push(sym as u8);
                continue;
            }
            if sym == 256 {
                return Ok(());
            }

            let len_idx = sym - 257;
            if len_idx >= 29 {
                return Err(ZipError::CorruptStream("invalid length code"));
            }
            let length = reader.read_bits(self.length_bits[len_idx], self.length_base[len_idx])?;

            let dist_sym = distance.decode_symbol(reader)? as usize;
            if dist_sym >= 30 {
                return Err(ZipError::CorruptStream("invalid distance code"));
            }
            let dist = reader.read_bits(self.dist_bits[dist_sym], self.dist_base[dist_sym])?;
            if dist > output.len() {
                return Err(ZipError::CorruptStream("back-reference before start of output"));
            }

            // dist < length means the copy overlaps bytes it is itself
            // producing, so it has to run forward one byte at a time.
            let start = output.len() - dist;
            for i in 0..length {
                let byte = output[start + i];
                output.push(byte);
            }
        }
    }
}

/// Copies a stored (uncompressed) block through to `output`.
fn inflate_stored(reader: &mut BitReader, output: &mut Vec<u8>) -> ZipResult<()> {
    reader.align_to_byte();
    let len = reader.read_aligned_u16()?;
    let nlen = reader.read_aligned_u16()?;
    if len != !nlen & 0xFFFF {
        return Err(ZipError::CorruptStream("stored block length mismatch"));
    }
    output.extend_from_slice(reader.take_aligned(len as usize)?);
    Ok(())
}

/// Reads a dynamic block header: the code-length meta-tree, then the
/// run-length-coded lengths it protects, split into the literal/length and
/// distance trees.
fn decode_dynamic_trees(reader: &mut BitReader) -> ZipResult<(HuffmanTree, HuffmanTree)> {
    let hlit = reader.read_bits(5, 257)?;
    let hdist = reader.read_bits(5, 1)?;
    let hclen = reader.read_bits(4, 4)?;

    let mut code_lengths = [0u16; 19];
    for i in 0..hclen {
        code_lengths[CLCL_ORDER[i]] = reader.read_bits(3, 0)? as u16;
    }
    let meta = HuffmanTree::build(&code_lengths);

    let total = hlit + hdist;
    let mut lengths = vec![0u16; total];
    let mut num = 0;
    while num < total {
        match meta.decode_symbol(reader)? {
            sym @ 0..=15 => {
                lengths[num] = sym;
                num += 1;
            }
            16 => {
                if num == 0 {
                    return Err(ZipError::CorruptStream("length repeat with no previous length"));
                }
                let prev = lengths[num - 1];
                let repeat = reader.read_bits(2, 3)?;
                if num + repeat > total {
                    return Err(ZipError::CorruptStream("code length repeat overruns alphabet"));
                }
                for _ in 0..repeat {
                    lengths[num] = prev;
                    num += 1;
                }
            }
            17 => {
                let repeat = reader.read_bits(3, 3)?;
                if num + repeat > total {
                    return Err(ZipError::CorruptStream("code length repeat overruns alphabet"));
                }
                num += repeat;
            }
            18 => {
                let repeat = reader.read_bits(7, 11)?;
                if num + repeat > total {
                    return Err(ZipError::CorruptStream("code length repeat overruns alphabet"));
                }
                num += repeat;
            }
            _ => return Err(ZipError::CorruptStream("invalid code length symbol")),
        }
    }

    let literal = HuffmanTree::build(&lengths[..hlit]);
    let distance = HuffmanTree::build(&lengths[hlit..]);
    Ok((literal, distance))
}
