//! Prefix-sharing codec for sorted `i64` arrays.
//!
//! A compressed block stores the element count (4 bytes, big-endian), the
//! shared prefix length in bits (1 byte), then a bit-packed body: the
//! shared leading bits of the minimum element once, followed by each
//! element's remaining `64 - prefix` suffix bits, concatenated MSB-first
//! with no byte alignment between fields.
//!
//! The split and redistribution searches below are balance heuristics,
//! not exhaustive minimizations: they binary-search candidate cut points,
//! moving toward the heavier side and keeping the earliest candidate on a
//! tie. Downstream page-count expectations are derived from exactly this
//! behavior, so it must not be "improved".

use bytes::{BufMut, BytesMut};

use crate::types::{Result, UmbraError};

/// Byte length of the count + prefix-length block header.
pub const BLOCK_HEADER_LEN: usize = 5;

/// Number of bits shared by the leading ends of `first` and `last`.
///
/// For an ascending array the first and last elements bound every
/// element's prefix, so this also bounds the whole array. Shifts are
/// arithmetic, which keeps the result meaningful for negative keys.
/// Returns 64 when the two are equal.
pub fn common_prefix(first: i64, last: i64) -> u8 {
    if first == last {
        return 64;
    }
    let mut prefix = 0u8;
    let mut low = 0i32;
    let mut high = 63i32;
    while low <= high {
        let mid = low + ((high - low) >> 1);
        if shares_prefix(first, last, mid as u8) {
            prefix = mid as u8;
            low = mid + 1;
        } else {
            high = mid - 1;
        }
    }
    prefix
}

fn shares_prefix(first: i64, last: i64, bits: u8) -> bool {
    if bits == 0 {
        return true;
    }
    first >> (64 - u32::from(bits)) == last >> (64 - u32::from(bits))
}

/// Shared prefix length of an ascending array; 0 for an empty one.
pub fn common_prefix_of(sorted: &[i64]) -> u8 {
    match (sorted.first(), sorted.last()) {
        (Some(&first), Some(&last)) => common_prefix(first, last),
        _ => 0,
    }
}

/// Body bytes needed to pack `count` elements under `prefix` shared bits.
/// The full block adds [`BLOCK_HEADER_LEN`].
pub fn encoded_size(count: usize, prefix: u8) -> usize {
    let bits = u64::from(prefix) + (64 - u64::from(prefix)) * count as u64;
    bits.div_ceil(8) as usize
}

/// Encode an ascending array into a compressed block.
pub fn encode(sorted: &[i64]) -> BytesMut {
    encode_with_prefix(sorted, common_prefix_of(sorted))
}

/// Encode an array that is not necessarily sorted, taking the prefix from
/// the scanned minimum and maximum. A prefix shared by min and max is
/// shared by every element in between, so the block layout is unchanged.
pub fn encode_unsorted(values: &[i64]) -> BytesMut {
    let prefix = match (values.iter().min(), values.iter().max()) {
        (Some(&min), Some(&max)) => common_prefix(min, max),
        _ => 0,
    };
    encode_with_prefix(values, prefix)
}

/// Encode with a zero-length prefix: the packed body degenerates to
/// fixed-width big-endian elements. Used when compression is disabled so
/// the page layout machinery stays uniform.
pub fn encode_raw(values: &[i64]) -> BytesMut {
    encode_with_prefix(values, 0)
}

fn encode_with_prefix(values: &[i64], prefix: u8) -> BytesMut {
    let mut out = BytesMut::with_capacity(BLOCK_HEADER_LEN + encoded_size(values.len(), prefix));
    out.put_u32(values.len() as u32);
    out.put_u8(prefix);

    let mut bits = BitWriter::default();
    if let Some(&first) = values.first() {
        bits.push(prefix_bits(first, prefix), prefix);
        let suffix = 64 - prefix;
        for &value in values {
            bits.push(value as u64, suffix);
        }
    }
    bits.finish(&mut out);
    out
}

/// Decode a compressed block produced by [`encode`] or [`encode_unsorted`].
pub fn decode(block: &[u8]) -> Result<Vec<i64>> {
    let (values, _) = decode_prefixed(block)?;
    Ok(values)
}

/// Decode a block and report how many input bytes it occupied, so callers
/// can parse blocks embedded in a larger page image.
pub fn decode_prefixed(block: &[u8]) -> Result<(Vec<i64>, usize)> {
    if block.len() < BLOCK_HEADER_LEN {
        return Err(UmbraError::Corruption("compressed block shorter than header"));
    }
    let count = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
    let prefix = block[4];
    if prefix > 64 {
        return Err(UmbraError::Corruption("prefix length exceeds 64 bits"));
    }
    let body_len = encoded_size(count, prefix);
    let body = block
        .get(BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + body_len)
        .ok_or(UmbraError::Corruption("compressed block body truncated"))?;

    let mut values = Vec::with_capacity(count);
    if count > 0 {
        let mut bits = BitReader::new(body);
        let high = if prefix == 0 {
            0
        } else {
            bits.take(prefix)? << (64 - u32::from(prefix))
        };
        let suffix = 64 - prefix;
        for _ in 0..count {
            values.push((high | bits.take(suffix)?) as i64);
        }
    }
    Ok((values, BLOCK_HEADER_LEN + body_len))
}

fn prefix_bits(value: i64, prefix: u8) -> u64 {
    if prefix == 0 {
        0
    } else {
        (value >> (64 - u32::from(prefix))) as u64
    }
}

/// Packed bit size of `count` elements sharing `prefix` leading bits.
fn packed_bits(prefix: u8, count: usize) -> u64 {
    u64::from(prefix) + (64 - u64::from(prefix)) * count as u64
}

/// Number of keys the left node keeps when splitting an overflowing
/// ascending array into two prefix-shared halves of near-equal packed
/// size. Each candidate cut recomputes both halves' prefixes, since the
/// cut changes each side's bounds and therefore its compressibility.
///
/// Requires at least two keys (a node never splits below that).
pub fn split_index(keys: &[i64]) -> usize {
    debug_assert!(keys.len() >= 2);
    let mut low = 0i64;
    let mut high = keys.len() as i64 - 1;
    let mut optimal = 0usize;
    let mut optimal_diff = u64::MAX;
    while low <= high {
        let mid = (low + ((high - low) >> 1)) as usize;
        // Left takes keys[..=mid]; the search never pushes mid to the
        // last index because a one-element right half packs to at most
        // 64 bits.
        let prefix_left = common_prefix(keys[0], keys[mid]);
        let prefix_right = common_prefix(keys[mid + 1], keys[keys.len() - 1]);
        let size_left = packed_bits(prefix_left, mid + 1);
        let size_right = packed_bits(prefix_right, keys.len() - 1 - mid);
        if size_left.abs_diff(size_right) < optimal_diff {
            optimal = mid;
            optimal_diff = size_left.abs_diff(size_right);
        }
        if size_left < size_right {
            low = mid as i64 + 1;
        } else {
            high = mid as i64 - 1;
        }
    }
    optimal + 1
}

/// Number of trailing keys to move from `left` into `right` when the left
/// sibling donates a suffix run. Searches for the cut index in `left`
/// that balances the packed sizes of `left[..=cut]` against
/// `left[cut + 1..] ++ right`.
pub fn keys_to_move_from_left(left: &[i64], right: &[i64]) -> usize {
    debug_assert!(!left.is_empty());
    let last_right = right.last().or(left.last()).copied().unwrap_or(0);
    let mut low = 0i64;
    let mut high = left.len() as i64 - 1;
    let mut optimal = 0usize;
    let mut optimal_diff = u64::MAX;
    while low <= high {
        let mid = (low + ((high - low) >> 1)) as usize;
        let right_first = if mid + 1 < left.len() {
            left[mid + 1]
        } else {
            last_right
        };
        let prefix_left = common_prefix(left[0], left[mid]);
        let prefix_right = common_prefix(right_first, last_right);
        let size_left = packed_bits(prefix_left, mid + 1);
        let size_right = packed_bits(prefix_right, left.len() - 1 - mid + right.len());
        if size_left.abs_diff(size_right) < optimal_diff {
            optimal = mid;
            optimal_diff = size_left.abs_diff(size_right);
        }
        if size_left < size_right {
            low = mid as i64 + 1;
        } else {
            high = mid as i64 - 1;
        }
    }
    left.len() - 1 - optimal
}

/// Number of leading keys to move from `right` into `left` when the right
/// sibling donates a prefix run; the mirror of [`keys_to_move_from_left`].
pub fn keys_to_move_from_right(left: &[i64], right: &[i64]) -> usize {
    debug_assert!(!right.is_empty());
    let first_left = left.first().or(right.first()).copied().unwrap_or(0);
    let mut low = 0i64;
    let mut high = right.len() as i64 - 1;
    let mut optimal = 0usize;
    let mut optimal_diff = u64::MAX;
    while low <= high {
        let mid = (low + ((high - low) >> 1)) as usize;
        let right_first = if mid + 1 < right.len() {
            right[mid + 1]
        } else {
            right[right.len() - 1]
        };
        let prefix_left = common_prefix(first_left, right[mid]);
        let prefix_right = common_prefix(right_first, right[right.len() - 1]);
        let size_left = packed_bits(prefix_left, left.len() + mid + 1);
        let size_right = packed_bits(prefix_right, right.len() - 1 - mid);
        if size_left.abs_diff(size_right) < optimal_diff {
            optimal = mid;
            optimal_diff = size_left.abs_diff(size_right);
        }
        if size_left < size_right {
            low = mid as i64 + 1;
        } else {
            high = mid as i64 - 1;
        }
    }
    optimal + 1
}

/// MSB-first bit packer.
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    /// Append the `nbits` low bits of `raw`, most significant first.
    fn push(&mut self, raw: u64, nbits: u8) {
        let mut remaining = nbits;
        while remaining > 0 {
            remaining -= 1;
            let bit = ((raw >> remaining) & 1) as u8;
            self.current |= bit << (7 - self.used);
            self.used += 1;
            if self.used == 8 {
                self.bytes.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    fn finish(mut self, out: &mut BytesMut) {
        if self.used > 0 {
            self.bytes.push(self.current);
        }
        out.put_slice(&self.bytes);
    }
}

/// MSB-first bit unpacker over a body slice.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    used: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, used: 0 }
    }

    fn take(&mut self, nbits: u8) -> Result<u64> {
        let mut value = 0u64;
        for _ in 0..nbits {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(UmbraError::Corruption("bit stream truncated"))?;
            let bit = (byte >> (7 - self.used)) & 1;
            value = (value << 1) | u64::from(bit);
            self.used += 1;
            if self.used == 8 {
                self.used = 0;
                self.pos += 1;
            }
        }
        Ok(value)
    }
}
