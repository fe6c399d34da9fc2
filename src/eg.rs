//! Exponential-Golomb code readers: `ue(v)`, `se(v)`, `me(v)`, `te(v)`.

use crate::bitreader::{BitReader, BitReaderError, Result};

/// Unsigned exp-Golomb: count leading zeros `k`, read `k+1` bits, subtract 1.
pub fn read_ue(r: &mut BitReader) -> Result<u32> {
    let mut leading_zero_bits = 0u32;
    while r.read_bit()? == 0 {
        leading_zero_bits += 1;
        if leading_zero_bits > 31 {
            return Err(BitReaderError::ExpGolombOverflow);
        }
    }
    if leading_zero_bits == 0 {
        return Ok(0);
    }
    let suffix = r.read_bits(leading_zero_bits)?;
    Ok((1u32 << leading_zero_bits) - 1 + suffix)
}

/// Signed exp-Golomb: `ue(v)` reinterpreted with alternating sign (odd
/// code_num positive, even negative).
pub fn read_se(r: &mut BitReader) -> Result<i32> {
    let code_num = read_ue(r)?;
    let magnitude = ((code_num + 1) / 2) as i32;
    if code_num % 2 == 1 {
        Ok(magnitude)
    } else {
        Ok(-magnitude)
    }
}

/// Mapped exp-Golomb, used for coded_block_pattern: the raw `ue(v)` is
/// reinterpreted through a chroma-format-dependent mapping table.
pub fn read_me(r: &mut BitReader, chroma_format_idc: u8) -> Result<u32> {
    let code_num = read_ue(r)?;
    let table: &[u32; 48] = if chroma_format_idc == 1 || chroma_format_idc == 2 {
        &ME_MAP_CHROMA
    } else {
        &ME_MAP_MONOCHROME
    };
    Ok(*table.get(code_num as usize).unwrap_or(&code_num))
}

/// Truncated exp-Golomb. `max_value` 0 => implicitly 0, 1 => single
/// inverted bit, otherwise falls back to `ue(v)`.
pub fn read_te(r: &mut BitReader, max_value: u32) -> Result<u32> {
    if max_value == 0 {
        Ok(0)
    } else if max_value == 1 {
        Ok(1 - r.read_bit()?)
    } else {
        read_ue(r)
    }
}

// Table 9-4 (coded_block_pattern mapping), ChromaArrayType in {1,2}.
const ME_MAP_CHROMA: [u32; 48] = [
    47, 31, 15, 0, 23, 27, 29, 30, 7, 11, 13, 14, 39, 43, 45, 46, 16, 3, 5, 10, 12, 19, 21, 26, 28,
    35, 37, 42, 44, 1, 2, 4, 8, 17, 18, 20, 24, 6, 9, 22, 25, 32, 33, 34, 36, 40, 38, 41,
];

// Table 9-4, ChromaArrayType in {0,3}.
const ME_MAP_MONOCHROME: [u32; 48] = [
    15, 0, 7, 11, 13, 14, 3, 5, 10, 12, 1, 2, 4, 8, 6, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_from_bits(bits: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut acc = 0u8;
        let mut n = 0;
        for c in bits.chars() {
            acc = (acc << 1) | if c == '1' { 1 } else { 0 };
            n += 1;
            if n == 8 {
                bytes.push(acc);
                acc = 0;
                n = 0;
            }
        }
        if n > 0 {
            acc <<= 8 - n;
            bytes.push(acc);
        }
        bytes
    }

    #[test]
    fn ue_zero() {
        let data = reader_from_bits("1");
        let mut r = BitReader::new(&data);
        assert_eq!(read_ue(&mut r).unwrap(), 0);
    }

    #[test]
    fn ue_small_values() {
        // "010" -> 1, "011" -> 2, "00100" -> 3
        let data = reader_from_bits("010");
        let mut r = BitReader::new(&data);
        assert_eq!(read_ue(&mut r).unwrap(), 1);

        let data = reader_from_bits("011");
        let mut r = BitReader::new(&data);
        assert_eq!(read_ue(&mut r).unwrap(), 2);

        let data = reader_from_bits("00100");
        let mut r = BitReader::new(&data);
        assert_eq!(read_ue(&mut r).unwrap(), 3);
    }

    #[test]
    fn se_alternating_sign() {
        // code_num 1 (odd) -> +1; code_num 2 (even) -> -1
        let data = reader_from_bits("010");
        let mut r = BitReader::new(&data);
        assert_eq!(read_se(&mut r).unwrap(), 1);

        let data = reader_from_bits("011");
        let mut r = BitReader::new(&data);
        assert_eq!(read_se(&mut r).unwrap(), -1);
    }

    #[test]
    fn te_single_bit_inverted() {
        let data = reader_from_bits("0");
        let mut r = BitReader::new(&data);
        assert_eq!(read_te(&mut r, 1).unwrap(), 1);

        let data = reader_from_bits("1");
        let mut r = BitReader::new(&data);
        assert_eq!(read_te(&mut r, 1).unwrap(), 0);
    }

    #[test]
    fn te_zero_max_is_implicit() {
        let data = reader_from_bits("1");
        let mut r = BitReader::new(&data);
        assert_eq!(read_te(&mut r, 0).unwrap(), 0);
    }
}
