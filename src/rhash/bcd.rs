// 4-bit packings for lexical values drawn from the numeric and date
// alphabets. Two characters per byte, low nibble first, nibble 0 as the
// terminator, so up to 30 characters fit the 15 inline bytes of an entry.
// Nibble 10 encodes '0' (0 is taken by the terminator).

pub const INLINE_STR_LEN: usize = 15;

const BCD_MAP: [u8; 16] = [
    0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'.', b'+', b'-', b'e', b'?',
];

const BCDATE_MAP: [u8; 16] = [
    0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b':', b'+', b'-', b'T', b'Z',
];

// nibble 15 ('?') is reserved and never produced by the encoder
fn code_for(map: &[u8; 16], c: u8) -> Option<u8> {
    map[1..15].iter().position(|&m| m == c).map(|i| i as u8 + 1)
}

fn compress(map: &[u8; 16], s: &str) -> Option<[u8; INLINE_STR_LEN]> {
    if s.len() > INLINE_STR_LEN * 2 {
        return None;
    }
    let mut out = [0u8; INLINE_STR_LEN];
    for (pos, &c) in s.as_bytes().iter().enumerate() {
        let code = code_for(map, c)?;
        out[pos / 2] |= code << ((pos % 2) * 4);
    }
    Some(out)
}

fn uncompress(map: &[u8; 16], bcd: &[u8]) -> String {
    let mut out = String::with_capacity(INLINE_STR_LEN * 2);
    for pos in 0..INLINE_STR_LEN * 2 {
        let mut code = bcd[pos / 2];
        if pos % 2 == 0 {
            code &= 15;
        } else {
            code >>= 4;
        }
        if code == 0 {
            break;
        }
        out.push(map[code as usize] as char);
    }
    out
}

/// Pack a numeric lexical form (`0-9 . + - e`), or None if it doesn't fit
/// the alphabet or the 30-character limit.
pub fn compress_bcd(s: &str) -> Option<[u8; INLINE_STR_LEN]> {
    compress(&BCD_MAP, s)
}

pub fn uncompress_bcd(bcd: &[u8]) -> String {
    uncompress(&BCD_MAP, bcd)
}

/// Pack a date-ish lexical form (`0-9 : + - T Z`).
pub fn compress_bcdate(s: &str) -> Option<[u8; INLINE_STR_LEN]> {
    compress(&BCDATE_MAP, s)
}

pub fn uncompress_bcdate(bcd: &[u8]) -> String {
    uncompress(&BCDATE_MAP, bcd)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nibble_packing() {
        // '1' -> 1, '2' -> 2; low nibble first
        let packed = compress_bcd("12").unwrap();
        assert_eq!(packed[0], 0x21);
        assert_eq!(packed[1], 0);

        // '0' packs as nibble 10, not 0
        let packed = compress_bcd("0").unwrap();
        assert_eq!(packed[0], 10);
        assert_eq!(uncompress_bcd(&packed), "0");
    }

    #[test]
    fn numeric_roundtrip() {
        for s in ["3.14159265358979", "-1.6e-19", "+000123", "299792458"] {
            let packed = compress_bcd(s).unwrap();
            assert_eq!(uncompress_bcd(&packed), s, "{s}");
        }
    }

    #[test]
    fn date_roundtrip() {
        for s in ["2006-01-02T15:04:05Z", "2014-03-01T12:00:00+01:00"] {
            let packed = compress_bcdate(s).unwrap();
            assert_eq!(uncompress_bcdate(&packed), s, "{s}");
        }
    }

    #[test]
    fn rejects_foreign_characters() {
        assert!(compress_bcd("3.14 apples").is_none());
        assert!(compress_bcd("2006-01-02T15:04:05Z").is_none()); // 'T' isn't numeric
        assert!(compress_bcdate("3.5").is_none()); // '.' isn't a date char
    }

    #[test]
    fn rejects_over_30_chars() {
        let s = "1".repeat(31);
        assert!(compress_bcd(&s).is_none());
        // exactly 30 is fine, and has no terminator nibble
        let s = "1".repeat(30);
        let packed = compress_bcd(&s).unwrap();
        assert_eq!(uncompress_bcd(&packed), s);
    }
}
