//! DNA nucleotide encoding
//!
//! 2-bit ranks for the DNA alphabet:
//! - A (65/97)  -> 0
//! - C (67/99)  -> 1
//! - G (71/103) -> 2
//! - T (84/116) -> 3
//!
//! With this order the complement of a rank is `3 - rank`, so reverse
//! complements can be computed without a lookup table.

/// Encode a single DNA nucleotide to its 2-bit rank.
///
/// Returns `None` for any byte outside A/C/G/T (case-insensitive). Callers
/// treat such bytes as window breaks rather than errors.
#[inline]
pub const fn rank_of(base: u8) -> Option<u8> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Decode a 2-bit rank back to its nucleotide (uppercase).
#[inline]
pub const fn base_of(rank: u8) -> u8 {
    match rank & 0b11 {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        _ => b'T',
    }
}

/// Complement of a 2-bit rank: A <-> T, C <-> G.
#[inline]
pub const fn complement_rank(rank: u8) -> u8 {
    3 - (rank & 0b11)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_roundtrip() {
        for &base in b"ACGT" {
            let rank = rank_of(base).unwrap();
            assert_eq!(base_of(rank), base);
        }
    }

    #[test]
    fn test_lowercase_accepted() {
        assert_eq!(rank_of(b'a'), Some(0));
        assert_eq!(rank_of(b'c'), Some(1));
        assert_eq!(rank_of(b'g'), Some(2));
        assert_eq!(rank_of(b't'), Some(3));
    }

    #[test]
    fn test_invalid_bases() {
        assert_eq!(rank_of(b'N'), None);
        assert_eq!(rank_of(b'-'), None);
        assert_eq!(rank_of(b' '), None);
    }

    #[test]
    fn test_complement() {
        assert_eq!(complement_rank(0), 3); // A -> T
        assert_eq!(complement_rank(1), 2); // C -> G
        assert_eq!(complement_rank(2), 1); // G -> C
        assert_eq!(complement_rank(3), 0); // T -> A
    }
}
