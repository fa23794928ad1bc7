//! Constant-time comparisons.
//!
//! Proof checks go through here so that a mismatch position does not leak
//! through timing.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Returns `true` if slices are equal, `false` otherwise.
/// Execution time depends only on slice length, not content.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Timing-safe 32-byte array comparison.
#[must_use]
#[inline(never)]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"flare", b"flare"));
        assert!(!ct_eq(b"flare", b"flarf"));
        assert!(!ct_eq(b"flare", b"flar"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_verify_32() {
        let a = [7u8; 32];
        let mut b = a;
        assert!(verify_32(&a, &b));
        b[31] ^= 1;
        assert!(!verify_32(&a, &b));
    }
}
