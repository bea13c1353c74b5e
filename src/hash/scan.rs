//! Conservative scanning for hash references embedded in values.
//!
//! A value is opaque bytes, but any maximal run of hash-alphabet bytes
//! whose length is exactly [`HASH_LEN`](super::HASH_LEN) is treated as
//! an outgoing resource reference. Runs of any other length are
//! skipped. The scan is a single left-to-right pass, linear in the
//! value length, and deterministic.

use super::{is_hash_byte, Hash, HASH_LEN};

/// Folds `f` over every hash dependency of `value`, left to right.
pub fn fold_deps<A, F>(value: &[u8], seed: A, mut f: F) -> A
where
    F: FnMut(A, Hash) -> A,
{
    let mut acc = seed;
    let mut i = 0;
    while i < value.len() {
        if is_hash_byte(value[i]) {
            let start = i;
            while i < value.len() && is_hash_byte(value[i]) {
                i += 1;
            }
            if i - start == HASH_LEN {
                acc = f(acc, Hash::from_encoded(&value[start..i]));
            }
        } else {
            i += 1;
        }
    }
    acc
}

/// Calls `f` for every hash dependency of `value`, left to right.
pub fn iter_deps<F>(value: &[u8], mut f: F)
where
    F: FnMut(Hash),
{
    fold_deps(value, (), |(), h| f(h));
}

/// Collects the hash dependencies of `value` in order of appearance.
pub fn deps(value: &[u8]) -> Vec<Hash> {
    fold_deps(value, Vec::new(), |mut acc, h| {
        acc.push(h);
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash;

    #[test]
    fn test_finds_planted_hash() {
        let h = hash(b"payload");
        let mut value = Vec::new();
        value.extend_from_slice(b"prefix ");
        value.extend_from_slice(h.as_bytes());
        value.extend_from_slice(b" suffix");
        assert_eq!(deps(&value), vec![h]);
    }

    #[test]
    fn test_hash_alone_is_found() {
        let h = hash(b"bare");
        assert_eq!(deps(h.as_bytes()), vec![h]);
    }

    #[test]
    fn test_overlong_run_is_skipped() {
        let h = hash(b"overlong");
        let mut value = Vec::new();
        value.extend_from_slice(h.as_bytes());
        // One more alphabet byte makes the run 65 long: not a reference.
        value.push(b'b');
        assert!(deps(&value).is_empty());
    }

    #[test]
    fn test_short_run_is_skipped() {
        let h = hash(b"short");
        assert!(deps(&h.as_bytes()[1..]).is_empty());
    }

    #[test]
    fn test_separator_terminates_run() {
        let h1 = hash(b"one");
        let h2 = hash(b"two");
        let mut value = Vec::new();
        value.extend_from_slice(h1.as_bytes());
        value.push(b' ');
        value.extend_from_slice(h2.as_bytes());
        assert_eq!(deps(&value), vec![h1, h2]);
    }

    #[test]
    fn test_adjacent_hashes_fuse_into_skipped_run() {
        // Two hashes back to back form a 128-byte run: conservative
        // scanning rejects it, so writers must separate embedded refs.
        let h = hash(b"fused");
        let mut value = Vec::new();
        value.extend_from_slice(h.as_bytes());
        value.extend_from_slice(h.as_bytes());
        assert!(deps(&value).is_empty());
    }

    #[test]
    fn test_fold_accumulates_in_order() {
        let h1 = hash(b"first");
        let h2 = hash(b"second");
        let mut value = Vec::new();
        value.extend_from_slice(h1.as_bytes());
        value.push(b'\n');
        value.extend_from_slice(h2.as_bytes());
        let count = fold_deps(&value, 0usize, |n, _| n + 1);
        assert_eq!(count, 2);
        assert_eq!(deps(&value), vec![h1, h2]);
    }

    #[test]
    fn test_empty_and_plain_values() {
        assert!(deps(b"").is_empty());
        assert!(deps(b"no references here, just text 123").is_empty());
    }
}
