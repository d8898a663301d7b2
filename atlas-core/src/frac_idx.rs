//! Fractional indexing for sibling and layer order.
//!
//! An idx is a string of printable ASCII digits (`' '` through `'~'`). Keys
//! sort lexicographically, so a new key can always be generated between two
//! existing ones without renumbering anything.
//!
//! ```text
//!   before = "A"            after = "B"
//!        │                       │
//!        ▼                       ▼
//!   ... "A" ──── "AO" + jitter ──── "B" ...
//! ```
//!
//! Client inserts use [`between`], which appends a few random digits so two
//! peers inserting into the same gap rarely pick the same key. Server-side
//! repairs use [`between_static`], which is reproducible.
//!
//! Reference: <https://madebyevan.com/algos/crdt-fractional-indexing/>

use rand::Rng;
use thiserror::Error;

/// Smallest digit.
pub const MIN_DIGIT: u8 = b' ';
/// Largest digit.
pub const MAX_DIGIT: u8 = b'~';
/// Exclusive upper bound of the random jitter value.
const MAX_JITTER: u32 = 0x10;

const BASE: u32 = (MAX_DIGIT - MIN_DIGIT) as u32 + 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FracIdxError {
    #[error("idx digit out of range: {0:#04x}")]
    InvalidDigit(u8),
    #[error("idx cannot be the empty string")]
    Empty,
    #[error("idx cannot end with the minimum digit")]
    TrailingMinDigit,
}

/// Check that `idx` can be stored on a feature or layer.
///
/// Nothing sorts between `x` and `x` followed by minimum digits, so stored
/// keys may not end in one. Generated keys never do.
pub fn validate(idx: &str) -> Result<(), FracIdxError> {
    if idx.is_empty() {
        return Err(FracIdxError::Empty);
    }
    validate_digits(idx)?;
    if idx.as_bytes().last() == Some(&MIN_DIGIT) {
        return Err(FracIdxError::TrailingMinDigit);
    }
    Ok(())
}

fn validate_digits(value: &str) -> Result<(), FracIdxError> {
    match value.bytes().find(|d| !(MIN_DIGIT..=MAX_DIGIT).contains(d)) {
        Some(bad) => Err(FracIdxError::InvalidDigit(bad)),
        None => Ok(()),
    }
}

/// Generate an idx strictly between `before` and `after`, with jitter.
///
/// An empty `before` means no lower bound, an empty `after` means no upper
/// bound.
pub fn between(before: &str, after: &str) -> Result<String, FracIdxError> {
    between_with_rng(&mut rand::thread_rng(), before, after)
}

/// Like [`between`] but draws jitter from the given generator.
pub fn between_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    before: &str,
    after: &str,
) -> Result<String, FracIdxError> {
    let jitter = rng.gen_range(0..MAX_JITTER);
    generate(before, after, Some(jitter))
}

/// Deterministic variant without jitter, used for server-side repairs.
pub fn between_static(before: &str, after: &str) -> Result<String, FracIdxError> {
    generate(before, after, None)
}

fn generate(before: &str, after: &str, jitter: Option<u32>) -> Result<String, FracIdxError> {
    validate_digits(before)?;
    validate_digits(after)?;
    let before = before.as_bytes();
    let after = after.as_bytes();

    let mut found_difference = false;
    let mut result: Vec<u8> = Vec::with_capacity(before.len() + 2);
    let mut i = 0;
    loop {
        // Past the end, "before" reads as the minimum digit and "after" as one
        // past the maximum, so a generated digit may still be MAX_DIGIT.
        let digit_before = before.get(i).map_or(MIN_DIGIT as u32, |&d| d as u32);
        let digit_after = match after.get(i) {
            Some(&d) if !found_difference => d as u32,
            _ => MAX_DIGIT as u32 + 1,
        };

        let pick = (digit_before + digit_after) >> 1;
        result.push(pick as u8);

        if pick <= digit_before {
            // Adjacent digits: the shared prefix ended, every following digit
            // of "after" is effectively larger than MAX_DIGIT.
            if digit_before < digit_after {
                found_difference = true;
            }
            i += 1;
            continue;
        }

        if let Some(mut jitter) = jitter {
            while jitter > 0 {
                let digit = jitter % BASE;
                jitter /= BASE;
                result.push(MIN_DIGIT + digit as u8);
            }
        }

        // Every pushed byte lies in MIN_DIGIT..=MAX_DIGIT.
        return Ok(result.into_iter().map(char::from).collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_between_empty_bounds() {
        let idx = between_static("", "").unwrap();
        assert_eq!(idx, "O");
        assert!(validate(&idx).is_ok());

        let jittered = between("", "").unwrap();
        assert!(jittered.starts_with('O'));
    }

    #[test]
    fn test_between_adjacent_digits() {
        let idx = between_static("A", "B").unwrap();
        assert_eq!(idx, "AO");
        assert!("A" < idx.as_str() && idx.as_str() < "B");
    }

    #[test]
    fn test_between_open_ends() {
        let low = between_static("", "O").unwrap();
        assert!(low.as_str() < "O");

        let high = between_static("O", "").unwrap();
        assert!(high.as_str() > "O");
    }

    #[test]
    fn test_between_shared_prefix() {
        // "19" and "23" cannot split at the first digit, so the next digit
        // must be above '9'.
        let idx = between_static("19", "23").unwrap();
        assert!("19" < idx.as_str() && idx.as_str() < "23", "{idx}");
    }

    #[test]
    fn test_between_max_digit_tail() {
        let idx = between_static("~", "").unwrap();
        assert!(idx.as_str() > "~");
        assert!(validate(&idx).is_ok());
    }

    #[test]
    fn test_invalid_digit() {
        assert_eq!(between("a\u{7f}", ""), Err(FracIdxError::InvalidDigit(0x7f)));
        assert_eq!(between("", "\n"), Err(FracIdxError::InvalidDigit(b'\n')));
        assert_eq!(validate(""), Err(FracIdxError::Empty));
        assert_eq!(validate("A "), Err(FracIdxError::TrailingMinDigit));
        assert!(validate(" A").is_ok());
    }

    #[test]
    fn test_jitter_is_seeded() {
        let mut a = SmallRng::seed_from_u64(7);
        let mut b = SmallRng::seed_from_u64(7);
        for _ in 0..32 {
            assert_eq!(
                between_with_rng(&mut a, "A", "B").unwrap(),
                between_with_rng(&mut b, "A", "B").unwrap()
            );
        }
    }

    #[test]
    fn test_jitter_spreads_concurrent_inserts() {
        let mut rng = SmallRng::seed_from_u64(42);
        let picks: std::collections::HashSet<String> = (0..64)
            .map(|_| between_with_rng(&mut rng, "A", "B").unwrap())
            .collect();
        assert!(picks.len() > 1);
        for idx in &picks {
            assert!("A" < idx.as_str() && idx.as_str() < "B", "{idx:?}");
        }
    }

    #[test]
    fn test_repeated_prepend_stays_ordered() {
        let mut first = between_static("", "").unwrap();
        for _ in 0..200 {
            let next = between_static("", &first).unwrap();
            assert!(next < first, "{next:?} !< {first:?}");
            first = next;
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn idx_strategy() -> impl Strategy<Value = String> {
            "[!-~][ -~]{0,6}[!-~]|[!-~]"
        }

        proptest! {
            #[test]
            fn between_is_strictly_between(a in idx_strategy(), b in idx_strategy(), seed in any::<u64>()) {
                prop_assume!(a != b);
                let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                let mut rng = SmallRng::seed_from_u64(seed);
                let idx = between_with_rng(&mut rng, &lo, &hi).unwrap();
                prop_assert!(lo < idx && idx < hi, "{:?} < {:?} < {:?}", lo, idx, hi);
            }

            #[test]
            fn between_open_upper_bound(a in idx_strategy()) {
                let idx = between_static(&a, "").unwrap();
                prop_assert!(idx > a);
                prop_assert!(validate(&idx).is_ok());
            }
        }
    }
}
