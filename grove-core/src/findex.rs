//! Fractional ordering keys for sibling blocks.
//!
//! Keys are lowercase-ASCII strings compared lexicographically. `between`
//! produces a key strictly inside any interval without renumbering the
//! neighbors, deepening the string when the interval has no room at the
//! current length. Generated keys never end in `'a'`; a key with a trailing
//! minimum digit would leave an unsplittable interval below it.

use crate::error::{GroveError, Result};

const MIN: u8 = b'a';
const MAX: u8 = b'z';
// Virtual sentinels one step outside the alphabet.
const FLOOR: u8 = MIN - 1;
const CEIL: u8 = MAX + 1;

/// The key assigned to the first block under a parent.
pub fn initial() -> String {
    "m".to_string()
}

/// A key strictly greater than `a`.
pub fn after(a: &str) -> Result<String> {
    between(a, "")
}

/// A key strictly smaller than `b`.
pub fn before(b: &str) -> Result<String> {
    between("", b)
}

/// A key `s` with `a < s < b`. An empty endpoint means unbounded on that
/// side.
pub fn between(a: &str, b: &str) -> Result<String> {
    validate_key(a)?;
    validate_key(b)?;
    if !a.is_empty() && !b.is_empty() && a >= b {
        return Err(GroveError::invalid_input(format!(
            "cannot order between '{a}' and '{b}': left is not smaller"
        )));
    }

    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut out: Vec<u8> = Vec::new();
    let mut i = 0;

    if !b.is_empty() {
        // Consume the common prefix, padding the exhausted left side with
        // the minimum digit.
        while i < b.len() && a.get(i).copied().unwrap_or(MIN) == b[i] {
            out.push(b[i]);
            i += 1;
        }
        if i >= b.len() {
            // Interval like ("x", "xa"): nothing fits below a trailing
            // minimum digit.
            return Err(GroveError::invalid_input(format!(
                "no key exists between '{}' and '{}'",
                String::from_utf8_lossy(a),
                String::from_utf8_lossy(b)
            )));
        }

        let lo = a.get(i).copied().unwrap_or(FLOOR);
        let hi = b[i];
        if hi > lo + 1 {
            let mid = (lo + hi) / 2;
            if mid == MIN {
                // Only reachable with an exhausted left side and hi == 'b';
                // descend one level instead of emitting a terminal 'a'.
                out.push(MIN);
                out.push(b'm');
            } else {
                out.push(mid);
            }
            return finish(out);
        }
        if b.len() > i + 1 {
            // Adjacent digits but the right side is longer: its first digit
            // alone sits strictly inside the interval.
            out.push(hi);
            return finish(out);
        }
        // Adjacent digits, right side exhausted after this position: carry
        // the smaller digit, the bound above is now unconstrained.
        out.push(lo);
        i += 1;
    }

    // Only the lower bound remains. Carry maximum digits, then emit the
    // midpoint of whatever room is left.
    loop {
        let lo = a.get(i).copied().unwrap_or(FLOOR);
        if lo >= MAX {
            out.push(MAX);
            i += 1;
            continue;
        }
        out.push((lo + CEIL) / 2);
        return finish(out);
    }
}

/// True iff the keys are strictly lexicographically increasing.
pub fn validate_order<S: AsRef<str>>(keys: &[S]) -> bool {
    keys.windows(2)
        .all(|w| w[0].as_ref() < w[1].as_ref())
}

fn finish(out: Vec<u8>) -> Result<String> {
    String::from_utf8(out).map_err(|e| GroveError::invalid_input(e.to_string()))
}

fn validate_key(key: &str) -> Result<()> {
    if key.bytes().all(|c| (MIN..=MAX).contains(&c)) {
        Ok(())
    } else {
        Err(GroveError::invalid_input(format!(
            "ordering key '{key}' contains characters outside a..z"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn check(a: &str, b: &str) -> String {
        let s = between(a, b).unwrap();
        if !a.is_empty() {
            assert!(a < s.as_str(), "{a} < {s} failed");
        }
        if !b.is_empty() {
            assert!(s.as_str() < b, "{s} < {b} failed");
        }
        assert!(!s.ends_with('a'), "{s} ends with minimum digit");
        s
    }

    #[test]
    fn test_initial() {
        assert_eq!(initial(), "m");
        assert_eq!(between("", "").unwrap(), "m");
    }

    #[test]
    fn test_midpoints() {
        assert_eq!(check("", "m"), "f");
        assert_eq!(check("m", ""), "t");
        assert_eq!(check("a", "z"), "m");
    }

    #[test]
    fn test_adjacent_digits() {
        // Carry the smaller digit and extend with 'm'.
        assert_eq!(check("b", "c"), "bm");
        assert_eq!(check("ab", "b"), "an");
    }

    #[test]
    fn test_deepening_at_max() {
        assert_eq!(check("z", ""), "zm");
        assert_eq!(check("zz", ""), "zzm");
    }

    #[test]
    fn test_descend_below_prefix() {
        assert_eq!(check("x", "xb"), "xam");
        assert_eq!(check("x", "xab"), "xaam");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(between("b", "b").is_err());
        assert!(between("c", "b").is_err());
        assert!(between("A", "b").is_err());
        assert!(between("x", "xa").is_err());
    }

    #[test]
    fn test_validate_order() {
        assert!(validate_order(&["a", "b", "ba", "c"]));
        assert!(!validate_order(&["a", "a"]));
        assert!(!validate_order(&["b", "a"]));
        assert!(validate_order::<&str>(&[]));
    }

    #[test]
    fn test_repeated_insert_front() {
        // Repeatedly inserting before the head must keep strictly
        // descending keys without ever bottoming out.
        let mut head = initial();
        let mut seen = vec![head.clone()];
        for _ in 0..64 {
            head = check("", &head);
            seen.push(head.clone());
        }
        seen.reverse();
        assert!(validate_order(&seen));
    }

    #[test]
    fn test_repeated_insert_between() {
        // Bisecting the same interval must keep producing fresh keys.
        let mut lo = "b".to_string();
        let hi = "c".to_string();
        let mut keys = vec![lo.clone()];
        for _ in 0..64 {
            lo = check(&lo, &hi);
            keys.push(lo.clone());
        }
        keys.push(hi);
        assert!(validate_order(&keys));
    }

    proptest! {
        #[test]
        fn prop_between_is_ordered(
            a in "[b-z][a-z]{0,6}",
            b in "[b-z][a-z]{0,6}",
        ) {
            prop_assume!(a < b);
            prop_assume!(!b.ends_with('a'));
            let s = between(&a, &b).unwrap();
            prop_assert!(a.as_str() < s.as_str());
            prop_assert!(s.as_str() < b.as_str());
            prop_assert!(!s.ends_with('a'));
        }

        #[test]
        fn prop_chain_stays_distinct(seed in "[b-y][b-y]{0,3}", n in 1usize..40) {
            // Generate n keys after `seed`; the whole chain must be strictly
            // increasing and duplicate-free.
            let mut keys = vec![seed];
            for _ in 0..n {
                let next = after(keys.last().unwrap()).unwrap();
                keys.push(next);
            }
            prop_assert!(validate_order(&keys));
        }
    }
}
