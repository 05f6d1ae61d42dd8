use rand::Rng;
use serde::{Deserialize, Serialize};

/// Indices of the two plots currently shown side by side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct PairSelection {
    pub a: usize,
    pub b: usize,
}

impl Default for PairSelection {
    fn default() -> Self {
        Self { a: 0, b: 1 }
    }
}

/// Draw two indices uniformly from `0..n`.
///
/// For `n >= 2` the indices always differ: `b` is drawn from the `n - 1` remaining slots
/// and shifted past `a`, so there is no retry loop. For `n == 1` both indices are `0`.
#[must_use]
pub fn pick_pair<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Option<PairSelection> {
    match n {
        0 => None,
        1 => Some(PairSelection { a: 0, b: 0 }),
        _ => {
            let a = rng.gen_range(0..n);
            let mut b = rng.gen_range(0..n - 1);
            if b >= a {
                b += 1;
            }
            Some(PairSelection { a, b })
        }
    }
}

#[must_use]
pub fn pick_single<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Option<usize> {
    (n > 0).then(|| rng.gen_range(0..n))
}
