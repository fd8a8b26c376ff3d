pub const fn is_power_of_two_u32(n: u32) -> bool {
    if n == 0 {
        return false;
    }
    n & (n - 1) == 0
}

/// Returns an iterator over the powers of two from 1 through `n`, inclusive.
///
/// Behavior is undefined and may panic if `n` is not a power of two.
pub fn iter_powers_of_two_u32(n: u32) -> impl DoubleEndedIterator<Item = u32> + Clone {
    debug_assert!(is_power_of_two_u32(n));
    (0..=n.trailing_zeros()).map(|b| 1 << b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_iter_powers_of_two() {
        assert_eq!(iter_powers_of_two_u32(1).collect::<Vec<_>>(), vec![1]);
        assert_eq!(iter_powers_of_two_u32(8).collect::<Vec<_>>(), vec![1, 2, 4, 8]);
    }

    proptest! {
        #[test]
        fn test_is_power_of_two_u32_matches_std(n in 0u32..=u32::MAX) {
            prop_assert_eq!(is_power_of_two_u32(n), n.is_power_of_two());
        }
    }
}
