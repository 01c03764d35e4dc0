//! The small tier's size-class table.
//!
//! 64 fixed classes spanning 8 B to 1 MiB: the first 32 step linearly by
//! 8 bytes (8..256), the rest follow a geometric progression that lands
//! exactly on 1 MiB. Requests are quantised to the smallest class that
//! holds them.

use static_assertions::const_assert;

/// Number of small size classes.
pub const CLASS_COUNT: usize = 64;

/// Payload capacity of each class, in bytes.
#[rustfmt::skip]
pub const CLASS_SIZES: [usize; CLASS_COUNT] = [
    8, 16, 24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128,
    136, 144, 152, 160, 168, 176, 184, 192, 200, 208, 216, 224, 232, 240, 248, 256,
    336, 432, 560, 728, 944, 1224, 1584, 2048, 2656, 3448, 4472, 5800,
    7520, 9744, 12640, 16384, 21248, 27560, 35736, 46344, 60104, 77936,
    101072, 131072, 169984, 220440, 285872, 370728, 480776, 623488, 808568, 1048576,
];

/// Largest request the small tier serves.
pub const MAX_CLASS_SIZE: usize = CLASS_SIZES[CLASS_COUNT - 1];

const_assert!(MAX_CLASS_SIZE == 1 << 20);

/// Index of the smallest class whose capacity is at least `bytes`, or `None`
/// when the request is too big for the small tier.
///
/// Binary search over the compile-time table: six comparisons, no branches
/// on the values themselves.
pub fn class_for(bytes: usize) -> Option<usize> {
    if bytes > MAX_CLASS_SIZE {
        return None;
    }
    let mut low = 0;
    let mut high = CLASS_COUNT - 1;
    while low < high {
        let middle = (low + high) >> 1;
        if bytes <= CLASS_SIZES[middle] {
            high = middle;
        } else {
            low = middle + 1;
        }
    }
    Some(low)
}

/// Payload capacity of class `index`.
pub fn class_size(index: usize) -> usize {
    CLASS_SIZES[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_strictly_increasing() {
        for window in CLASS_SIZES.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn test_linear_prefix() {
        for (index, &size) in CLASS_SIZES[..32].iter().enumerate() {
            assert_eq!(size, (index + 1) * 8);
        }
    }

    #[test]
    fn test_class_for_matches_linear_scan() {
        let probes = [
            1, 7, 8, 9, 16, 255, 256, 257, 336, 337, 4472, 16384, 16385,
            131072, 1048575, 1048576,
        ];
        for &bytes in &probes {
            let expected = CLASS_SIZES.iter().position(|&s| s >= bytes);
            assert_eq!(class_for(bytes), expected, "probe {}", bytes);
        }
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(class_for(0), Some(0));
        assert_eq!(class_for(8), Some(0));
        assert_eq!(class_for(9), Some(1));
        assert_eq!(class_for(MAX_CLASS_SIZE), Some(CLASS_COUNT - 1));
        assert_eq!(class_for(MAX_CLASS_SIZE + 1), None);
    }

    #[test]
    fn test_every_class_round_trips() {
        for index in 0..CLASS_COUNT {
            assert_eq!(class_for(class_size(index)), Some(index));
        }
    }
}
