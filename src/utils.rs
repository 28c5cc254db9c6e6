#![allow(clippy::cast_possible_truncation)]

/// Host (regular) page shift, fixed by the platform.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

#[must_use]
pub const fn high_32(v: u64) -> u32 {
    (v >> 32) as u32
}

#[must_use]
pub const fn low_32(v: u64) -> u32 {
    v as u32
}

#[must_use]
pub const fn high_16(v: u32) -> u16 {
    (v >> 16) as u16
}

/// Rounds `val` up to a multiple of `1 << shift`, or `None` on overflow.
#[must_use]
pub const fn align_up(val: u64, shift: u32) -> Option<u64> {
    let mask = (1u64 << shift) - 1;
    match val.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

#[must_use]
pub const fn is_aligned(val: u64, shift: u32) -> bool {
    val & ((1u64 << shift) - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_words() {
        let v = 0x1234_5678_9abc_def0_u64;
        assert_eq!(high_32(v), 0x1234_5678);
        assert_eq!(low_32(v), 0x9abc_def0);
        assert_eq!(high_16(0x0003_0002), 3);
    }

    #[test]
    fn aligns() {
        assert_eq!(align_up(0x1001, 12), Some(0x2000));
        assert_eq!(align_up(0x2000, 12), Some(0x2000));
        assert_eq!(align_up(u64::MAX, 12), None);
        assert!(is_aligned(0x20_0000, 21));
        assert!(!is_aligned(0x20_1000, 21));
    }
}
