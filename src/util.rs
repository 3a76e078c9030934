/// One GiB in bytes.
pub const GIB: i64 = 1 << 30;

/// Round a non-negative byte count up to the nearest whole GiB.
pub fn round_up_bytes_to_gb(bytes: i64) -> i64 {
    if bytes <= 0 {
        return 0;
    }
    (bytes + GIB - 1) / GIB
}

/// Convert a GiB count to bytes.
pub fn gigabytes_to_bytes(gb: i64) -> i64 {
    gb * GIB
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_ceiling() {
        let cases = [
            (100, 1),
            (3 * GIB - 1, 3),
            (3 * GIB, 3),
            (3 * GIB + 1, 4),
            (3_000_000_000, 3),
            (50 * GIB - 1, 50),
            (50 * GIB, 50),
            (50 * GIB + 1, 51),
        ];
        for (bytes, expected) in cases {
            assert_eq!(
                round_up_bytes_to_gb(bytes),
                expected,
                "{bytes} bytes should round up to {expected} GiB"
            );
        }
    }

    #[test]
    fn round_trip() {
        for gb in [0, 1, 5, 1000, (1 << 33) - 1] {
            assert_eq!(round_up_bytes_to_gb(gigabytes_to_bytes(gb)), gb);
        }
    }
}
