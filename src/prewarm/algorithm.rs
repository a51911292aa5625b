//! Pool sizing algorithms: V1 is periodical-only, V2 adds an event-driven
//! top-up for cache misses on top of V1's floor enforcement.
//! `max: Option<u32>` models the source's `max == -1` (unlimited) as `None`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    V1,
    V2,
}

/// Expands the pool to `clamp(requested_size, min, max)`, returning how
/// many additional connections are needed this tick (0 if already there).
pub fn size_v1(requested_size: u32, current_size: u32, min: u32, max: Option<u32>) -> u32 {
    let mut target = requested_size.max(min);
    if let Some(max) = max {
        target = target.min(max);
    }
    target.saturating_sub(current_size)
}

/// Event-driven top-up: if the total demand hasn't even reached `min`,
/// fall back to V1 to guarantee the floor. Otherwise add
/// `floor(miss * rate)` connections, capped at `max`.
pub fn size_v2(hit: u32, miss: u32, current_size: u32, min: u32, max: Option<u32>, rate: f64) -> u32 {
    if hit + miss + current_size < min {
        return size_v1(hit + miss, current_size, min, max);
    }
    if let Some(max) = max {
        if current_size >= max {
            return 0;
        }
    }
    let mut n = (miss as f64 * rate) as u32;
    if let Some(max) = max {
        if n + current_size > max {
            n = max - current_size;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_expands_to_min_when_requested_is_lower() {
        assert_eq!(size_v1(0, 0, 5, None), 5);
    }

    #[test]
    fn v1_clamps_to_max() {
        assert_eq!(size_v1(100, 0, 0, Some(10)), 10);
    }

    #[test]
    fn v1_returns_zero_once_satisfied() {
        assert_eq!(size_v1(5, 5, 0, None), 0);
        assert_eq!(size_v1(5, 8, 0, None), 0);
    }

    #[test]
    fn v2_falls_back_to_v1_below_min() {
        // hit+miss+current (0+1+0=1) < min (5) => fall back to v1, which
        // expands to min regardless of the requested 1.
        assert_eq!(size_v2(0, 1, 0, 5, None, 0.5), 5);
    }

    #[test]
    fn v2_does_nothing_at_max() {
        assert_eq!(size_v2(10, 10, 20, 5, Some(20), 1.0), 0);
    }

    #[test]
    fn v2_adds_rate_scaled_misses() {
        assert_eq!(size_v2(10, 10, 10, 0, None, 0.5), 5);
    }

    #[test]
    fn v2_caps_addition_at_max() {
        assert_eq!(size_v2(10, 10, 18, 0, Some(20), 1.0), 2);
    }
}
