use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of a conditional watermark write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatermarkUpdate {
    Advanced {
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    },
    /// Candidate was not strictly newer; nothing written.
    Unchanged { current: Option<DateTime<Utc>> },
}

impl WatermarkUpdate {
    pub fn current(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Advanced { to, .. } => Some(*to),
            Self::Unchanged { current } => *current,
        }
    }

    pub fn advanced(&self) -> bool {
        matches!(self, Self::Advanced { .. })
    }
}

/// The value to store, or `None` when `candidate` would not move the
/// watermark strictly forward.
pub fn next_watermark(
    current: Option<DateTime<Utc>>,
    candidate: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match current {
        Some(existing) if candidate <= existing => None,
        _ => Some(candidate),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn first_value_always_applies() {
        assert_eq!(next_watermark(None, at(3)), Some(at(3)));
    }

    #[test]
    fn only_strictly_greater_values_apply() {
        assert_eq!(next_watermark(Some(at(3)), at(4)), Some(at(4)));
        assert_eq!(next_watermark(Some(at(3)), at(3)), None);
        assert_eq!(next_watermark(Some(at(3)), at(2)), None);
    }

    #[test]
    fn out_of_order_candidates_never_regress() {
        let mut current = None;
        for candidate in [at(5), at(2), at(7), at(6), at(7), at(1)] {
            if let Some(next) = next_watermark(current, candidate) {
                assert!(current.is_none_or(|c| next > c));
                current = Some(next);
            }
        }
        assert_eq!(current, Some(at(7)));
    }
}
