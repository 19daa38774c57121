use std::cmp::Ordering;

use chrono::{DateTime, Utc};

/// Free connection headroom: 100 − (active / max × 100), clamped to [0, 100].
///
/// `None` when either input is unknown or `max` is not positive.
pub fn connection_load_percent(active: Option<f64>, max: Option<f64>) -> Option<f64> {
    let (active, max) = (active?, max?);
    if max <= 0.0 {
        return None;
    }
    Some((100.0 - active / max * 100.0).clamp(0.0, 100.0))
}

/// hits / (hits + reads) × 100, `None` on a zero denominator.
pub fn cache_hit_percent(hits: Option<f64>, reads: Option<f64>) -> Option<f64> {
    let (hits, reads) = (hits?, reads?);
    let total = hits + reads;
    if total <= 0.0 {
        return None;
    }
    Some(hits / total * 100.0)
}

pub fn transactions_per_second(xact_total: Option<f64>, elapsed_seconds: Option<f64>) -> Option<f64> {
    let (xacts, elapsed) = (xact_total?, elapsed_seconds?);
    (elapsed > 0.0).then(|| xacts / elapsed)
}

pub fn percent_of(used: Option<f64>, size: Option<f64>) -> Option<f64> {
    let (used, size) = (used?, size?);
    (size > 0.0).then(|| used / size * 100.0)
}

/// Latest minus previous backup size, ordered by start time.
///
/// Records without a start time cannot be placed in the sequence and are
/// ignored. Fewer than two placeable records, or a missing size on either of
/// the two latest, yields `None`.
pub fn backup_size_delta(records: &[(Option<DateTime<Utc>>, Option<f64>)]) -> Option<f64> {
    let mut placed: Vec<(DateTime<Utc>, Option<f64>)> = records
        .iter()
        .filter_map(|(start, size)| start.map(|start| (start, *size)))
        .collect();
    if placed.len() < 2 {
        return None;
    }
    placed.sort_by(|a, b| b.0.cmp(&a.0));
    let latest = placed[0].1?;
    let previous = placed[1].1?;
    Some(latest - previous)
}

/// Trailing average over up to `window` known values ending at each position.
pub fn rolling_average(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    (0..values.len())
        .map(|idx| {
            let start = (idx + 1).saturating_sub(window);
            let known: Vec<f64> = values[start..=idx].iter().flatten().copied().collect();
            if known.is_empty() {
                None
            } else {
                Some(known.iter().sum::<f64>() / known.len() as f64)
            }
        })
        .collect()
}

/// Descending order with unknown values last.
pub fn desc_unknown_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ascending timestamp order with unknown values last.
pub fn asc_time_unknown_last(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
