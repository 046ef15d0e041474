//! Deterministic VU → dataset row mapping

/// Row index for `vu_id` in a dataset of `row_count` rows
///
/// `index = (vu_id - 1) mod row_count`. A VU keeps the same row for its whole
/// lifetime, and densely numbered VUs `1..=n` spread evenly over the rows.
/// VU ids start at 1; id 0 is treated like id 1.
///
/// `row_count` must be at least 1. Callers reject empty datasets before any
/// VU is scheduled.
pub fn assign(vu_id: u64, row_count: usize) -> usize {
    debug_assert!(row_count > 0, "row assignment over an empty dataset");
    (vu_id.saturating_sub(1) % row_count as u64) as usize
}
