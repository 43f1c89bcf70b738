//! Admission test for persistently listed products
//!
//! A (product, firm) pair is admitted when its offer spells cover nearly every
//! calendar week of a symmetric window around the seal week. Weeks are
//! Monday-anchored (UTC); a week counts as covered when any spell overlaps it.

use chrono::NaiveDate;

use super::db::{PanelStore, Relation};
use super::error::PanelError;
use super::query::{Ident, Predicate, SelectQuery};
use super::types::ProductId;
use super::windows::{date_to_unix, week_start, UNIX_WEEK};

/// Windows narrower than this never admit anything
pub const MIN_CONTINUITY_WEEKS: u32 = 4;

/// First second of the window and its length in weeks (`2w + 1`)
pub fn continuity_window(seal_date: NaiveDate, weeks: u32) -> (i64, i64) {
    let seal_week = date_to_unix(week_start(seal_date));
    (seal_week - weeks as i64 * UNIX_WEEK, 2 * weeks as i64 + 1)
}

/// Weeks of the window not overlapped by any `[start, end)` spell
pub fn count_missing_weeks(spells: &[(i64, i64)], window_start: i64, total_weeks: i64) -> usize {
    (0..total_weeks)
        .map(|k| window_start + k * UNIX_WEEK)
        .filter(|&from| {
            let to = from + UNIX_WEEK;
            !spells.iter().any(|&(start, end)| start < to && end > from)
        })
        .count()
}

pub struct ContinuityFilter {
    store: PanelStore,
    missing_weeks_allowed: usize,
}

impl ContinuityFilter {
    pub fn new(store: PanelStore, missing_weeks_allowed: u32) -> Self {
        Self { store, missing_weeks_allowed: missing_weeks_allowed as usize }
    }

    /// Spells of `(product, firm)` overlapping the continuity window
    fn spells(&self, product: ProductId, firm: &str, from: i64, to: i64) -> Result<Vec<(i64, i64)>, PanelError> {
        let query = SelectQuery::from(Relation::Offers.ident())
            .column(Ident::from_static("dtimebegin"))
            .column(Ident::from_static("dtimeend"))
            .filter(Predicate::Eq(Ident::from_static("produkt_id"), product.into()))
            .filter(Predicate::Eq(Ident::from_static("haendler_bez"), firm.to_string().into()))
            .filter(Predicate::Overlaps {
                start: Ident::from_static("dtimebegin"),
                end: Ident::from_static("dtimeend"),
                from,
                to,
            })
            .build();
        self.store.query_map(&query, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
    }

    pub fn is_continuously_offered(
        &self,
        product: ProductId,
        firm: &str,
        seal_date: NaiveDate,
        weeks: u32,
    ) -> Result<bool, PanelError> {
        if weeks < MIN_CONTINUITY_WEEKS {
            return Ok(false);
        }

        let (window_start, total_weeks) = continuity_window(seal_date, weeks);
        let window_end = window_start + total_weeks * UNIX_WEEK;
        let spells = self.spells(product, firm, window_start, window_end)?;
        let missing = count_missing_weeks(&spells, window_start, total_weeks);

        let admitted = missing <= self.missing_weeks_allowed;
        log::debug!(
            "   ├─ product {} @ '{}': {} of {} weeks missing -> {}",
            product,
            firm,
            missing,
            total_weeks,
            if admitted { "admitted" } else { "rejected" }
        );
        Ok(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::test_support::*;
    use crate::panel::types::Offer;

    /// Weekly spells covering the ±`weeks` window except the listed week offsets
    fn weekly_spells(product: i64, firm: &str, seal_date: NaiveDate, weeks: u32, gaps: &[i64]) -> Vec<Offer> {
        let (start, total) = continuity_window(seal_date, weeks);
        (0..total)
            .filter(|k| !gaps.contains(k))
            .map(|k| {
                let from = start + k * UNIX_WEEK;
                offer(product, firm, from + days(1), from + days(2))
            })
            .collect()
    }

    #[test]
    fn test_window_is_week_anchored_and_symmetric() {
        // 2012-06-06 is a Wednesday
        let (start, total) = continuity_window(date(2012, 6, 6), 4);
        assert_eq!(start, unix(2012, 6, 4) - 4 * UNIX_WEEK);
        assert_eq!(total, 9);
    }

    #[test]
    fn test_zero_one_two_missing_weeks() {
        let seal = date(2012, 6, 6);
        let store = PanelStore::open_in_memory().unwrap();
        let mut offers = weekly_spells(1, "shop-a", seal, 4, &[]);
        offers.extend(weekly_spells(2, "shop-a", seal, 4, &[3]));
        offers.extend(weekly_spells(3, "shop-a", seal, 4, &[0, 8]));
        insert_offers(&store, &offers);

        let filter = ContinuityFilter::new(store, 1);
        assert!(filter.is_continuously_offered(1, "shop-a", seal, 4).unwrap());
        assert!(filter.is_continuously_offered(2, "shop-a", seal, 4).unwrap());
        assert!(!filter.is_continuously_offered(3, "shop-a", seal, 4).unwrap());
    }

    #[test]
    fn test_narrow_window_rejects() {
        let seal = date(2012, 6, 6);
        let store = PanelStore::open_in_memory().unwrap();
        insert_offers(&store, &[offer(1, "shop-a", unix(2011, 1, 1), unix(2013, 1, 1))]);

        let filter = ContinuityFilter::new(store, 1);
        assert!(!filter.is_continuously_offered(1, "shop-a", seal, 3).unwrap());
        assert!(filter.is_continuously_offered(1, "shop-a", seal, 4).unwrap());
    }

    #[test]
    fn test_long_spell_covers_many_weeks() {
        let start = unix(2012, 6, 4);
        assert_eq!(count_missing_weeks(&[(start, start + 3 * UNIX_WEEK)], start, 5), 2);
        // Touching the window edge does not count
        assert_eq!(count_missing_weeks(&[(start - UNIX_WEEK, start)], start, 1), 1);
    }

    #[test]
    fn test_other_firm_spells_ignored() {
        let seal = date(2012, 6, 6);
        let store = PanelStore::open_in_memory().unwrap();
        insert_offers(&store, &weekly_spells(1, "shop-b", seal, 4, &[]));

        let filter = ContinuityFilter::new(store, 1);
        assert!(!filter.is_continuously_offered(1, "shop-a", seal, 4).unwrap());
    }
}
