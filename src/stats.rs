//! Energy statistics derived from stored readings.
//!
//! Energy is the area under the power curve, integrated per calendar day with
//! the trapezoidal rule over whatever sampling intervals were actually
//! recorded. Every energy figure in this module goes through
//! [`integrate_energy`] so daily, monthly and window totals agree.

use crate::store::{today, Reading, TimeSeriesStore};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Integrated energy of one day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayEnergy {
    pub date: NaiveDate,
    pub energy_kwh: f64,
}

/// Aggregates over a window of days. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub max_power: f64,
    /// First reading that reached `max_power`.
    pub max_time: Option<NaiveDateTime>,
    /// Mean of the strictly positive readings only.
    pub avg_power: f64,
    pub total_energy_kwh: f64,
    /// Sum of the gaps that end on a producing sample. This is an
    /// approximation whose accuracy depends on sampling density.
    pub operating_hours: f64,
    /// Days with at least two readings.
    pub days_with_data: usize,
    pub best_day: Option<DayEnergy>,
    /// Energy of the window's days that fall in the current calendar month.
    pub monthly_energy: f64,
    pub daily_energy: BTreeMap<NaiveDate, f64>,
}

impl StatisticsSnapshot {
    /// The "no data" snapshot: every figure zero.
    pub fn empty() -> Self {
        Self {
            max_power: 0.0,
            max_time: None,
            avg_power: 0.0,
            total_energy_kwh: 0.0,
            operating_hours: 0.0,
            days_with_data: 0,
            best_day: None,
            monthly_energy: 0.0,
            daily_energy: BTreeMap::new(),
        }
    }
}

/// Energy in kWh of one straight-line segment between two samples.
fn segment_kwh(from: &Reading, to: &Reading) -> f64 {
    let hours = (to.timestamp - from.timestamp).num_seconds() as f64 / SECONDS_PER_HOUR;
    (from.power_kw + to.power_kw) / 2.0 * hours
}

/// Trapezoidal integral of power over time, in kWh.
///
/// The input does not need to be ordered. Coincident timestamps contribute
/// nothing.
pub fn integrate_energy(readings: &[Reading]) -> f64 {
    let mut sorted = readings.to_vec();
    sorted.sort_by_key(|r| r.timestamp);
    sorted.windows(2).map(|pair| segment_kwh(&pair[0], &pair[1])).sum()
}

/// Per-day energy. Days with fewer than two readings are left out.
pub fn daily_energy(readings: &[Reading]) -> BTreeMap<NaiveDate, f64> {
    let mut by_day: BTreeMap<NaiveDate, Vec<Reading>> = BTreeMap::new();
    for reading in readings {
        by_day.entry(reading.date()).or_default().push(*reading);
    }

    by_day
        .into_iter()
        .filter(|(_, day)| day.len() >= 2)
        .map(|(date, day)| (date, integrate_energy(&day)))
        .collect()
}

/// Mean of the readings above zero, or 0 if there are none.
pub fn average_positive_power(readings: &[Reading]) -> f64 {
    let (sum, count) = readings
        .iter()
        .filter(|r| r.power_kw > 0.0)
        .fold((0.0, 0usize), |(sum, count), r| (sum + r.power_kw, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Hours between consecutive samples where the later sample is producing.
/// `readings` must be in timestamp order.
pub fn operating_hours(readings: &[Reading]) -> f64 {
    readings
        .windows(2)
        .filter(|pair| pair[1].power_kw > 0.0)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_seconds() as f64 / SECONDS_PER_HOUR)
        .sum()
}

/// Highest daily energy. On a tie the earliest date wins.
pub fn best_day(daily: &BTreeMap<NaiveDate, f64>) -> Option<DayEnergy> {
    daily.iter().fold(None, |best: Option<DayEnergy>, (&date, &energy_kwh)| match best {
        Some(current) if current.energy_kwh >= energy_kwh => Some(current),
        _ => Some(DayEnergy { date, energy_kwh }),
    })
}

/// Build a snapshot from readings sorted by timestamp.
pub fn summarize(readings: &[Reading], today: NaiveDate) -> StatisticsSnapshot {
    if readings.is_empty() {
        return StatisticsSnapshot::empty();
    }

    let mut max_power = f64::MIN;
    let mut max_time = None;
    for reading in readings {
        if reading.power_kw > max_power {
            max_power = reading.power_kw;
            max_time = Some(reading.timestamp);
        }
    }

    let daily = daily_energy(readings);
    let monthly_energy: f64 = daily
        .iter()
        .filter(|(date, _)| date.year() == today.year() && date.month() == today.month())
        .map(|(_, energy)| energy)
        .sum();

    StatisticsSnapshot {
        max_power,
        max_time,
        avg_power: average_positive_power(readings),
        total_energy_kwh: daily.values().sum(),
        operating_hours: operating_hours(readings),
        days_with_data: daily.len(),
        best_day: best_day(&daily),
        monthly_energy,
        daily_energy: daily,
    }
}

/// Month key in `YYYY-MM` form.
pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// On-demand statistics over a shared store.
#[derive(Clone)]
pub struct StatisticsEngine {
    store: Arc<TimeSeriesStore>,
}

impl StatisticsEngine {
    pub fn new(store: Arc<TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Snapshot of the last `days` days, today inclusive.
    pub fn compute(&self, days: u32) -> StatisticsSnapshot {
        self.compute_at(days, today())
    }

    pub fn compute_at(&self, days: u32, today: NaiveDate) -> StatisticsSnapshot {
        summarize(&self.store.load_at(days, today), today)
    }

    /// Energy produced on `date`; 0 if fewer than two readings exist.
    pub fn calculate_daily_energy(&self, date: NaiveDate) -> f64 {
        let readings: Vec<Reading> = self
            .store
            .load_all()
            .into_iter()
            .filter(|r| r.date() == date)
            .collect();
        daily_energy(&readings).get(&date).copied().unwrap_or(0.0)
    }

    /// Energy per calendar month over everything retained, keyed `YYYY-MM`.
    pub fn calculate_monthly_rollup(&self) -> BTreeMap<String, f64> {
        monthly_rollup(&daily_energy(&self.store.load_all()))
    }
}

/// Sum daily energies by calendar month.
pub fn monthly_rollup(daily: &BTreeMap<NaiveDate, f64>) -> BTreeMap<String, f64> {
    let mut months = BTreeMap::new();
    for (date, energy) in daily {
        *months.entry(month_key(*date)).or_insert(0.0) += energy;
    }
    months
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 20).unwrap()
    }

    fn r(date: NaiveDate, h: u32, m: u32, power: f64) -> Reading {
        Reading::new(date.and_hms_opt(h, m, 0).unwrap(), power)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_daily_energy_three_samples() {
        let readings = vec![r(day(), 8, 0, 0.0), r(day(), 9, 0, 4.0), r(day(), 10, 0, 2.0)];
        let daily = daily_energy(&readings);
        assert!(approx(daily[&day()], 5.0));
    }

    #[test]
    fn test_integration_ignores_input_order() {
        let readings = vec![r(day(), 10, 0, 2.0), r(day(), 8, 0, 0.0), r(day(), 9, 0, 4.0)];
        assert!(approx(integrate_energy(&readings), 5.0));
    }

    #[test]
    fn test_identical_timestamps_contribute_zero() {
        let readings = vec![r(day(), 9, 0, 0.0), r(day(), 9, 0, 0.0)];
        let energy = integrate_energy(&readings);
        assert_eq!(energy, 0.0);
        assert!(!energy.is_nan());

        let loaded = vec![r(day(), 9, 0, 3.0), r(day(), 9, 0, 5.0)];
        assert_eq!(integrate_energy(&loaded), 0.0);
    }

    #[test]
    fn test_single_reading_day_is_excluded() {
        let other = NaiveDate::from_ymd_opt(2026, 5, 21).unwrap();
        let readings = vec![
            r(day(), 8, 0, 1.0),
            r(day(), 9, 0, 1.0),
            r(other, 12, 0, 7.0),
        ];
        let snapshot = summarize(&readings, other);
        assert_eq!(snapshot.days_with_data, 1);
        assert!(!snapshot.daily_energy.contains_key(&other));
        assert!(approx(snapshot.total_energy_kwh, 1.0));
        // The lone reading still counts for the peak.
        assert_eq!(snapshot.max_power, 7.0);
    }

    #[test]
    fn test_average_excludes_zero_readings() {
        let readings = vec![
            r(day(), 8, 0, 0.0),
            r(day(), 9, 0, 10.0),
            r(day(), 10, 0, 0.0),
            r(day(), 11, 0, 20.0),
        ];
        assert!(approx(average_positive_power(&readings), 15.0));
        assert_eq!(average_positive_power(&[r(day(), 8, 0, 0.0)]), 0.0);
    }

    #[test]
    fn test_empty_window_gives_no_data_snapshot() {
        let snapshot = summarize(&[], day());
        assert_eq!(snapshot, StatisticsSnapshot::empty());
        assert_eq!(snapshot.days_with_data, 0);
        assert!(snapshot.best_day.is_none());
    }

    #[test]
    fn test_all_zero_window() {
        let readings = vec![r(day(), 8, 0, 0.0), r(day(), 9, 0, 0.0), r(day(), 10, 0, 0.0)];
        let snapshot = summarize(&readings, day());
        assert_eq!(snapshot.max_power, 0.0);
        assert_eq!(snapshot.max_time, Some(readings[0].timestamp));
        assert_eq!(snapshot.avg_power, 0.0);
        assert_eq!(snapshot.total_energy_kwh, 0.0);
        assert_eq!(snapshot.operating_hours, 0.0);
        assert_eq!(snapshot.days_with_data, 1);
        assert_eq!(snapshot.best_day, Some(DayEnergy { date: day(), energy_kwh: 0.0 }));
    }

    #[test]
    fn test_max_time_is_first_reading_at_peak() {
        let readings = vec![r(day(), 8, 0, 5.0), r(day(), 9, 0, 5.0), r(day(), 10, 0, 1.0)];
        let snapshot = summarize(&readings, day());
        assert_eq!(snapshot.max_power, 5.0);
        assert_eq!(snapshot.max_time, Some(readings[0].timestamp));
    }

    #[test]
    fn test_operating_hours_counts_gaps_ending_on_production() {
        let readings = vec![
            r(day(), 6, 0, 0.0),
            r(day(), 7, 0, 1.0), // counts 1h
            r(day(), 9, 0, 0.0), // not counted
            r(day(), 9, 30, 2.0), // counts 0.5h
        ];
        assert!(approx(operating_hours(&readings), 1.5));
    }

    #[test]
    fn test_operating_hours_spans_day_boundary() {
        let next = NaiveDate::from_ymd_opt(2026, 5, 21).unwrap();
        let readings = vec![r(day(), 23, 0, 1.0), r(next, 1, 0, 1.0)];
        assert!(approx(operating_hours(&readings), 2.0));
        // No day has two readings, so no energy.
        assert_eq!(summarize(&readings, next).total_energy_kwh, 0.0);
    }

    #[test]
    fn test_best_day_tie_takes_earliest_date() {
        let first = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        let second = NaiveDate::from_ymd_opt(2026, 5, 2).unwrap();
        let mut daily = BTreeMap::new();
        daily.insert(second, 4.0);
        daily.insert(first, 4.0);

        assert_eq!(best_day(&daily), Some(DayEnergy { date: first, energy_kwh: 4.0 }));
        assert_eq!(best_day(&BTreeMap::new()), None);
    }

    #[test]
    fn test_monthly_energy_only_counts_current_month() {
        let april = NaiveDate::from_ymd_opt(2026, 4, 30).unwrap();
        let may = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        let readings = vec![
            r(april, 10, 0, 2.0),
            r(april, 11, 0, 2.0),
            r(may, 10, 0, 3.0),
            r(may, 11, 0, 3.0),
        ];
        let snapshot = summarize(&readings, may);
        assert!(approx(snapshot.total_energy_kwh, 5.0));
        assert!(approx(snapshot.monthly_energy, 3.0));
        assert_eq!(snapshot.best_day.map(|d| d.date), Some(may));
    }

    #[test]
    fn test_monthly_rollup() {
        let mut daily = BTreeMap::new();
        daily.insert(NaiveDate::from_ymd_opt(2026, 4, 29).unwrap(), 1.5);
        daily.insert(NaiveDate::from_ymd_opt(2026, 4, 30).unwrap(), 2.5);
        daily.insert(NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(), 3.0);

        let rollup = monthly_rollup(&daily);
        assert_eq!(rollup.len(), 2);
        assert!(approx(rollup["2026-04"], 4.0));
        assert!(approx(rollup["2026-05"], 3.0));
        assert_eq!(rollup.keys().next().map(String::as_str), Some("2026-04"));
    }

    #[test]
    fn test_engine_reads_from_store() {
        let dir = tempdir().unwrap();
        let today = day();
        let store = Arc::new(
            TimeSeriesStore::open_at(&dir.path().join("energy.json"), 30, today).unwrap(),
        );
        for (h, p) in [(8, 0.0), (9, 4.0), (10, 2.0)] {
            store.record(today.and_hms_opt(h, 0, 0).unwrap(), p).unwrap();
        }
        let yesterday = today.pred_opt().unwrap();
        store.record(yesterday.and_hms_opt(12, 0, 0).unwrap(), 1.0).unwrap();
        store.record(yesterday.and_hms_opt(14, 0, 0).unwrap(), 1.0).unwrap();

        let engine = StatisticsEngine::new(Arc::clone(&store));
        let today_only = engine.compute_at(1, today);
        assert!(approx(today_only.total_energy_kwh, 5.0));
        assert_eq!(today_only.days_with_data, 1);

        let two_days = engine.compute_at(2, today);
        assert!(approx(two_days.total_energy_kwh, 7.0));
        assert_eq!(two_days.best_day.map(|d| d.date), Some(today));

        assert!(approx(engine.calculate_daily_energy(yesterday), 2.0));
        assert_eq!(engine.calculate_daily_energy(today.succ_opt().unwrap()), 0.0);
        assert!(approx(engine.calculate_monthly_rollup()["2026-05"], 7.0));
    }

    fn day_readings_strategy() -> impl Strategy<Value = Vec<Reading>> {
        prop::collection::vec((0u32..86_400, 0.0f64..100.0), 3..30).prop_map(|samples| {
            let mut readings: Vec<Reading> = samples
                .into_iter()
                .map(|(secs, power)| {
                    let time = chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap();
                    Reading::new(day().and_time(time), power)
                })
                .collect();
            readings.sort_by_key(|r| r.timestamp);
            readings
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_integration_is_additive_over_a_split_point(
            readings in day_readings_strategy(),
            split_seed in any::<prop::sample::Index>(),
        ) {
            let split = 1 + split_seed.index(readings.len() - 2);
            let whole = integrate_energy(&readings);
            let left = integrate_energy(&readings[..=split]);
            let right = integrate_energy(&readings[split..]);
            prop_assert!((whole - (left + right)).abs() < 1e-6 * whole.max(1.0));
        }

        #[test]
        fn prop_energy_is_finite_and_non_negative(readings in day_readings_strategy()) {
            let energy = integrate_energy(&readings);
            prop_assert!(energy.is_finite());
            prop_assert!(energy >= 0.0);
        }

        #[test]
        fn prop_average_lies_between_positive_extremes(readings in day_readings_strategy()) {
            let positives: Vec<f64> = readings.iter().map(|r| r.power_kw).filter(|p| *p > 0.0).collect();
            let avg = average_positive_power(&readings);
            if positives.is_empty() {
                prop_assert_eq!(avg, 0.0);
            } else {
                let min = positives.iter().cloned().fold(f64::MAX, f64::min);
                let max = positives.iter().cloned().fold(f64::MIN, f64::max);
                prop_assert!(avg >= min - 1e-9 && avg <= max + 1e-9);
            }
        }
    }
}
