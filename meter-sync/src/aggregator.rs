//! Turns windowed metering records into accumulator and point updates.
//!
//! Everything here is pure: the poll cycle computes a [`SyncUpdate`] from the
//! current [`SyncState`] and only commits it once the whole cycle succeeded.

use crate::model::Record;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A monotonic counter fed by a record field.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorSpec {
    pub capability: &'static str,
    pub field: String,
    /// Pulses (or raw units) per reported unit. Zero or absent disables the counter.
    pub ratio: Option<f64>,
}

impl AccumulatorSpec {
    pub fn new(capability: &'static str, field: impl Into<String>, ratio: Option<f64>) -> Self {
        Self {
            capability,
            field: field.into(),
            ratio,
        }
    }

    fn divisor(&self) -> Option<f64> {
        self.ratio.filter(|r| *r > 0.0 && r.is_finite())
    }

    /// Delta contributed by one record, `None` when the counter is disabled.
    fn delta(&self, record: &Record) -> Option<f64> {
        let divisor = self.divisor()?;
        let raw = record.number(&self.field).unwrap_or(0.0);
        if raw < 0.0 {
            debug!(
                "Ignoring negative {} delta {} at {}",
                self.field, raw, record.timestamp
            );
            return Some(0.0);
        }
        Some(raw / divisor)
    }
}

/// An instantaneous value read from the latest record carrying the field.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSpec {
    pub capability: &'static str,
    pub field: &'static str,
    pub scale: f64,
}

impl PointSpec {
    pub fn new(capability: &'static str, field: &'static str) -> Self {
        Self {
            capability,
            field,
            scale: 1.0,
        }
    }

    pub fn scaled(capability: &'static str, field: &'static str, scale: f64) -> Self {
        Self {
            capability,
            field,
            scale,
        }
    }
}

/// Watermark and accumulators of one device's pull path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    watermark: Option<i64>,
    accumulators: BTreeMap<String, f64>,
}

impl SyncState {
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn accumulator(&self, capability: &str) -> Option<f64> {
        self.accumulators.get(capability).copied()
    }

    /// Maintenance reset (meter replacement). The next cycle reseeds from history.
    pub fn reset(&mut self) {
        self.watermark = None;
        self.accumulators.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncUpdate {
    pub state: SyncState,
    /// Accumulators that were seeded or advanced by this update.
    pub touched: BTreeSet<String>,
    pub points: Vec<(&'static str, f64)>,
}

impl SyncUpdate {
    pub fn accumulator_values(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.touched
            .iter()
            .filter_map(|name| self.state.accumulator(name).map(|v| (name.as_str(), v)))
    }
}

fn latest_points(records: &[Record], points: &[PointSpec]) -> Vec<(&'static str, f64)> {
    points
        .iter()
        .filter_map(|spec| {
            records
                .iter()
                .filter_map(|r| r.number(spec.field).map(|v| (r.timestamp, v)))
                .max_by_key(|(ts, _)| *ts)
                .map(|(_, v)| (spec.capability, v * spec.scale))
        })
        .collect()
}

/// First sync: sums the coarse records before `boundary` and the fine records
/// from `boundary` on, so the current coarse period is never counted twice.
pub fn seed(
    coarse: &[Record],
    fine: &[Record],
    boundary: i64,
    accumulators: &[AccumulatorSpec],
    points: &[PointSpec],
) -> SyncUpdate {
    let mut state = SyncState::default();
    let mut touched = BTreeSet::new();

    for spec in accumulators {
        if spec.divisor().is_none() {
            debug!("Accumulator {} disabled, no usable ratio", spec.capability);
            continue;
        }

        let historical: f64 = coarse
            .iter()
            .filter(|r| r.timestamp < boundary)
            .filter_map(|r| spec.delta(r))
            .sum();
        let tail: f64 = fine
            .iter()
            .filter(|r| r.timestamp >= boundary)
            .filter_map(|r| spec.delta(r))
            .sum();

        state
            .accumulators
            .insert(spec.capability.to_string(), historical + tail);
        touched.insert(spec.capability.to_string());
    }

    // Everything before the boundary is in the history total. With no tail yet,
    // sit just below the boundary so the first fine record still counts.
    state.watermark = Some(
        fine.iter()
            .filter(|r| r.timestamp >= boundary)
            .map(|r| r.timestamp)
            .max()
            .unwrap_or(boundary - 1),
    );

    SyncUpdate {
        state,
        touched,
        points: latest_points(fine, points),
    }
}

/// Subsequent syncs: adds the deltas of records strictly newer than the
/// watermark. A record stamped exactly at the watermark is a replay and
/// contributes nothing.
pub fn advance(
    current: &SyncState,
    records: &[Record],
    accumulators: &[AccumulatorSpec],
    points: &[PointSpec],
) -> SyncUpdate {
    let mut state = current.clone();
    let mut touched = BTreeSet::new();

    let fresh: Vec<&Record> = records
        .iter()
        .filter(|r| current.watermark.map_or(true, |w| r.timestamp > w))
        .collect();

    if fresh.len() < records.len() {
        debug!(
            "Skipping {} record(s) at or before watermark {:?}",
            records.len() - fresh.len(),
            current.watermark
        );
    }

    for spec in accumulators {
        let increment: Option<f64> = fresh
            .iter()
            .map(|r| spec.delta(r))
            .sum::<Option<f64>>();

        // Disabled counters yield None; an empty window yields Some(0.0).
        let Some(increment) = increment else {
            continue;
        };
        if fresh.is_empty() {
            continue;
        }

        let total = state
            .accumulators
            .entry(spec.capability.to_string())
            .or_insert(0.0);
        *total += increment;
        touched.insert(spec.capability.to_string());
    }

    state.watermark = match (current.watermark, records.iter().map(|r| r.timestamp).max()) {
        (Some(w), Some(latest)) => Some(w.max(latest)),
        (w, latest) => w.or(latest),
    };

    SyncUpdate {
        state,
        touched,
        points: latest_points(records, points),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FIVE_MINUTES: i64 = 300_000;

    fn energy() -> Vec<AccumulatorSpec> {
        vec![AccumulatorSpec::new("meter_power", "consumption", Some(1000.0))]
    }

    fn state_at(watermark: i64, total: f64) -> SyncState {
        let mut state = SyncState::default();
        state.watermark = Some(watermark);
        state.accumulators.insert("meter_power".to_string(), total);
        state
    }

    #[test]
    fn test_first_sync_seeds_from_history_and_tail() {
        let boundary = 10 * FIVE_MINUTES;
        let coarse = vec![
            Record::new(0).with("consumption", 70_000.0),
            Record::new(5 * FIVE_MINUTES).with("consumption", 50_000.0),
            // Current month as reported by the coarse aggregation; covered by the tail.
            Record::new(boundary).with("consumption", 999_000.0),
        ];
        let fine = vec![Record::new(boundary + FIVE_MINUTES).with("consumption", 400.0)];

        let update = seed(&coarse, &fine, boundary, &energy(), &[]);

        let total = update.state.accumulator("meter_power").unwrap();
        assert!((total - 120.4).abs() < 1e-9);
        assert_eq!(update.state.watermark(), Some(boundary + FIVE_MINUTES));
        assert!(update.touched.contains("meter_power"));
    }

    #[test]
    fn test_empty_tail_keeps_history_out_of_next_sync() {
        let boundary = 100 * FIVE_MINUTES;
        let coarse = vec![Record::new(boundary - 30 * FIVE_MINUTES).with("consumption", 100_000.0)];

        let seeded = seed(&coarse, &[], boundary, &energy(), &[]);
        assert_eq!(seeded.state.accumulator("meter_power"), Some(100.0));
        assert_eq!(seeded.state.watermark(), Some(boundary - 1));

        // Late five-minute data for last month, then the first record of this one.
        let mut records: Vec<Record> = (1..=10)
            .map(|i| Record::new(boundary - i * FIVE_MINUTES).with("consumption", 10_000.0))
            .collect();
        records.push(Record::new(boundary).with("consumption", 500.0));
        records.sort_by_key(|r| r.timestamp);

        let update = advance(&seeded.state, &records, &energy(), &[]);
        assert_eq!(update.state.accumulator("meter_power"), Some(100.5));
        assert_eq!(update.state.watermark(), Some(boundary));
    }

    #[test]
    fn test_replay_at_watermark_is_zeroed() {
        let state = state_at(1_000, 5.0);
        let records = vec![Record::new(1_000).with("consumption", 800.0)];

        let update = advance(&state, &records, &energy(), &[]);

        assert_eq!(update.state, state);
        assert!(update.touched.is_empty());
    }

    #[test]
    fn test_empty_window_changes_nothing() {
        let state = state_at(1_000, 5.0);
        let update = advance(&state, &[], &energy(), &[]);

        assert_eq!(update.state, state);
        assert!(update.points.is_empty());
        assert_eq!(update.accumulator_values().count(), 0);
    }

    #[test]
    fn test_advance_adds_only_newer_records() {
        let state = state_at(1_000, 5.0);
        let records = vec![
            Record::new(700).with("consumption", 100.0),
            Record::new(1_000).with("consumption", 200.0),
            Record::new(1_300).with("consumption", 500.0),
            Record::new(1_600).with("consumption", 250.0),
        ];

        let update = advance(&state, &records, &energy(), &[]);

        assert_eq!(update.state.accumulator("meter_power"), Some(5.75));
        assert_eq!(update.state.watermark(), Some(1_600));
    }

    #[test]
    fn test_watermark_never_regresses() {
        let state = state_at(5_000, 1.0);
        let records = vec![Record::new(4_000).with("consumption", 100.0)];

        let update = advance(&state, &records, &energy(), &[]);
        assert_eq!(update.state.watermark(), Some(5_000));
    }

    #[test]
    fn test_zero_or_missing_ratio_disables_counter() {
        let specs = vec![
            AccumulatorSpec::new("meter_gas", "value1", Some(0.0)),
            AccumulatorSpec::new("meter_water", "value2", None),
        ];
        let records = vec![Record::new(10).with("value1", 5.0).with("value2", 7.0)];

        let update = advance(&SyncState::default(), &records, &specs, &[]);

        assert!(update.touched.is_empty());
        assert_eq!(update.state.accumulator("meter_gas"), None);
        assert_eq!(update.state.watermark(), Some(10));

        let update = seed(&records, &records, 0, &specs, &[]);
        assert!(update.touched.is_empty());
    }

    #[test]
    fn test_points_take_latest_filled_value() {
        let state = state_at(2_000, 0.0);
        let points = vec![
            PointSpec::new("measure_temperature", "temperature"),
            PointSpec::scaled("measure_power", "active", 12.0),
        ];
        let mut padded = Record::new(1_900);
        padded
            .fields
            .insert("temperature".to_string(), serde_json::Value::Null);
        let records = vec![
            Record::new(1_500).with("temperature", 19.5).with("active", 10.0),
            padded,
        ];

        // All records are at or before the watermark; points still apply.
        let update = advance(&state, &records, &[], &points);

        assert_eq!(
            update.points,
            vec![("measure_temperature", 19.5), ("measure_power", 120.0)]
        );
    }

    #[test]
    fn test_negative_delta_is_clamped() {
        let records = vec![Record::new(10).with("consumption", -500.0)];
        let update = advance(&state_at(0, 2.0), &records, &energy(), &[]);

        assert_eq!(update.state.accumulator("meter_power"), Some(2.0));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut state = state_at(10, 3.0);
        state.reset();
        assert_eq!(state, SyncState::default());
    }

    proptest! {
        #[test]
        fn rechunking_does_not_change_total(
            deltas in prop::collection::vec(0u32..5_000, 1..60),
            cuts in prop::collection::vec(1usize..10, 1..20),
        ) {
            let records: Vec<Record> = deltas
                .iter()
                .enumerate()
                .map(|(i, d)| Record::new((i as i64 + 1) * FIVE_MINUTES).with("consumption", *d as f64))
                .collect();
            let expected: f64 = deltas.iter().map(|d| *d as f64 / 1000.0).sum();

            let mut state = SyncState::default();
            state.accumulators.insert("meter_power".to_string(), 0.0);
            state.watermark = Some(0);

            let mut start = 0usize;
            let mut cut = cuts.iter().cycle();
            while start < records.len() {
                let end = (start + cut.next().copied().unwrap_or(1)).min(records.len());
                // Windows are requested from the watermark, so each one replays its predecessor's last record.
                let from = start.saturating_sub(1);
                state = advance(&state, &records[from..end], &energy(), &[]).state;
                start = end;
            }

            let total = state.accumulator("meter_power").unwrap();
            prop_assert!((total - expected).abs() < 1e-6);
            prop_assert_eq!(state.watermark(), records.last().map(|r| r.timestamp));
        }
    }
}
