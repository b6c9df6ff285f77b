// src/chart.rs
//
// Chart model fed from the sample channel. The UI calls `tick()` once per
// refresh; everything here is owned by the rendering context.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::channel::SampleReceiver;
use crate::decoder::Sample;
use crate::io::ScopeEvent;
use crate::settings::ChartSettings;

/// Y padding applied by auto-scaling, as a fraction of the data span
const Y_PADDING: f64 = 0.05;

// ============================================================================
// Types
// ============================================================================

/// Quantity plotted on the x axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XAxis {
    /// Frame index
    Frame,
    /// Seconds since the first sample of the session
    Seconds,
}

impl Default for XAxis {
    fn default() -> Self {
        XAxis::Frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    pub const UNIT: AxisRange = AxisRange { min: -1.0, max: 1.0 };

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Points of one channel, oldest first, capped at `max_points`.
#[derive(Debug, Clone)]
pub struct Series {
    points: VecDeque<(f64, f64)>,
    max_points: usize,
    last_seq: Option<u64>,
}

impl Series {
    fn new(max_points: usize) -> Self {
        Series {
            points: VecDeque::with_capacity(max_points.min(4096)),
            max_points,
            last_seq: None,
        }
    }

    /// Append a point, evicting the oldest at the cap.
    /// A sequence number not above the last one is ignored.
    fn push(&mut self, seq: u64, x: f64, y: f64) -> bool {
        if self.last_seq.is_some_and(|last| seq <= last) {
            return false;
        }
        while self.points.len() >= self.max_points {
            self.points.pop_front();
        }
        self.points.push_back((x, y));
        self.last_seq = Some(seq);
        true
    }

    pub fn points(&self) -> &VecDeque<(f64, f64)> {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    fn x_bounds(&self) -> Option<(f64, f64)> {
        // Points arrive in x order for both axis modes
        Some((self.points.front()?.0, self.points.back()?.0))
    }

    fn y_bounds(&self) -> Option<(f64, f64)> {
        self.points.iter().fold(None, |acc, &(_, y)| match acc {
            None => Some((y, y)),
            Some((lo, hi)) => Some((lo.min(y), hi.max(y))),
        })
    }
}

/// One chart: its channels and current axis ranges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartView {
    pub channels: Vec<usize>,
    pub x_range: AxisRange,
    pub y_range: AxisRange,
}

/// Nearest point to a hover position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HoverPoint {
    pub channel: usize,
    pub x: f64,
    pub y: f64,
}

// ============================================================================
// Chart updater
// ============================================================================

pub struct ChartUpdater {
    rx: SampleReceiver,
    settings: ChartSettings,
    series: BTreeMap<usize, Series>,
    views: Vec<ChartView>,
    origin_us: Option<u64>,
    generation: u64,
    complete_sent: bool,
}

impl ChartUpdater {
    /// `max_points` and `max_per_tick` are raised to at least 1.
    pub fn new(rx: SampleReceiver, mut settings: ChartSettings) -> Self {
        settings.max_points = settings.max_points.max(1);
        settings.max_per_tick = settings.max_per_tick.max(1);
        let generation = rx.generation();
        let mut updater = ChartUpdater {
            rx,
            settings,
            series: BTreeMap::new(),
            views: Vec::new(),
            origin_us: None,
            generation,
            complete_sent: false,
        };
        updater.rebuild_views();
        updater
    }

    /// Drain available samples into the series. Returns the events the UI
    /// should see for this tick.
    pub fn tick(&mut self) -> Vec<ScopeEvent> {
        let batch = self.rx.drain_batch(self.settings.max_per_tick);
        if batch.generation != self.generation {
            // The link was reopened; these samples start the new series
            self.generation = batch.generation;
            self.complete_sent = false;
            self.clear();
        }

        let mut touched: BTreeMap<usize, Vec<(f64, f64)>> = BTreeMap::new();
        for sample in &batch.samples {
            if let Some(point) = self.append(sample) {
                touched.entry(sample.channel).or_default().push(point);
            }
        }

        let new_channel = self.settings.charts.is_empty()
            && touched.keys().any(|c| !self.views_contain(*c));
        if new_channel {
            self.rebuild_views();
        } else if !touched.is_empty() {
            self.update_ranges();
        }

        let max_points = self.settings.max_points;
        let mut events: Vec<ScopeEvent> = touched
            .into_iter()
            .map(|(channel, mut appended)| {
                // Points evicted within this tick are not reported
                if appended.len() > max_points {
                    appended.drain(..appended.len() - max_points);
                }
                ScopeEvent::SeriesUpdated {
                    channel,
                    points: self.series.get(&channel).map_or(0, Series::len),
                    appended,
                }
            })
            .collect();

        if !self.complete_sent && batch.drained {
            self.complete_sent = true;
            tlog!("[chart] Processing complete");
            events.push(ScopeEvent::ProcessingComplete);
        }
        events
    }

    fn append(&mut self, sample: &Sample) -> Option<(f64, f64)> {
        let x = match self.settings.x_axis {
            XAxis::Frame => sample.frame as f64,
            XAxis::Seconds => {
                let origin = *self.origin_us.get_or_insert(sample.timestamp_us);
                sample.timestamp_us.saturating_sub(origin) as f64 / 1_000_000.0
            }
        };
        let max_points = self.settings.max_points;
        let pushed = self
            .series
            .entry(sample.channel)
            .or_insert_with(|| Series::new(max_points))
            .push(sample.seq, x, sample.value);
        pushed.then_some((x, sample.value))
    }

    fn views_contain(&self, channel: usize) -> bool {
        self.views.iter().any(|v| v.channels.contains(&channel))
    }

    /// Channels per chart: the configured groups, or one chart with every
    /// channel seen so far.
    fn chart_channels(&self) -> Vec<Vec<usize>> {
        if self.settings.charts.is_empty() {
            vec![self.series.keys().copied().collect()]
        } else {
            self.settings.charts.clone()
        }
    }

    fn rebuild_views(&mut self) {
        let previous = std::mem::take(&mut self.views);
        self.views = self
            .chart_channels()
            .into_iter()
            .enumerate()
            .map(|(i, channels)| ChartView {
                channels,
                x_range: previous.get(i).map_or(AxisRange::UNIT, |v| v.x_range),
                y_range: previous.get(i).map_or(AxisRange::UNIT, |v| v.y_range),
            })
            .collect();
        self.update_ranges();
    }

    fn update_ranges(&mut self) {
        for view in &mut self.views {
            let members: Vec<&Series> = view
                .channels
                .iter()
                .filter_map(|c| self.series.get(c))
                .filter(|s| !s.is_empty())
                .collect();
            if members.is_empty() {
                continue;
            }

            let (x_lo, x_hi) = merge(members.iter().filter_map(|s| s.x_bounds()));
            view.x_range = widen(x_lo, x_hi, 0.0);

            if self.settings.auto_scale {
                let (y_lo, y_hi) = merge(members.iter().filter_map(|s| s.y_bounds()));
                view.y_range = widen(y_lo, y_hi, Y_PADDING);
            }
        }
    }

    /// Nearest point to `point` by x distance among the series of one chart.
    /// Equal distances resolve to the smaller channel index.
    pub fn hover(&self, chart_index: usize, point: (f64, f64)) -> Option<HoverPoint> {
        let (x, _) = point;
        let view = self.views.get(chart_index)?;

        let mut channels = view.channels.clone();
        channels.sort_unstable();

        let mut best: Option<(f64, HoverPoint)> = None;
        for channel in channels {
            let Some(series) = self.series.get(&channel) else {
                continue;
            };
            for &(px, py) in series.points() {
                let distance = (px - x).abs();
                // Strict comparison keeps the earlier (smaller) channel on ties
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((
                        distance,
                        HoverPoint {
                            channel,
                            x: px,
                            y: py,
                        },
                    ));
                }
            }
        }
        best.map(|(_, hit)| hit)
    }

    /// Override the y range of one chart (used when auto-scale is off).
    pub fn set_y_range(&mut self, chart_index: usize, range: AxisRange) {
        if let Some(view) = self.views.get_mut(chart_index) {
            view.y_range = range;
        }
    }

    /// Empty every series and reset the axes.
    pub fn clear(&mut self) {
        self.series.clear();
        self.origin_us = None;
        self.views.clear();
        self.rebuild_views();
    }

    pub fn series(&self, channel: usize) -> Option<&Series> {
        self.series.get(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.series.keys().copied()
    }

    pub fn charts(&self) -> &[ChartView] {
        &self.views
    }

    /// Samples lost to channel backpressure in this link session.
    pub fn dropped(&self) -> u64 {
        self.rx.dropped()
    }

    pub fn settings(&self) -> &ChartSettings {
        &self.settings
    }
}

fn merge(bounds: impl Iterator<Item = (f64, f64)>) -> (f64, f64) {
    bounds.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (a, b)| {
        (lo.min(a), hi.max(b))
    })
}

/// Pad a range by `padding` of its span; a zero-width range becomes ±1 around it.
fn widen(lo: f64, hi: f64, padding: f64) -> AxisRange {
    let span = hi - lo;
    if span <= f64::EPSILON * lo.abs().max(1.0) {
        return AxisRange {
            min: lo - 1.0,
            max: hi + 1.0,
        };
    }
    AxisRange {
        min: lo - span * padding,
        max: hi + span * padding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{sample_channel, Backpressure, SampleSender};

    fn sample(channel: usize, seq: u64, frame: u64, value: f64) -> Sample {
        Sample {
            channel,
            value,
            seq,
            frame,
            timestamp_us: 1_000_000 + frame * 500_000,
        }
    }

    fn updater(settings: ChartSettings) -> (SampleSender, ChartUpdater) {
        let (tx, rx) = sample_channel(1024, Backpressure::DropOldest);
        (tx, ChartUpdater::new(rx, settings))
    }

    #[test]
    fn test_series_capped_with_fifo_eviction() {
        let settings = ChartSettings {
            max_points: 5,
            ..Default::default()
        };
        let (tx, mut chart) = updater(settings);
        tx.push_all((0..12).map(|i| sample(0, i, i, i as f64)).collect());

        let events = chart.tick();
        assert_eq!(
            events,
            vec![ScopeEvent::SeriesUpdated {
                channel: 0,
                points: 5,
                appended: (7..12).map(|i| (i as f64, i as f64)).collect(),
            }]
        );
        let xs: Vec<f64> = chart.series(0).unwrap().points().iter().map(|p| p.0).collect();
        assert_eq!(xs, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_tick_respects_max_per_tick() {
        let settings = ChartSettings {
            max_per_tick: 3,
            ..Default::default()
        };
        let (tx, mut chart) = updater(settings);
        tx.push_all((0..5).map(|i| sample(0, i, i, 0.0)).collect());

        chart.tick();
        assert_eq!(chart.series(0).unwrap().len(), 3);
        chart.tick();
        assert_eq!(chart.series(0).unwrap().len(), 5);
    }

    #[test]
    fn test_auto_scale_pads_and_widens() {
        let (tx, mut chart) = updater(ChartSettings::default());
        tx.push_all(vec![sample(0, 0, 0, 0.0), sample(0, 1, 1, 10.0)]);
        chart.tick();

        let view = &chart.charts()[0];
        assert_eq!(view.channels, vec![0]);
        assert_eq!(view.x_range, AxisRange { min: 0.0, max: 1.0 });
        assert!((view.y_range.min + 0.5).abs() < 1e-9);
        assert!((view.y_range.max - 10.5).abs() < 1e-9);

        // A flat single channel gets a ±1 band
        let (tx, mut chart) = updater(ChartSettings::default());
        tx.push(sample(0, 0, 0, 3.0));
        chart.tick();
        assert_eq!(chart.charts()[0].y_range, AxisRange { min: 2.0, max: 4.0 });
    }

    #[test]
    fn test_seconds_axis_relative_to_first_sample() {
        let settings = ChartSettings {
            x_axis: XAxis::Seconds,
            ..Default::default()
        };
        let (tx, mut chart) = updater(settings);
        tx.push_all(vec![sample(0, 0, 0, 1.0), sample(0, 1, 3, 2.0)]);
        chart.tick();
        let xs: Vec<f64> = chart.series(0).unwrap().points().iter().map(|p| p.0).collect();
        assert_eq!(xs, vec![0.0, 1.5]);
    }

    #[test]
    fn test_configured_chart_groups() {
        let settings = ChartSettings {
            charts: vec![vec![0, 1], vec![2]],
            ..Default::default()
        };
        let (tx, mut chart) = updater(settings);
        tx.push_all(vec![
            sample(0, 0, 0, 1.0),
            sample(1, 1, 0, 2.0),
            sample(2, 2, 0, 100.0),
        ]);
        chart.tick();

        assert_eq!(chart.charts().len(), 2);
        assert_eq!(chart.charts()[1].channels, vec![2]);
        assert!(chart.charts()[0].y_range.max < 3.0);
        assert!(chart.charts()[1].y_range.min > 98.0);
    }

    #[test]
    fn test_hover_nearest_with_channel_tie_break() {
        let (tx, mut chart) = updater(ChartSettings::default());
        tx.push_all(vec![
            sample(1, 0, 2, 20.0),
            sample(0, 1, 2, 10.0),
            sample(0, 2, 5, 11.0),
        ]);
        chart.tick();

        // Channels 0 and 1 both have a point at x = 2
        let hit = chart.hover(0, (2.2, 0.0)).unwrap();
        assert_eq!(hit, HoverPoint { channel: 0, x: 2.0, y: 10.0 });

        let hit = chart.hover(0, (4.0, 0.0)).unwrap();
        assert_eq!(hit.x, 5.0);

        assert!(chart.hover(3, (0.0, 0.0)).is_none());
    }

    #[test]
    fn test_out_of_order_sequence_ignored() {
        let (tx, mut chart) = updater(ChartSettings::default());
        tx.push_all(vec![sample(0, 5, 0, 1.0), sample(0, 4, 1, 2.0)]);
        chart.tick();
        assert_eq!(chart.series(0).unwrap().len(), 1);
        assert_eq!(chart.series(0).unwrap().last_seq(), Some(5));
    }

    #[test]
    fn test_zero_max_points_is_clamped() {
        let settings = ChartSettings {
            max_points: 0,
            max_per_tick: 0,
            ..Default::default()
        };
        let (tx, mut chart) = updater(settings);
        tx.push_all(vec![sample(0, 0, 0, 1.0), sample(0, 1, 1, 2.0)]);

        chart.tick();
        chart.tick();
        assert_eq!(chart.settings().max_points, 1);
        assert_eq!(chart.series(0).unwrap().points().iter().copied().collect::<Vec<_>>(), vec![(1.0, 2.0)]);
    }

    #[test]
    fn test_reopened_session_samples_charted_despite_lower_seq() {
        let (tx, mut chart) = updater(ChartSettings::default());
        tx.push_all((0..20).map(|i| sample(0, i, i, 1.0)).collect());
        chart.tick();
        assert_eq!(chart.series(0).unwrap().last_seq(), Some(19));

        // New link session: sequence numbers restart at 0
        tx.reopen();
        tx.push_all((0..3).map(|i| sample(0, i, i, 2.0)).collect());
        let events = chart.tick();

        assert_eq!(chart.series(0).unwrap().len(), 3);
        assert_eq!(chart.series(0).unwrap().last_seq(), Some(2));
        assert_eq!(
            events,
            vec![ScopeEvent::SeriesUpdated {
                channel: 0,
                points: 3,
                appended: vec![(0.0, 2.0), (1.0, 2.0), (2.0, 2.0)],
            }]
        );
    }

    #[test]
    fn test_processing_complete_once_per_session() {
        let (tx, mut chart) = updater(ChartSettings::default());
        tx.push(sample(0, 0, 0, 1.0));
        assert!(!chart.tick().contains(&ScopeEvent::ProcessingComplete));

        tx.close();
        assert!(chart.tick().contains(&ScopeEvent::ProcessingComplete));
        assert!(chart.tick().is_empty());

        // Reopening clears the series and re-arms the signal
        tx.reopen();
        tx.push(sample(0, 0, 0, 1.0));
        tx.close();
        let events = chart.tick();
        assert_eq!(chart.series(0).unwrap().len(), 1);
        assert!(events.contains(&ScopeEvent::ProcessingComplete));
    }
}
