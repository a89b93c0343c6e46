//! Read-only views derived from a window snapshot: chart series, KPI tiles, anomaly lists.
//!
//! Nothing here touches the store. Callers take a snapshot first and derive from it.

use crate::stream::record::{Metric, TelemetryRecord};
use serde::Serialize;

const PLACEHOLDER: &str = "--";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KpiTile {
    pub label: &'static str,
    pub unit: &'static str,
    pub value: String,
}

pub fn metric_label(metric: Metric) -> &'static str {
    match metric {
        Metric::Temperature => "Temp",
        Metric::Emissions => "Emissions",
        Metric::Power => "Power",
        Metric::Vibration => "Vibration",
        Metric::Pressure => "Pressure",
        Metric::Fineness => "Fineness",
        Metric::Residue => "Residue",
    }
}

/// The last `limit` anomalous records of the window, newest first.
pub fn recent_anomalies(snapshot: &[TelemetryRecord], limit: usize) -> Vec<&TelemetryRecord> {
    snapshot
        .iter()
        .rev()
        .filter(|record| record.anomaly)
        .take(limit)
        .collect()
}

/// Anomalous records among the last `entries` records, oldest first.
pub fn anomalies_in_last(snapshot: &[TelemetryRecord], entries: usize) -> Vec<&TelemetryRecord> {
    let start = snapshot.len().saturating_sub(entries);
    snapshot[start..]
        .iter()
        .filter(|record| record.anomaly)
        .collect()
}

/// One chart point per record; values are rounded to two decimals and gaps stay gaps.
pub fn metric_series(snapshot: &[TelemetryRecord], metric: Metric) -> Vec<SeriesPoint> {
    snapshot
        .iter()
        .map(|record| SeriesPoint {
            timestamp: record.timestamp.clone(),
            value: record.metric(metric).map(round_two_decimals),
        })
        .collect()
}

pub fn kpi_tiles(latest: Option<&TelemetryRecord>) -> Vec<KpiTile> {
    let mut tiles: Vec<KpiTile> = Metric::ALL
        .into_iter()
        .map(|metric| KpiTile {
            label: metric_label(metric),
            unit: metric.unit(),
            value: format_metric(latest.and_then(|record| record.metric(metric)), 2),
        })
        .collect();

    tiles.push(KpiTile {
        label: "Anomaly",
        unit: "",
        value: match latest {
            Some(record) if record.anomaly => "Yes".to_string(),
            Some(_) => "No".to_string(),
            None => PLACEHOLDER.to_string(),
        },
    });
    tiles
}

pub fn format_metric(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(number) if number.is_finite() => format!("{number:.decimals$}"),
        _ => PLACEHOLDER.to_string(),
    }
}

/// Compact form for tiles: `1.5M`, `12.3k`, `7.25`.
pub fn format_short(value: Option<f64>) -> String {
    let Some(number) = value.filter(|number| number.is_finite()) else {
        return PLACEHOLDER.to_string();
    };

    if number.abs() >= 1e6 {
        format!("{:.1}M", number / 1e6)
    } else if number.abs() >= 1e3 {
        format!("{:.1}k", number / 1e3)
    } else {
        format!("{number:.2}")
    }
}

fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sequence: usize, anomaly: bool) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: format!("t{sequence}"),
            temperature: Some(1_000.0 + sequence as f64 + 0.456),
            anomaly,
            anomaly_type: anomaly.then(|| "thermal".to_string()),
            ..TelemetryRecord::default()
        }
    }

    #[test]
    fn recent_anomalies_are_newest_first_and_capped() {
        let snapshot: Vec<TelemetryRecord> =
            (0..30).map(|sequence| record(sequence, sequence % 2 == 0)).collect();

        let anomalies = recent_anomalies(&snapshot, 10);
        assert_eq!(anomalies.len(), 10);
        assert_eq!(anomalies[0].timestamp, "t28");
        assert_eq!(anomalies[9].timestamp, "t10");
    }

    #[test]
    fn anomalies_in_last_only_scans_the_tail() {
        let snapshot: Vec<TelemetryRecord> = (0..20)
            .map(|sequence| record(sequence, sequence == 3 || sequence >= 17))
            .collect();

        let anomalies = anomalies_in_last(&snapshot, 10);
        let timestamps: Vec<&str> = anomalies.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(timestamps, vec!["t17", "t18", "t19"]);
        assert_eq!(anomalies_in_last(&snapshot[..2], 10).len(), 0);
    }

    #[test]
    fn series_rounds_values_and_keeps_gaps() {
        let mut snapshot = vec![record(0, false), record(1, false)];
        snapshot[1].temperature = None;

        let series = metric_series(&snapshot, Metric::Temperature);
        assert_eq!(
            series,
            vec![
                SeriesPoint {
                    timestamp: "t0".to_string(),
                    value: Some(1_000.46),
                },
                SeriesPoint {
                    timestamp: "t1".to_string(),
                    value: None,
                },
            ]
        );
    }

    #[test]
    fn kpi_tiles_show_placeholders_without_data() {
        let tiles = kpi_tiles(None);
        assert_eq!(tiles.len(), Metric::ALL.len() + 1);
        assert!(tiles.iter().all(|tile| tile.value == PLACEHOLDER));

        let latest = record(4, true);
        let tiles = kpi_tiles(Some(&latest));
        assert_eq!(tiles[0].label, "Temp");
        assert_eq!(tiles[0].value, "1004.46");
        assert_eq!(tiles[1].value, PLACEHOLDER);
        assert_eq!(tiles.last().map(|tile| tile.value.as_str()), Some("Yes"));
    }

    #[test]
    fn formats_short_numbers() {
        assert_eq!(format_short(Some(1_500_000.0)), "1.5M");
        assert_eq!(format_short(Some(-12_345.0)), "-12.3k");
        assert_eq!(format_short(Some(7.254)), "7.25");
        assert_eq!(format_short(None), "--");
        assert_eq!(format_metric(Some(1.23456), 3), "1.235");
    }
}
