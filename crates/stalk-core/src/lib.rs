pub mod config;
pub mod gate;
pub mod prefs;
pub mod tracker_ipc;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use gate::{DeleteGate, ExistenceRecord};
pub use prefs::{MemoryPrefStore, PrefError, PrefKey, PrefStore};

/// Sampling cadence selectable from the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SamplingInterval {
    #[serde(rename = "1s")]
    OneSecond,
    #[serde(rename = "5s")]
    FiveSeconds,
    #[serde(rename = "10s")]
    TenSeconds,
    #[serde(rename = "30s")]
    ThirtySeconds,
}

impl Default for SamplingInterval {
    fn default() -> Self {
        Self::TenSeconds
    }
}

impl SamplingInterval {
    pub const ALL: [SamplingInterval; 4] = [
        SamplingInterval::OneSecond,
        SamplingInterval::FiveSeconds,
        SamplingInterval::TenSeconds,
        SamplingInterval::ThirtySeconds,
    ];

    /// Resolves a persisted label, falling back to the 10s default for anything unknown.
    pub fn resolve(label: &str) -> Self {
        label.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingInterval::OneSecond => "1s",
            SamplingInterval::FiveSeconds => "5s",
            SamplingInterval::TenSeconds => "10s",
            SamplingInterval::ThirtySeconds => "30s",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            SamplingInterval::OneSecond => Duration::from_secs(1),
            SamplingInterval::FiveSeconds => Duration::from_secs(5),
            SamplingInterval::TenSeconds => Duration::from_secs(10),
            SamplingInterval::ThirtySeconds => Duration::from_secs(30),
        }
    }

    pub fn priority(&self) -> PowerPriority {
        PowerPriority::for_interval(self.duration())
    }

    pub fn next(&self) -> Self {
        let idx = Self::ALL.iter().position(|item| item == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }

    pub fn previous(&self) -> Self {
        let idx = Self::ALL.iter().position(|item| item == self).unwrap_or(0);
        Self::ALL[(idx + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl fmt::Display for SamplingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplingInterval {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "1s" => Ok(SamplingInterval::OneSecond),
            "5s" => Ok(SamplingInterval::FiveSeconds),
            "10s" => Ok(SamplingInterval::TenSeconds),
            "30s" => Ok(SamplingInterval::ThirtySeconds),
            other => Err(format!("Unknown sampling interval: {other}")),
        }
    }
}

/// Accuracy/power trade-off requested from the position source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPriority {
    HighAccuracy,
    BalancedPowerAccuracy,
}

impl PowerPriority {
    pub const BALANCED_THRESHOLD: Duration = Duration::from_secs(30);

    pub fn for_interval(interval: Duration) -> Self {
        if interval < Self::BALANCED_THRESHOLD {
            PowerPriority::HighAccuracy
        } else {
            PowerPriority::BalancedPowerAccuracy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerPriority::HighAccuracy => "high_accuracy",
            PowerPriority::BalancedPowerAccuracy => "balanced_power_accuracy",
        }
    }
}

impl fmt::Display for PowerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl FromStr for Position {
    type Err = String;

    /// Parses `lat,lon` with surrounding whitespace tolerated.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = input
            .trim()
            .split_once(',')
            .ok_or_else(|| format!("expected 'lat,lon', got '{input}'"))?;
        let latitude = lat
            .trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid latitude '{lat}': {err}"))?;
        let longitude = lon
            .trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid longitude '{lon}': {err}"))?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(format!("position out of range: {latitude},{longitude}"));
        }
        Ok(Position::new(latitude, longitude))
    }
}

/// One position report as posted to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReport {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl SampleReport {
    pub fn new(identity: impl Into<String>, position: Position) -> Self {
        Self {
            name: identity.into(),
            latitude: position.latitude,
            longitude: position.longitude,
        }
    }

    pub fn identity(&self) -> &str {
        &self.name
    }
}

/// Lifecycle phase of the tracking loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerPhase {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl TrackerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerPhase::Idle => "idle",
            TrackerPhase::Starting => "starting",
            TrackerPhase::Active => "active",
            TrackerPhase::Stopping => "stopping",
        }
    }
}

impl fmt::Display for TrackerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_labels_map_to_their_durations() {
        assert_eq!(SamplingInterval::resolve("1s").duration(), Duration::from_secs(1));
        assert_eq!(SamplingInterval::resolve("5s").duration(), Duration::from_secs(5));
        assert_eq!(SamplingInterval::resolve("10s").duration(), Duration::from_secs(10));
        assert_eq!(SamplingInterval::resolve("30s").duration(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_labels_fall_back_to_ten_seconds() {
        for label in ["abc", "", "60s", "1m", "10"] {
            assert_eq!(
                SamplingInterval::resolve(label),
                SamplingInterval::TenSeconds,
                "label {label:?}"
            );
        }
        let resolved = SamplingInterval::resolve("bogus");
        assert_eq!(SamplingInterval::resolve(resolved.as_str()), resolved);
    }

    #[test]
    fn short_intervals_select_high_accuracy() {
        for interval in [
            SamplingInterval::OneSecond,
            SamplingInterval::FiveSeconds,
            SamplingInterval::TenSeconds,
        ] {
            assert_eq!(interval.priority(), PowerPriority::HighAccuracy);
        }
        assert_eq!(
            SamplingInterval::ThirtySeconds.priority(),
            PowerPriority::BalancedPowerAccuracy
        );
        assert_eq!(
            PowerPriority::for_interval(Duration::from_secs(29)),
            PowerPriority::HighAccuracy
        );
        assert_eq!(
            PowerPriority::for_interval(Duration::from_secs(120)),
            PowerPriority::BalancedPowerAccuracy
        );
    }

    #[test]
    fn interval_selector_wraps_both_ways() {
        assert_eq!(
            SamplingInterval::ThirtySeconds.next(),
            SamplingInterval::OneSecond
        );
        assert_eq!(
            SamplingInterval::OneSecond.previous(),
            SamplingInterval::ThirtySeconds
        );
    }

    #[test]
    fn position_parses_lat_lon_pairs() {
        let position: Position = " 59.3293, 18.0686 ".parse().expect("parse");
        assert_eq!(position, Position::new(59.3293, 18.0686));
        assert!("59.3".parse::<Position>().is_err());
        assert!("91.0,0.0".parse::<Position>().is_err());
        assert!("north,east".parse::<Position>().is_err());
    }

    #[test]
    fn sample_report_serializes_collector_body() {
        let report = SampleReport::new("Alice", Position::new(1.5, -2.25));
        let value = serde_json::to_value(&report).expect("encode");
        assert_eq!(
            value,
            serde_json::json!({"name": "Alice", "latitude": 1.5, "longitude": -2.25})
        );
    }
}
