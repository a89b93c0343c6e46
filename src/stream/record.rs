use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Numeric channels carried by a telemetry record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Temperature,
    Emissions,
    Power,
    Vibration,
    Pressure,
    Fineness,
    Residue,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Self::Temperature,
        Self::Emissions,
        Self::Power,
        Self::Vibration,
        Self::Pressure,
        Self::Fineness,
        Self::Residue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Emissions => "emissions",
            Self::Power => "power",
            Self::Vibration => "vibration",
            Self::Pressure => "pressure",
            Self::Fineness => "fineness",
            Self::Residue => "residue",
        }
    }

    /// Upstream keys that older producers used for this metric.
    pub fn legacy_aliases(self) -> &'static [&'static str] {
        match self {
            Self::Emissions => &["emission"],
            _ => &[],
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "C",
            Self::Emissions => "mg/Nm3",
            Self::Power => "kW",
            Self::Vibration => "mm/s",
            Self::Pressure => "bar",
            Self::Fineness => "m2/kg",
            Self::Residue => "%",
        }
    }
}

/// Canonical telemetry sample after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TelemetryRecord {
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emissions: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fineness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub residue: Option<f64>,
    #[serde(default)]
    pub anomaly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_type: Option<String>,
}

impl TelemetryRecord {
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Emissions => self.emissions,
            Metric::Power => self.power,
            Metric::Vibration => self.vibration,
            Metric::Pressure => self.pressure,
            Metric::Fineness => self.fineness,
            Metric::Residue => self.residue,
        }
    }

    pub fn set_metric(&mut self, metric: Metric, value: Option<f64>) {
        let slot = match metric {
            Metric::Temperature => &mut self.temperature,
            Metric::Emissions => &mut self.emissions,
            Metric::Power => &mut self.power,
            Metric::Vibration => &mut self.vibration,
            Metric::Pressure => &mut self.pressure,
            Metric::Fineness => &mut self.fineness,
            Metric::Residue => &mut self.residue,
        };
        *slot = value;
    }
}

/// One anomaly notification from the alert stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
    pub prob: f64,
    /// Every other field of the upstream frame, untouched.
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl AlertEvent {
    pub fn describe(&self) -> String {
        format!(
            "Anomaly on {} (prob: {:.1}%)",
            self.equipment.as_deref().unwrap_or("unknown equipment"),
            self.prob * 100.0
        )
    }
}

/// A frame the decoder could not turn into a record, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedFrame {
    pub received_at: String,
    pub payload: String,
}
