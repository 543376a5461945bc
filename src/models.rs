use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(alias = "userid")]
    pub user_id: u64,
    #[serde(alias = "version")]
    pub arm: String,
    #[serde(
        alias = "retention_1",
        deserialize_with = "flag::deserialize",
        serialize_with = "flag::serialize"
    )]
    pub retained_day1: bool,
    #[serde(
        alias = "retention_7",
        deserialize_with = "flag::deserialize",
        serialize_with = "flag::serialize"
    )]
    pub retained_day7: bool,
}

impl UserRecord {
    pub fn retained(&self, horizon: Horizon) -> bool {
        match horizon {
            Horizon::Day1 => self.retained_day1,
            Horizon::Day7 => self.retained_day7,
        }
    }
}

/// Retention horizon measured after first activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Horizon {
    Day1,
    Day7,
}

impl Horizon {
    pub const ALL: [Horizon; 2] = [Horizon::Day1, Horizon::Day7];

    pub fn days(self) -> u32 {
        match self {
            Horizon::Day1 => 1,
            Horizon::Day7 => 7,
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Day {}", self.days())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmSummary {
    pub users: usize,
    pub d1_retention: f64,
    pub d7_retention: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiSummary {
    pub total_users: usize,
    pub daily_active_users: usize,
    pub overall_d1_retention: f64,
    pub overall_d7_retention: f64,
    pub by_arm: BTreeMap<String, ArmSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub p_value: f64,
    /// Smallest expected cell count under independence.
    pub min_expected: f64,
}

/// Comparison of one retention horizon between the two arms.
///
/// `test` carries its own error so a degenerate table on one horizon leaves
/// the other horizon's result intact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HorizonResult {
    pub horizon: Horizon,
    pub rate_a: f64,
    pub rate_b: f64,
    pub diff: f64,
    pub lift_percent: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub test: Result<ChiSquareTest, AnalysisError>,
}

impl HorizonResult {
    pub fn p_value(&self) -> Result<f64, AnalysisError> {
        self.test.as_ref().map(|test| test.p_value).map_err(Clone::clone)
    }

    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value().is_ok_and(|p| p < alpha)
    }

    pub fn standard_error(&self) -> f64 {
        (self.ci_upper - self.diff) / crate::analysis::Z_95
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbTestResult {
    pub control: String,
    pub treatment: String,
    pub n_control: usize,
    pub n_treatment: usize,
    pub day1: HorizonResult,
    pub day7: HorizonResult,
}

impl AbTestResult {
    pub fn horizon(&self, horizon: Horizon) -> &HorizonResult {
        match horizon {
            Horizon::Day1 => &self.day1,
            Horizon::Day7 => &self.day7,
        }
    }
}

/// Retention flags as written by pandas (`True`/`False`) or as plain `0`/`1`.
mod flag {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(de::Error::custom(format!(
                "invalid retention flag `{other}`, expected 0/1 or true/false"
            ))),
        }
    }

    pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(u8::from(*value))
    }
}
