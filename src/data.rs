use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tracing::{info, warn};

use crate::analysis::{DEFAULT_CONTROL, DEFAULT_TREATMENT};
use crate::models::UserRecord;

/// Retention probabilities used to simulate one experiment arm.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmProfile {
    pub label: String,
    pub day1: f64,
    pub day7: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleSpec {
    pub n_users: usize,
    pub seed: u64,
    pub control: ArmProfile,
    pub treatment: ArmProfile,
}

impl Default for SampleSpec {
    fn default() -> Self {
        Self {
            n_users: 90_189,
            seed: 42,
            control: ArmProfile {
                label: DEFAULT_CONTROL.to_string(),
                day1: 0.44,
                day7: 0.19,
            },
            treatment: ArmProfile {
                label: DEFAULT_TREATMENT.to_string(),
                day1: 0.47,
                day7: 0.20,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    File(PathBuf),
    Generated { seed: u64 },
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::File(path) => write!(f, "{}", path.display()),
            DataSource::Generated { seed } => write!(f, "synthetic sample (seed {seed})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub records: Vec<UserRecord>,
    pub source: DataSource,
}

/// Simulates an experiment with independent Bernoulli outcomes per user and horizon.
///
/// The first half of the users (rounded down) land in the control arm. The
/// same `SampleSpec` always produces the same records.
pub fn generate_sample(spec: &SampleSpec) -> Vec<UserRecord> {
    let mut rng = Pcg32::seed_from_u64(spec.seed);
    let n_control = spec.n_users / 2;

    (0..spec.n_users)
        .map(|index| {
            let profile = if index < n_control {
                &spec.control
            } else {
                &spec.treatment
            };
            UserRecord {
                user_id: index as u64 + 1,
                arm: profile.label.clone(),
                retained_day1: rng.random_bool(profile.day1),
                retained_day7: rng.random_bool(profile.day7),
            }
        })
        .collect()
}

pub fn load_csv(path: &Path) -> anyhow::Result<Vec<UserRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut records = Vec::new();

    for (line, result) in reader.deserialize::<UserRecord>().enumerate() {
        let record =
            result.with_context(|| format!("invalid row {} in {}", line + 2, path.display()))?;
        records.push(record);
    }

    Ok(records)
}

/// Loads `path`, or simulates `spec` when no file exists there.
pub fn load_or_generate(path: &Path, spec: &SampleSpec) -> anyhow::Result<LoadedDataset> {
    match std::fs::metadata(path) {
        Ok(_) => {
            let records = load_csv(path)?;
            info!(path = %path.display(), records = records.len(), "loaded dataset");
            Ok(LoadedDataset {
                records,
                source: DataSource::File(path.to_path_buf()),
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(
                path = %path.display(),
                users = spec.n_users,
                seed = spec.seed,
                "dataset not found, generating sample data"
            );
            Ok(LoadedDataset {
                records: generate_sample(spec),
                source: DataSource::Generated { seed: spec.seed },
            })
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

pub fn write_csv(path: &Path, records: &[UserRecord]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
