use std::collections::BTreeMap;

use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{debug, warn};

use crate::error::{AnalysisError, Result};
use crate::models::{
    AbTestResult, ArmSummary, ChiSquareTest, Horizon, HorizonResult, KpiSummary, UserRecord,
};

pub const DEFAULT_CONTROL: &str = "gate_30";
pub const DEFAULT_TREATMENT: &str = "gate_40";

/// Two-sided 95% quantile of the standard normal distribution.
pub const Z_95: f64 = 1.96;

/// Caller-selected checks and corrections for the independence test.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TestOptions {
    /// Reject tables whose smallest expected cell count falls below this value.
    pub min_expected_count: Option<f64>,
    /// Apply Yates' continuity correction to the chi-square statistic.
    pub continuity_correction: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    users: usize,
    day1: usize,
    day7: usize,
}

impl Tally {
    fn add(&mut self, record: &UserRecord) {
        self.users += 1;
        self.day1 += usize::from(record.retained(Horizon::Day1));
        self.day7 += usize::from(record.retained(Horizon::Day7));
    }

    fn retained(&self, horizon: Horizon) -> usize {
        match horizon {
            Horizon::Day1 => self.day1,
            Horizon::Day7 => self.day7,
        }
    }

    fn rate(&self, horizon: Horizon) -> f64 {
        if self.users == 0 {
            f64::NAN
        } else {
            self.retained(horizon) as f64 / self.users as f64
        }
    }
}

pub fn compute_kpis(records: &[UserRecord]) -> Result<KpiSummary> {
    if records.is_empty() {
        return Err(AnalysisError::EmptyDataset);
    }

    let mut overall = Tally::default();
    let mut arms: BTreeMap<String, Tally> = BTreeMap::new();

    for record in records {
        overall.add(record);
        arms.entry(record.arm.clone()).or_default().add(record);
    }

    let by_arm = arms
        .into_iter()
        .map(|(arm, tally)| {
            let summary = ArmSummary {
                users: tally.users,
                d1_retention: tally.rate(Horizon::Day1),
                d7_retention: tally.rate(Horizon::Day7),
            };
            (arm, summary)
        })
        .collect::<BTreeMap<_, _>>();

    debug!(
        total_users = overall.users,
        arms = by_arm.len(),
        "computed retention KPIs"
    );

    Ok(KpiSummary {
        total_users: overall.users,
        // every user in the experiment was active on the day they entered it
        daily_active_users: overall.users,
        overall_d1_retention: overall.rate(Horizon::Day1),
        overall_d7_retention: overall.rate(Horizon::Day7),
        by_arm,
    })
}

pub fn compute_ab_test(
    records: &[UserRecord],
    control: &str,
    treatment: &str,
    options: &TestOptions,
) -> Result<AbTestResult> {
    if records.is_empty() {
        return Err(AnalysisError::EmptyDataset);
    }
    if control == treatment {
        return Err(AnalysisError::IdenticalArms {
            label: control.to_string(),
        });
    }

    let mut a = Tally::default();
    let mut b = Tally::default();
    for record in records {
        if record.arm == control {
            a.add(record);
        } else if record.arm == treatment {
            b.add(record);
        }
    }

    if a.users == 0 && b.users == 0 {
        return Err(AnalysisError::UnknownArmLabel {
            control: control.to_string(),
            treatment: treatment.to_string(),
        });
    }
    if a.users == 0 || b.users == 0 {
        warn!(
            control,
            treatment,
            n_control = a.users,
            n_treatment = b.users,
            "one experiment arm has no users"
        );
    }

    let excluded = records.len() - a.users - b.users;
    if excluded > 0 {
        debug!(excluded, "records outside both arms were skipped");
    }

    Ok(AbTestResult {
        control: control.to_string(),
        treatment: treatment.to_string(),
        n_control: a.users,
        n_treatment: b.users,
        day1: compare_horizon(Horizon::Day1, &a, &b, options),
        day7: compare_horizon(Horizon::Day7, &a, &b, options),
    })
}

fn compare_horizon(horizon: Horizon, a: &Tally, b: &Tally, options: &TestOptions) -> HorizonResult {
    let rate_a = a.rate(horizon);
    let rate_b = b.rate(horizon);
    let diff = rate_b - rate_a;
    let lift_percent = if rate_a > 0.0 {
        diff / rate_a * 100.0
    } else {
        0.0
    };

    let se = (rate_a * (1.0 - rate_a) / a.users as f64
        + rate_b * (1.0 - rate_b) / b.users as f64)
        .sqrt();

    let table = ContingencyTable::from_tallies(a, b, horizon);
    let test = chi_square_test(&table, horizon, options);
    if let Err(err) = &test {
        debug!(%horizon, error = %err, "independence test unavailable");
    }

    HorizonResult {
        horizon,
        rate_a,
        rate_b,
        diff,
        lift_percent,
        ci_lower: diff - Z_95 * se,
        ci_upper: diff + Z_95 * se,
        test,
    }
}

/// Arm by outcome counts.
///
/// Rows are (control, treatment); columns are (not retained, retained).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContingencyTable {
    cells: [[u64; 2]; 2],
}

impl ContingencyTable {
    pub fn new(cells: [[u64; 2]; 2]) -> Self {
        Self { cells }
    }

    fn from_tallies(a: &Tally, b: &Tally, horizon: Horizon) -> Self {
        let row = |tally: &Tally| {
            let retained = tally.retained(horizon) as u64;
            [tally.users as u64 - retained, retained]
        };
        Self::new([row(a), row(b)])
    }

    pub fn row_total(&self, row: usize) -> u64 {
        self.cells[row].iter().sum()
    }

    pub fn column_total(&self, column: usize) -> u64 {
        self.cells.iter().map(|row| row[column]).sum()
    }

    pub fn total(&self) -> u64 {
        self.cells.iter().flatten().sum()
    }

    pub fn is_degenerate(&self) -> bool {
        (0..2).any(|i| self.row_total(i) == 0 || self.column_total(i) == 0)
    }

    pub fn expected(&self, row: usize, column: usize) -> f64 {
        self.row_total(row) as f64 * self.column_total(column) as f64 / self.total() as f64
    }
}

/// Pearson chi-square test of independence with one degree of freedom.
pub fn chi_square_test(
    table: &ContingencyTable,
    horizon: Horizon,
    options: &TestOptions,
) -> Result<ChiSquareTest> {
    if table.is_degenerate() {
        return Err(AnalysisError::InsufficientData { horizon });
    }

    let mut statistic = 0.0;
    let mut min_expected = f64::INFINITY;
    for (row, counts) in table.cells.iter().enumerate() {
        for (column, &observed) in counts.iter().enumerate() {
            let expected = table.expected(row, column);
            min_expected = min_expected.min(expected);

            let mut deviation = (observed as f64 - expected).abs();
            if options.continuity_correction {
                deviation -= deviation.min(0.5);
            }
            statistic += deviation.powi(2) / expected;
        }
    }

    if let Some(threshold) = options.min_expected_count {
        if min_expected < threshold {
            return Err(AnalysisError::LowExpectedCount {
                horizon,
                min_expected,
                threshold,
            });
        }
    }

    let distribution =
        ChiSquared::new(1.0).map_err(|err| AnalysisError::Distribution(err.to_string()))?;

    Ok(ChiSquareTest {
        statistic,
        p_value: distribution.sf(statistic),
        min_expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{generate_sample, SampleSpec};

    fn user(user_id: u64, arm: &str, day1: bool, day7: bool) -> UserRecord {
        UserRecord {
            user_id,
            arm: arm.to_string(),
            retained_day1: day1,
            retained_day7: day7,
        }
    }

    fn mixed_records() -> Vec<UserRecord> {
        vec![
            user(1, "gate_30", true, false),
            user(2, "gate_30", false, false),
            user(3, "gate_30", true, true),
            user(4, "gate_40", true, false),
            user(5, "gate_40", true, true),
            user(6, "gate_40", false, false),
            user(7, "gate_40", true, true),
        ]
    }

    fn ab_test(records: &[UserRecord]) -> Result<AbTestResult> {
        compute_ab_test(
            records,
            DEFAULT_CONTROL,
            DEFAULT_TREATMENT,
            &TestOptions::default(),
        )
    }

    #[test]
    fn kpis_summarize_overall_and_per_arm() {
        let kpis = compute_kpis(&mixed_records()).unwrap();

        assert_eq!(kpis.total_users, 7);
        assert_eq!(kpis.daily_active_users, 7);
        assert!((kpis.overall_d1_retention - 5.0 / 7.0).abs() < 1e-12);
        assert!((kpis.overall_d7_retention - 3.0 / 7.0).abs() < 1e-12);

        let control = &kpis.by_arm["gate_30"];
        assert_eq!(control.users, 3);
        assert!((control.d1_retention - 2.0 / 3.0).abs() < 1e-12);
        assert!((control.d7_retention - 1.0 / 3.0).abs() < 1e-12);

        let treatment = &kpis.by_arm["gate_40"];
        assert_eq!(treatment.users, 4);
        assert!((treatment.d1_retention - 0.75).abs() < 1e-12);
        assert!((treatment.d7_retention - 0.5).abs() < 1e-12);
    }

    #[test]
    fn kpi_rates_stay_within_unit_interval() {
        let spec = SampleSpec {
            n_users: 500,
            seed: 7,
            ..SampleSpec::default()
        };
        let kpis = compute_kpis(&generate_sample(&spec)).unwrap();

        assert!((0.0..=1.0).contains(&kpis.overall_d1_retention));
        assert!((0.0..=1.0).contains(&kpis.overall_d7_retention));
        let per_arm: usize = kpis.by_arm.values().map(|arm| arm.users).sum();
        assert_eq!(per_arm, kpis.total_users);
    }

    #[test]
    fn kpis_reject_empty_dataset() {
        assert_eq!(compute_kpis(&[]), Err(AnalysisError::EmptyDataset));
    }

    #[test]
    fn ab_test_reports_rates_diff_and_lift() {
        let records = vec![
            user(1, "gate_30", true, false),
            user(2, "gate_30", false, true),
            user(3, "gate_40", true, false),
            user(4, "gate_40", true, true),
        ];
        let result = ab_test(&records).unwrap();

        assert_eq!(result.n_control, 2);
        assert_eq!(result.n_treatment, 2);
        assert_eq!(result.day1.rate_a, 0.5);
        assert_eq!(result.day1.rate_b, 1.0);
        assert_eq!(result.day1.diff, 0.5);
        assert_eq!(result.day1.lift_percent, 100.0);

        let test = result.day1.test.unwrap();
        assert!((test.statistic - 4.0 / 3.0).abs() < 1e-12);
        assert!((test.p_value - 0.248_213_078_989_923_6).abs() < 1e-6);
    }

    #[test]
    fn zero_baseline_yields_zero_lift() {
        let records = vec![
            user(1, "gate_30", false, false),
            user(2, "gate_30", false, true),
            user(3, "gate_40", true, false),
            user(4, "gate_40", false, true),
        ];
        let result = ab_test(&records).unwrap();

        assert_eq!(result.day1.rate_a, 0.0);
        assert_eq!(result.day1.lift_percent, 0.0);
        assert_eq!(result.day1.diff, result.day1.rate_b);
    }

    #[test]
    fn degenerate_horizon_fails_alone() {
        let records = vec![
            user(1, "gate_30", true, false),
            user(2, "gate_30", false, false),
            user(3, "gate_40", true, false),
            user(4, "gate_40", true, false),
        ];
        let result = ab_test(&records).unwrap();

        assert!(result.day1.p_value().is_ok());
        assert_eq!(
            result.day7.p_value(),
            Err(AnalysisError::InsufficientData {
                horizon: Horizon::Day7
            })
        );
        assert!(!result.day7.is_significant(0.05));
        assert_eq!(result.day7.diff, 0.0);
    }

    #[test]
    fn diff_and_interval_are_consistent() {
        let result = ab_test(&mixed_records()).unwrap();

        for horizon in Horizon::ALL {
            let outcome = result.horizon(horizon);
            assert!((outcome.diff - (outcome.rate_b - outcome.rate_a)).abs() < 1e-9);

            let upper = outcome.ci_upper - outcome.diff;
            let lower = outcome.diff - outcome.ci_lower;
            assert!((upper - lower).abs() < 1e-9);
            assert!((upper - Z_95 * outcome.standard_error()).abs() < 1e-9);
        }

        let control_rate: f64 = 1.0 / 3.0;
        let treatment_rate: f64 = 0.5;
        let se = (control_rate * (1.0 - control_rate) / 3.0
            + treatment_rate * (1.0 - treatment_rate) / 4.0)
            .sqrt();
        assert!((result.day7.standard_error() - se).abs() < 1e-9);
    }

    #[test]
    fn repeated_runs_are_bit_identical() {
        let records = mixed_records();
        let first = ab_test(&records).unwrap();
        let second = ab_test(&records).unwrap();

        for horizon in Horizon::ALL {
            let (x, y) = (first.horizon(horizon), second.horizon(horizon));
            assert_eq!(x.diff.to_bits(), y.diff.to_bits());
            assert_eq!(x.lift_percent.to_bits(), y.lift_percent.to_bits());
            assert_eq!(x.ci_lower.to_bits(), y.ci_lower.to_bits());
            assert_eq!(x.ci_upper.to_bits(), y.ci_upper.to_bits());
            assert_eq!(
                x.p_value().unwrap().to_bits(),
                y.p_value().unwrap().to_bits()
            );
        }
        assert_eq!(first, second);
    }

    #[test]
    fn other_arms_are_excluded() {
        let mut records = mixed_records();
        records.push(user(8, "gate_50", true, true));
        records.push(user(9, "gate_50", true, true));

        let with_extra = ab_test(&records).unwrap();
        let without = ab_test(&mixed_records()).unwrap();
        assert_eq!(with_extra, without);

        let kpis = compute_kpis(&records).unwrap();
        assert_eq!(kpis.by_arm["gate_50"].users, 2);
    }

    #[test]
    fn unknown_labels_are_distinguished_from_one_empty_arm() {
        let records = mixed_records();

        let err = compute_ab_test(&records, "red", "blue", &TestOptions::default()).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::UnknownArmLabel {
                control: "red".to_string(),
                treatment: "blue".to_string(),
            }
        );

        let result =
            compute_ab_test(&records, DEFAULT_CONTROL, "blue", &TestOptions::default()).unwrap();
        assert_eq!(result.n_control, 3);
        assert_eq!(result.n_treatment, 0);
        assert!(result.day1.rate_b.is_nan());
        assert!(result.day1.diff.is_nan());
        assert!(result.day1.lift_percent.is_nan());
        assert_eq!(
            result.day1.p_value(),
            Err(AnalysisError::InsufficientData {
                horizon: Horizon::Day1
            })
        );

        let result =
            compute_ab_test(&records, "blue", DEFAULT_TREATMENT, &TestOptions::default()).unwrap();
        assert_eq!(result.n_control, 0);
        assert_eq!(result.n_treatment, 4);
        assert!(result.day7.rate_a.is_nan());
        assert!(result.day7.diff.is_nan());
        assert_eq!(result.day7.lift_percent, 0.0);
        assert!(!result.day7.is_significant(0.05));
    }

    #[test]
    fn identical_arm_labels_are_rejected() {
        let err = compute_ab_test(
            &mixed_records(),
            DEFAULT_CONTROL,
            DEFAULT_CONTROL,
            &TestOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            AnalysisError::IdenticalArms {
                label: DEFAULT_CONTROL.to_string(),
            }
        );
    }

    #[test]
    fn ab_test_rejects_empty_dataset() {
        assert_eq!(ab_test(&[]).unwrap_err(), AnalysisError::EmptyDataset);
    }

    #[test]
    fn chi_square_matches_reference_values() {
        let table = ContingencyTable::new([[10, 20], [30, 40]]);
        assert_eq!(table.total(), 100);
        assert_eq!(table.row_total(1), 70);
        assert_eq!(table.column_total(0), 40);

        let plain = chi_square_test(&table, Horizon::Day1, &TestOptions::default()).unwrap();
        assert!((plain.statistic - 0.793_650_793_650_793_6).abs() < 1e-9);
        assert!((plain.p_value - 0.372_998_483_613_487_1).abs() < 1e-6);
        assert!((plain.min_expected - 12.0).abs() < 1e-12);

        let options = TestOptions {
            continuity_correction: true,
            ..TestOptions::default()
        };
        let corrected = chi_square_test(&table, Horizon::Day1, &options).unwrap();
        assert!((corrected.statistic - 0.446_428_571_428_571_4).abs() < 1e-9);
        assert!((corrected.p_value - 0.504_035_866_452_504_8).abs() < 1e-6);
    }

    #[test]
    fn balanced_table_has_unit_p_value() {
        let table = ContingencyTable::new([[5, 5], [5, 5]]);
        let test = chi_square_test(&table, Horizon::Day7, &TestOptions::default()).unwrap();
        assert_eq!(test.statistic, 0.0);
        assert!((test.p_value - 1.0).abs() < 1e-12);
    }

    #[test]
    fn low_expected_counts_flagged_only_when_requested() {
        let table = ContingencyTable::new([[1, 1], [0, 2]]);
        assert!(chi_square_test(&table, Horizon::Day1, &TestOptions::default()).is_ok());

        let options = TestOptions {
            min_expected_count: Some(5.0),
            ..TestOptions::default()
        };
        match chi_square_test(&table, Horizon::Day1, &options) {
            Err(AnalysisError::LowExpectedCount {
                horizon,
                min_expected,
                threshold,
            }) => {
                assert_eq!(horizon, Horizon::Day1);
                assert!((min_expected - 0.5).abs() < 1e-12);
                assert_eq!(threshold, 5.0);
            }
            other => panic!("expected LowExpectedCount, got {other:?}"),
        }
    }

    #[test]
    fn degenerate_tables_are_rejected() {
        let empty_column = ContingencyTable::new([[3, 0], [4, 0]]);
        let empty_row = ContingencyTable::new([[3, 2], [0, 0]]);
        assert!(empty_column.is_degenerate());
        assert!(empty_row.is_degenerate());
        assert_eq!(
            chi_square_test(&empty_row, Horizon::Day1, &TestOptions::default()),
            Err(AnalysisError::InsufficientData {
                horizon: Horizon::Day1
            })
        );
    }

    #[test]
    fn synthetic_experiment_recovers_generating_rates() {
        let spec = SampleSpec::default();
        let records = generate_sample(&spec);
        assert_eq!(records.len(), 90_189);

        let result = ab_test(&records).unwrap();
        assert_eq!(result.n_control, 45_094);
        assert_eq!(result.n_treatment, 45_095);

        // four standard errors keeps a fixed seed far from the tails
        let within = |observed: f64, p: f64, n: usize| {
            let se = (p * (1.0 - p) / n as f64).sqrt();
            (observed - p).abs() < 4.0 * se
        };
        let (control, treatment) = (&spec.control, &spec.treatment);
        assert!(within(result.day1.rate_a, control.day1, result.n_control));
        assert!(within(result.day7.rate_a, control.day7, result.n_control));
        assert!(within(result.day1.rate_b, treatment.day1, result.n_treatment));
        assert!(within(result.day7.rate_b, treatment.day7, result.n_treatment));

        let true_diff = treatment.day1 - control.day1;
        let se = result.day1.standard_error();
        assert!((result.day1.diff - true_diff).abs() < 4.0 * se);
        assert!(result.day1.p_value().unwrap() < 1e-3);
    }
}
