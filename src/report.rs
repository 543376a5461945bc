use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::data::DataSource;
use crate::models::{AbTestResult, Horizon, HorizonResult, KpiSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improvement,
    Decrease,
    NoDifference,
}

pub fn classify(outcome: &HorizonResult, alpha: f64) -> Verdict {
    if !outcome.is_significant(alpha) {
        Verdict::NoDifference
    } else if outcome.diff > 0.0 {
        Verdict::Improvement
    } else {
        Verdict::Decrease
    }
}

fn percent(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}

fn write_horizon(output: &mut String, result: &AbTestResult, outcome: &HorizonResult, alpha: f64) {
    let _ = writeln!(output, "## {} Retention", outcome.horizon);
    let _ = writeln!(
        output,
        "- {}: {} ({} users)",
        result.control,
        percent(outcome.rate_a),
        result.n_control
    );
    let _ = writeln!(
        output,
        "- {}: {} ({} users)",
        result.treatment,
        percent(outcome.rate_b),
        result.n_treatment
    );
    let _ = writeln!(
        output,
        "- Difference: {:+.2} pp ({:+.1}% lift)",
        outcome.diff * 100.0,
        outcome.lift_percent
    );
    let _ = writeln!(
        output,
        "- 95% CI: [{}, {}] (standard error {:.2} pp)",
        percent(outcome.ci_lower),
        percent(outcome.ci_upper),
        outcome.standard_error() * 100.0
    );

    match &outcome.test {
        Ok(test) => {
            let _ = writeln!(output, "- P-value: {:.4}", test.p_value);
            if test.p_value < alpha {
                let _ = writeln!(output, "- Statistically significant (p < {alpha})");
            } else {
                let _ = writeln!(output, "- Not statistically significant (p >= {alpha})");
            }
        }
        Err(err) => {
            let _ = writeln!(output, "- Insufficient data to compute significance: {err}");
        }
    }
    let _ = writeln!(output);
}

fn finding(result: &AbTestResult, horizon: Horizon, alpha: f64) -> String {
    let outcome = result.horizon(horizon);
    match classify(outcome, alpha) {
        Verdict::Improvement => format!(
            "{horizon} retention: {} shows a statistically significant improvement of {:.1}% over {}",
            result.treatment, outcome.lift_percent, result.control
        ),
        Verdict::Decrease => format!(
            "{horizon} retention: {} shows a statistically significant decrease of {:.1}% compared to {}",
            result.treatment,
            outcome.lift_percent.abs(),
            result.control
        ),
        Verdict::NoDifference => {
            format!("{horizon} retention: no statistically significant difference between groups")
        }
    }
}

pub fn build_report(
    source: &DataSource,
    generated_at: DateTime<Utc>,
    kpis: &KpiSummary,
    result: &AbTestResult,
    alpha: f64,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Retention Experiment Report");
    let _ = writeln!(
        output,
        "Generated {} from {}",
        generated_at.format("%Y-%m-%d %H:%M UTC"),
        source
    );
    let _ = writeln!(output);

    let _ = writeln!(output, "## Key Performance Indicators");
    let _ = writeln!(output, "- Total users: {}", kpis.total_users);
    let _ = writeln!(output, "- Daily active users: {}", kpis.daily_active_users);
    let _ = writeln!(output, "- Day 1 retention: {}", percent(kpis.overall_d1_retention));
    let _ = writeln!(output, "- Day 7 retention: {}", percent(kpis.overall_d7_retention));
    let _ = writeln!(output);
    let _ = writeln!(output, "| Arm | Users | Day 1 | Day 7 |");
    let _ = writeln!(output, "|-----|------:|------:|------:|");
    for (arm, summary) in &kpis.by_arm {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} |",
            arm,
            summary.users,
            percent(summary.d1_retention),
            percent(summary.d7_retention)
        );
    }
    let _ = writeln!(output);

    for horizon in Horizon::ALL {
        write_horizon(&mut output, result, result.horizon(horizon), alpha);
    }

    let _ = writeln!(output, "## Key Findings");
    for horizon in Horizon::ALL {
        let _ = writeln!(output, "- {}", finding(result, horizon, alpha));
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Business Impact");
    let verdict = classify(&result.day7, alpha);
    match verdict {
        Verdict::Improvement => {
            let additional = result.day7.diff * result.n_treatment as f64;
            let _ = writeln!(
                output,
                "- Switching to {} could retain an additional {:.0} players per cohort",
                result.treatment, additional
            );
            let _ = writeln!(
                output,
                "- This is a {:.1}% improvement in long-term engagement",
                result.day7.lift_percent
            );
        }
        Verdict::Decrease => {
            let _ = writeln!(
                output,
                "- Switching to {} would leave fewer players retained after a week",
                result.treatment
            );
        }
        Verdict::NoDifference => {
            let _ = writeln!(output, "- The experiment shows no clear winner");
            let _ = writeln!(
                output,
                "- Consider running a longer experiment or testing alternative hypotheses"
            );
        }
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Recommendation");
    let recommendation = match verdict {
        Verdict::Improvement => format!("RECOMMEND: roll out {} to all players", result.treatment),
        Verdict::Decrease => format!("DO NOT ROLL OUT: keep {}", result.control),
        Verdict::NoDifference => "INCONCLUSIVE: continue testing or explore alternatives".to_string(),
    };
    let _ = writeln!(output, "{recommendation}");

    output
}
