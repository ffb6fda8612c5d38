use anyhow::{Context, Result};
use csv::Writer;
use serde::Serialize;
use std::path::Path;

use crate::common::{ensure_parent_dir, finish_tmp, tmp_path_for};
use crate::linkage::AttachOutcome;

#[derive(Debug, Serialize)]
struct MatchReportRow<'a> {
    step: &'a str,
    join_keys: String,
    policy: String,
    window: String,
    cases_total: i64,
    cases_matched: i64,
    cases_unmatched: i64,
    cases_ambiguous: i64,
    candidate_rows: i64,
}

impl<'a> From<&'a AttachOutcome> for MatchReportRow<'a> {
    fn from(outcome: &'a AttachOutcome) -> Self {
        Self {
            step: &outcome.step,
            join_keys: outcome.join_keys.join(";"),
            policy: outcome.policy.to_string(),
            window: outcome.window.map(|w| w.to_string()).unwrap_or_default(),
            cases_total: outcome.cases_total,
            cases_matched: outcome.cases_matched,
            cases_unmatched: outcome.cases_total - outcome.cases_matched,
            cases_ambiguous: outcome.cases_ambiguous,
            candidate_rows: outcome.candidate_rows,
        }
    }
}

/// Writes one CSV row per attach step.
pub fn write_match_report(output_csv: &Path, outcomes: &[AttachOutcome]) -> Result<()> {
    ensure_parent_dir(output_csv)?;
    let tmp_path = tmp_path_for(output_csv);

    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating match report {}", tmp_path.display()))?;
    for outcome in outcomes {
        writer
            .serialize(MatchReportRow::from(outcome))
            .with_context(|| format!("Failed writing match report row for {}", outcome.step))?;
    }
    writer
        .flush()
        .context("Failed flushing match report writer")?;
    drop(writer);
    finish_tmp(&tmp_path, output_csv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linkage::{DateWindow, MatchPolicy};
    use std::fs;

    #[test]
    fn report_has_one_row_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let outcomes = vec![
            AttachOutcome {
                step: "op".to_string(),
                join_keys: vec!["fake_id".to_string()],
                policy: MatchPolicy::First,
                window: None,
                cases_total: 3,
                cases_matched: 3,
                cases_ambiguous: 0,
                candidate_rows: 3,
            },
            AttachOutcome {
                step: "prom_after".to_string(),
                join_keys: vec!["Age".to_string(), "fake_id".to_string()],
                policy: MatchPolicy::Nearest { target_days: 365 },
                window: Some(DateWindow::around(365, 180).unwrap()),
                cases_total: 3,
                cases_matched: 2,
                cases_ambiguous: 1,
                candidate_rows: 4,
            },
        ];
        write_match_report(&path, &outcomes).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "step,join_keys,policy,window,cases_total,cases_matched,cases_unmatched,cases_ambiguous,candidate_rows",
                "op,fake_id,first,,3,3,0,0,3",
                "prom_after,Age;fake_id,nearest(+365d),\"[+185d, +545d]\",3,2,1,1,4",
            ]
        );
    }
}
