//! The linkage run, one named DuckDB table per step:
//!
//! `src_*` (raw inputs) -> `case_base` -> `with_op` -> `with_prom_before`
//! -> `with_prom_after` -> exported table.

use anyhow::{Context, Result, ensure};
use duckdb::Connection;
use std::{fs, path::PathBuf};
use tracing::{info, warn};

use crate::args::{Args, FeatherCompression, OpPolicyArg, PolicyArg};
use crate::audit::{log_dims, log_non_null_counts, print_columns};
use crate::columns::{aux_projection, case_only_columns};
use crate::common::{load_column_names, quote_ident, sql_escape_path};
use crate::constants::{CASES_FILE, OP_FILE, OUTPUT_STEM, PROM_AFTER_FILE, PROM_BEFORE_FILE};
use crate::feather::{Table, read_parquet, write_feather};
use crate::linkage::{
    AttachOutcome, AttachStep, CASE_ROW_COLUMN, DateWindow, MatchPolicy, WindowSpec, attach,
    prepare_aux, projection_with_dates,
};
use crate::report::write_match_report;
use crate::sources::{Source, load_source};
use crate::xlsx::write_xlsx;

#[derive(Debug, Clone)]
pub struct InputPaths {
    pub cases: PathBuf,
    pub op: PathBuf,
    pub prom_before: PathBuf,
    pub prom_after: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub xlsx: PathBuf,
    pub feather: PathBuf,
    pub match_report: PathBuf,
    pub staging_dir: PathBuf,
}

impl OutputPaths {
    pub fn in_dir(output_dir: &std::path::Path) -> Self {
        Self {
            xlsx: output_dir.join(format!("{OUTPUT_STEM}.xlsx")),
            feather: output_dir.join(format!("{OUTPUT_STEM}.feather")),
            match_report: output_dir.join(format!("{OUTPUT_STEM}.match_report.csv")),
            staging_dir: output_dir.join(".staging"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkageConfig {
    pub inputs: InputPaths,
    pub outputs: OutputPaths,
    pub key_column: String,
    pub anchor_column: String,
    pub pre_date_column: String,
    pub post_date_column: String,
    pub pre_window: DateWindow,
    pub pre_policy: MatchPolicy,
    pub post_window: DateWindow,
    pub post_policy: MatchPolicy,
    pub op_policy: MatchPolicy,
    pub feather_compression: FeatherCompression,
    pub write_xlsx: bool,
    pub keep_staging: bool,
}

fn policy_from_arg(arg: PolicyArg, target_days: i64) -> MatchPolicy {
    match arg {
        PolicyArg::Nearest => MatchPolicy::Nearest { target_days },
        PolicyArg::First => MatchPolicy::First,
        PolicyArg::Unique => MatchPolicy::Unique,
    }
}

impl TryFrom<&Args> for LinkageConfig {
    type Error = anyhow::Error;

    fn try_from(args: &Args) -> Result<Self> {
        let data_dir = &args.data_dir;
        let inputs = InputPaths {
            cases: args
                .cases_path
                .clone()
                .unwrap_or_else(|| data_dir.join(CASES_FILE)),
            op: args.op_path.clone().unwrap_or_else(|| data_dir.join(OP_FILE)),
            prom_before: args
                .prom_before_path
                .clone()
                .unwrap_or_else(|| data_dir.join(PROM_BEFORE_FILE)),
            prom_after: args
                .prom_after_path
                .clone()
                .unwrap_or_else(|| data_dir.join(PROM_AFTER_FILE)),
        };

        Ok(Self {
            inputs,
            outputs: OutputPaths::in_dir(&args.output_dir),
            key_column: args.key_column.clone(),
            anchor_column: args.anchor_column.clone(),
            pre_date_column: args.pre_date_column.clone(),
            post_date_column: args.post_date_column.clone(),
            pre_window: DateWindow::new(args.pre_window_start_days, args.pre_window_end_days)
                .context("Invalid pre-period window")?,
            pre_policy: policy_from_arg(args.pre_policy, args.pre_target_days),
            post_window: DateWindow::around(args.post_target_days, args.post_tolerance_days)
                .context("Invalid post-period window")?,
            post_policy: policy_from_arg(args.post_policy, args.post_target_days),
            op_policy: match args.op_policy {
                OpPolicyArg::First => MatchPolicy::First,
                OpPolicyArg::Unique => MatchPolicy::Unique,
            },
            feather_compression: args.feather_compression,
            write_xlsx: !args.skip_xlsx,
            keep_staging: args.keep_staging,
        })
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub case_rows: i64,
    pub outcomes: Vec<AttachOutcome>,
    pub table: Table,
}

struct LoadedInputs {
    cases: Source,
    op: Source,
    prom_before: Source,
    prom_after: Source,
}

fn sources(config: &LinkageConfig) -> LoadedInputs {
    LoadedInputs {
        cases: Source::new("cases", config.inputs.cases.clone()),
        op: Source::new("op", config.inputs.op.clone()),
        prom_before: Source::new("prom_before", config.inputs.prom_before.clone()),
        prom_after: Source::new("prom_after", config.inputs.prom_after.clone()),
    }
}

fn load_inputs(conn: &Connection, config: &LinkageConfig) -> Result<(LoadedInputs, i64)> {
    let inputs = sources(config);
    let staging_dir = &config.outputs.staging_dir;

    let case_rows = load_source(conn, &inputs.cases, staging_dir)?;
    ensure!(
        case_rows > 0,
        "Case table {} has no rows",
        inputs.cases.path.display()
    );
    for source in [&inputs.op, &inputs.prom_before, &inputs.prom_after] {
        if load_source(conn, source, staging_dir)? == 0 {
            warn!(
                "{} table {} has no rows; its columns will be empty",
                source.label,
                source.path.display()
            );
        }
    }
    Ok((inputs, case_rows))
}

fn require_column(columns: &[String], column: &str, source: &Source) -> Result<()> {
    ensure!(
        columns.iter().any(|c| c == column),
        "Column {column} missing from {} table {}",
        source.label,
        source.path.display()
    );
    Ok(())
}

fn remove_staging(config: &LinkageConfig) {
    let dir = &config.outputs.staging_dir;
    if config.keep_staging || !dir.exists() {
        return;
    }
    if let Err(err) = fs::remove_dir_all(dir) {
        warn!("Failed removing staging directory {}: {err}", dir.display());
    }
}

/// Prints the columns of every input table.
pub fn list_columns(config: &LinkageConfig) -> Result<()> {
    let conn = Connection::open_in_memory().context("Failed opening DuckDB")?;
    let result = load_inputs(&conn, config).and_then(|(inputs, _)| {
        print_columns(
            &conn,
            &[
                (inputs.cases.label, inputs.cases.table.as_str()),
                (inputs.op.label, inputs.op.table.as_str()),
                (inputs.prom_before.label, inputs.prom_before.table.as_str()),
                (inputs.prom_after.label, inputs.prom_after.table.as_str()),
            ],
        )
    });
    remove_staging(config);
    result
}

/// Links the inputs and returns the extended case table without writing it.
pub fn link(conn: &Connection, config: &LinkageConfig) -> Result<RunSummary> {
    let key = config.key_column.as_str();
    let anchor = config.anchor_column.as_str();
    let pre_date = config.pre_date_column.as_str();
    let post_date = config.post_date_column.as_str();

    let (inputs, case_rows) = load_inputs(conn, config)?;

    let case_columns = load_column_names(conn, &inputs.cases.table)?;
    let op_columns = load_column_names(conn, &inputs.op.table)?;
    let before_columns = load_column_names(conn, &inputs.prom_before.table)?;
    let after_columns = load_column_names(conn, &inputs.prom_after.table)?;

    require_column(&case_columns, key, &inputs.cases)?;
    require_column(&op_columns, key, &inputs.op)?;
    require_column(&before_columns, key, &inputs.prom_before)?;
    require_column(&after_columns, key, &inputs.prom_after)?;
    require_column(&before_columns, pre_date, &inputs.prom_before)?;
    require_column(&after_columns, post_date, &inputs.prom_after)?;

    let case_keep = case_only_columns(
        &case_columns,
        &[
            op_columns.as_slice(),
            before_columns.as_slice(),
            after_columns.as_slice(),
        ],
        key,
    );
    let op_keep = aux_projection(&case_columns, &op_columns, &[key, anchor]);
    let before_keep = aux_projection(&case_columns, &before_columns, &[key, pre_date]);
    let after_keep = aux_projection(&case_columns, &after_columns, &[key, post_date]);
    info!(
        "Columns kept: cases={} op={} prom_before={} prom_after={}",
        case_keep.len(),
        op_keep.len(),
        before_keep.len(),
        after_keep.len()
    );

    let case_select =
        projection_with_dates(conn, &inputs.cases.table, &case_keep, &[anchor])?.join(", ");
    conn.execute_batch(&format!(
        "CREATE OR REPLACE TABLE case_base AS
         SELECT ROW_NUMBER() OVER () - 1 AS {case_row}, {case_select}
         FROM {source}",
        case_row = quote_ident(CASE_ROW_COLUMN),
        source = quote_ident(&inputs.cases.table),
    ))
    .context("Failed creating case_base")?;
    log_dims(conn, "case_base")?;

    prepare_aux(conn, &inputs.op.table, &op_keep, &[anchor], "aux_op")?;
    prepare_aux(
        conn,
        &inputs.prom_before.table,
        &before_keep,
        &[pre_date],
        "aux_prom_before",
    )?;
    prepare_aux(
        conn,
        &inputs.prom_after.table,
        &after_keep,
        &[post_date],
        "aux_prom_after",
    )?;

    let steps = [
        AttachStep {
            name: "op".to_string(),
            table: "aux_op".to_string(),
            id_column: key.to_string(),
            window: None,
            policy: config.op_policy,
        },
        AttachStep {
            name: "prom_before".to_string(),
            table: "aux_prom_before".to_string(),
            id_column: key.to_string(),
            window: Some(WindowSpec {
                anchor_column: anchor.to_string(),
                date_column: pre_date.to_string(),
                bounds: config.pre_window,
            }),
            policy: config.pre_policy,
        },
        AttachStep {
            name: "prom_after".to_string(),
            table: "aux_prom_after".to_string(),
            id_column: key.to_string(),
            window: Some(WindowSpec {
                anchor_column: anchor.to_string(),
                date_column: post_date.to_string(),
                bounds: config.post_window,
            }),
            policy: config.post_policy,
        },
    ];

    let mut outcomes = Vec::with_capacity(steps.len());
    let mut base = "case_base".to_string();
    for step in &steps {
        let output = format!("with_{}", step.name);
        let outcome = attach(conn, &base, step, &output)?;
        info!(
            step = %outcome.step,
            keys = %outcome.join_keys.join(","),
            policy = %outcome.policy,
            "Matched {} of {} cases ({} with several candidates, {} candidate rows)",
            outcome.cases_matched,
            outcome.cases_total,
            outcome.cases_ambiguous,
            outcome.candidate_rows
        );
        log_dims(conn, &output)?;
        if step.window.is_some() {
            log_non_null_counts(conn, &output, &[key, anchor, pre_date, post_date])?;
        }
        outcomes.push(outcome);
        base = output;
    }

    fs::create_dir_all(&config.outputs.staging_dir).with_context(|| {
        format!(
            "Failed creating {}",
            config.outputs.staging_dir.display()
        )
    })?;
    let staged_output = config.outputs.staging_dir.join("extended_case_data.parquet");
    conn.execute_batch(&format!(
        "COPY (
            SELECT * EXCLUDE ({case_row}) FROM {base} ORDER BY {case_row}
         ) TO '{path}' (FORMAT PARQUET)",
        case_row = quote_ident(CASE_ROW_COLUMN),
        base = quote_ident(&base),
        path = sql_escape_path(&staged_output),
    ))
    .context("Failed exporting the extended case table")?;

    let table = read_parquet(&staged_output)?;
    ensure!(
        table.num_rows() as i64 == case_rows,
        "Extended case table has {} rows, expected one per case ({case_rows})",
        table.num_rows()
    );

    Ok(RunSummary {
        case_rows,
        outcomes,
        table,
    })
}

/// Runs the linkage and writes every export.
pub fn run(config: &LinkageConfig) -> Result<RunSummary> {
    let conn = Connection::open_in_memory().context("Failed opening DuckDB")?;
    let result = link(&conn, config).and_then(|summary| {
        write_outputs(config, &summary)?;
        Ok(summary)
    });
    remove_staging(config);
    result
}

fn write_outputs(config: &LinkageConfig, summary: &RunSummary) -> Result<()> {
    let outputs = &config.outputs;

    write_feather(&outputs.feather, &summary.table, config.feather_compression)?;
    info!("Wrote {}", outputs.feather.display());

    if config.write_xlsx {
        write_xlsx(&outputs.xlsx, &summary.table, OUTPUT_STEM)?;
        info!("Wrote {}", outputs.xlsx.display());
    }

    write_match_report(&outputs.match_report, &summary.outcomes)?;
    info!("Wrote match report {}", outputs.match_report.display());
    Ok(())
}
