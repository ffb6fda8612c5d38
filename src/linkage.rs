//! Date-window ("non-equi") joins between the running case table and a
//! background table.
//!
//! Every background table goes through the same [`attach`] step: equality join on
//! the columns both tables share, an optional window filter around the anchor date,
//! then one winner per case row chosen by a [`MatchPolicy`]. Unmatched cases keep
//! nulls in the attached columns, so the output always has one row per input row.

use anyhow::{Context, Result, bail, ensure};
use duckdb::Connection;
use std::fmt;
use tracing::{debug, warn};

use crate::columns::shared_keys;
use crate::common::{count_rows, load_column_names, load_column_types, quote_ident};

/// Row number of a case in the case table; carried through every step.
pub const CASE_ROW_COLUMN: &str = "_case_row";
/// Source row number of a background row, after exact duplicates are removed.
pub const AUX_ROW_COLUMN: &str = "_aux_row";

const MATCH_RANK_COLUMN: &str = "_match_rank";
const MATCH_COUNT_COLUMN: &str = "_match_count";
const AMBIGUOUS_SAMPLE_SIZE: usize = 5;

/// Inclusive range of day offsets from the anchor date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start_days: i64,
    pub end_days: i64,
}

impl DateWindow {
    pub fn new(start_days: i64, end_days: i64) -> Result<Self> {
        ensure!(
            start_days <= end_days,
            "Window start ({start_days} days) is after window end ({end_days} days)"
        );
        Ok(Self {
            start_days,
            end_days,
        })
    }

    /// `target` days after the anchor, give or take `tolerance` days.
    pub fn around(target_days: i64, tolerance_days: i64) -> Result<Self> {
        ensure!(
            tolerance_days >= 0,
            "Window tolerance must not be negative, got {tolerance_days} days"
        );
        let (Some(start_days), Some(end_days)) = (
            target_days.checked_sub(tolerance_days),
            target_days.checked_add(tolerance_days),
        ) else {
            bail!("Window {target_days} ± {tolerance_days} days is out of range");
        };
        Self::new(start_days, end_days)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:+}d, {:+}d]", self.start_days, self.end_days)
    }
}

/// Which candidate a case keeps when several background rows match it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Smallest `|anchor + target_days - date|`; ties go to the earlier date, then
    /// to source row order.
    Nearest { target_days: i64 },
    /// First candidate in source row order.
    First,
    /// More than one candidate is an error.
    Unique,
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::Nearest { target_days } => write!(f, "nearest({target_days:+}d)"),
            MatchPolicy::First => f.write_str("first"),
            MatchPolicy::Unique => f.write_str("unique"),
        }
    }
}

/// Date range predicate of a windowed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    /// Anchor date column of the running table.
    pub anchor_column: String,
    /// Reference date column of the background table.
    pub date_column: String,
    pub bounds: DateWindow,
}

#[derive(Debug, Clone)]
pub struct AttachStep {
    pub name: String,
    /// Prepared background table, see [`prepare_aux`].
    pub table: String,
    /// Identifier column; must be among the join keys.
    pub id_column: String,
    pub window: Option<WindowSpec>,
    pub policy: MatchPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    pub step: String,
    pub join_keys: Vec<String>,
    pub policy: MatchPolicy,
    pub window: Option<DateWindow>,
    pub cases_total: i64,
    pub cases_matched: i64,
    pub cases_ambiguous: i64,
    pub candidate_rows: i64,
}

/// SQL expression converting a column of the given DuckDB type to DATE.
///
/// Strings are parsed as ISO dates or timestamps first, then with a few common
/// day-first and month-first layouts. Unparseable values become NULL.
pub fn coerce_date_expr(column: &str, duck_type: &str) -> Result<String> {
    let ident = quote_ident(column);
    let upper = duck_type.to_ascii_uppercase();
    let expr = match upper.as_str() {
        "DATE" => ident,
        t if t.starts_with("TIMESTAMP") => format!("CAST({ident} AS DATE)"),
        "VARCHAR" => format!(
            "COALESCE(\
                TRY_CAST({ident} AS DATE), \
                TRY_CAST(TRY_CAST({ident} AS TIMESTAMP) AS DATE), \
                TRY_STRPTIME({ident}, '%Y%m%d')::DATE, \
                TRY_STRPTIME({ident}, '%d.%m.%Y')::DATE, \
                TRY_STRPTIME({ident}, '%m/%d/%Y')::DATE\
            )"
        ),
        "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "UTINYINT" | "USMALLINT"
        | "UINTEGER" | "UBIGINT" => {
            format!("TRY_STRPTIME(CAST({ident} AS VARCHAR), '%Y%m%d')::DATE")
        }
        _ => bail!("Column {column} has type {duck_type}, which cannot be read as a date"),
    };
    Ok(expr)
}

/// Builds the projection list of `table`, converting `date_columns` to DATE.
pub fn projection_with_dates(
    conn: &Connection,
    table: &str,
    columns: &[String],
    date_columns: &[&str],
) -> Result<Vec<String>> {
    let types = load_column_types(conn, table)?;
    columns
        .iter()
        .map(|name| {
            let duck_type = types
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t.as_str())
                .with_context(|| format!("Column {name} not found in table {table}"))?;
            if date_columns.contains(&name.as_str()) {
                Ok(format!(
                    "{} AS {}",
                    coerce_date_expr(name, duck_type)?,
                    quote_ident(name)
                ))
            } else {
                Ok(quote_ident(name))
            }
        })
        .collect()
}

/// Projects a raw background table, converts its date columns, numbers its rows
/// in source order and drops exact duplicate rows (first occurrence wins).
pub fn prepare_aux(
    conn: &Connection,
    source: &str,
    columns: &[String],
    date_columns: &[&str],
    output: &str,
) -> Result<()> {
    ensure!(!columns.is_empty(), "No columns selected from {source}");
    let select_list = projection_with_dates(conn, source, columns, date_columns)?.join(", ");
    let partition = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let aux_row = quote_ident(AUX_ROW_COLUMN);

    let sql = format!(
        "
        CREATE OR REPLACE TABLE {output_ident} AS
        WITH numbered AS (
            SELECT ROW_NUMBER() OVER () AS {aux_row}, {select_list}
            FROM {source_ident}
        )
        SELECT *
        FROM numbered
        QUALIFY ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {aux_row}) = 1
        ORDER BY {aux_row}
        ",
        output_ident = quote_ident(output),
        source_ident = quote_ident(source),
    );
    conn.execute_batch(&sql)
        .with_context(|| format!("Failed preparing background table {output} from {source}"))?;
    Ok(())
}

fn ranking_order(step: &AttachStep) -> Result<String> {
    let aux_row = format!("aux.{}", quote_ident(AUX_ROW_COLUMN));
    match (step.policy, &step.window) {
        (MatchPolicy::Nearest { target_days }, Some(window)) => {
            let anchor = format!("base.{}", quote_ident(&window.anchor_column));
            let date = format!("aux.{}", quote_ident(&window.date_column));
            Ok(format!(
                "ABS(DATE_DIFF('day', {anchor} + ({target_days}), {date})), {date}, {aux_row}"
            ))
        }
        (MatchPolicy::Nearest { .. }, None) => bail!(
            "Step {} uses the nearest-date policy but has no date window",
            step.name
        ),
        (MatchPolicy::First | MatchPolicy::Unique, _) => Ok(aux_row),
    }
}

fn window_predicate(window: Option<&WindowSpec>) -> String {
    match window {
        Some(window) => {
            let anchor = format!("base.{}", quote_ident(&window.anchor_column));
            let date = format!("aux.{}", quote_ident(&window.date_column));
            format!(
                "{date} BETWEEN {anchor} + ({start}) AND {anchor} + ({end})",
                start = window.bounds.start_days,
                end = window.bounds.end_days,
            )
        }
        None => "TRUE".to_string(),
    }
}

fn ambiguous_sample(conn: &Connection, candidates: &str, id_column: &str) -> Result<Vec<String>> {
    let query = format!(
        "SELECT DISTINCT CAST({id} AS VARCHAR) AS id FROM {table} WHERE {count} > 1 ORDER BY id LIMIT {AMBIGUOUS_SAMPLE_SIZE}",
        id = quote_ident(id_column),
        table = quote_ident(candidates),
        count = quote_ident(MATCH_COUNT_COLUMN),
    );
    let mut stmt = conn
        .prepare(&query)
        .context("Failed preparing ambiguous case query")?;
    let mut rows = stmt.query([]).context("Failed querying ambiguous cases")?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next().context("Failed iterating ambiguous cases")? {
        let id: Option<String> = row.get(0).context("Failed reading ambiguous case id")?;
        ids.push(id.unwrap_or_else(|| "NULL".to_string()));
    }
    Ok(ids)
}

/// Attaches the best matching row of `step.table` to every row of `base`,
/// creating `output`.
///
/// `base` must carry [`CASE_ROW_COLUMN`] and `step.table` must come from
/// [`prepare_aux`]. The join keys are all columns the two tables share.
pub fn attach(
    conn: &Connection,
    base: &str,
    step: &AttachStep,
    output: &str,
) -> Result<AttachOutcome> {
    let base_columns = load_column_names(conn, base)?;
    let aux_columns = load_column_names(conn, &step.table)?;

    ensure!(
        base_columns.iter().any(|c| c == CASE_ROW_COLUMN),
        "Table {base} has no {CASE_ROW_COLUMN} column"
    );
    ensure!(
        aux_columns.iter().any(|c| c == AUX_ROW_COLUMN),
        "Table {} has no {AUX_ROW_COLUMN} column; prepare it first",
        step.table
    );

    let aux_data_columns: Vec<String> = aux_columns
        .iter()
        .filter(|c| c.as_str() != AUX_ROW_COLUMN)
        .cloned()
        .collect();
    let join_keys = shared_keys(&base_columns, &aux_data_columns);
    ensure!(
        join_keys.iter().any(|k| k == &step.id_column),
        "Step {}: key column {} is not shared by {base} and {} (shared: {:?})",
        step.name,
        step.id_column,
        step.table,
        join_keys
    );

    if let Some(window) = &step.window {
        ensure!(
            base_columns.iter().any(|c| c == &window.anchor_column),
            "Step {}: anchor column {} not found in {base}",
            step.name,
            window.anchor_column
        );
        ensure!(
            aux_columns.iter().any(|c| c == &window.date_column),
            "Step {}: date column {} not found in {}",
            step.name,
            window.date_column,
            step.table
        );
        ensure!(
            !join_keys.contains(&window.date_column),
            "Step {}: date column {} is present in {base} and would become a join key",
            step.name,
            window.date_column
        );
    }

    let order = ranking_order(step)?;
    let predicate = window_predicate(step.window.as_ref());
    let key_condition = join_keys
        .iter()
        .map(|k| {
            let ident = quote_ident(k);
            format!("base.{ident} IS NOT DISTINCT FROM aux.{ident}")
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    let payload: Vec<String> = aux_data_columns
        .iter()
        .filter(|c| !join_keys.contains(c))
        .cloned()
        .collect();

    let candidates = format!("{output}__candidates");
    let candidates_ident = quote_ident(&candidates);
    let case_row = quote_ident(CASE_ROW_COLUMN);
    let rank = quote_ident(MATCH_RANK_COLUMN);
    let count = quote_ident(MATCH_COUNT_COLUMN);

    let candidates_sql = format!(
        "
        CREATE OR REPLACE TABLE {candidates_ident} AS
        SELECT
            base.{case_row} AS {case_row},
            aux.*,
            ROW_NUMBER() OVER (PARTITION BY base.{case_row} ORDER BY {order}) AS {rank},
            COUNT(*) OVER (PARTITION BY base.{case_row}) AS {count}
        FROM {base_ident} AS base
        JOIN {aux_ident} AS aux
            ON {key_condition}
        WHERE {predicate}
        ",
        base_ident = quote_ident(base),
        aux_ident = quote_ident(&step.table),
    );
    debug!(step = %step.name, sql = %candidates_sql, "Collecting candidates");
    conn.execute_batch(&candidates_sql)
        .with_context(|| format!("Failed collecting candidates for step {}", step.name))?;

    let (candidate_rows, cases_matched, cases_ambiguous): (i64, i64, i64) = conn
        .query_row(
            &format!(
                "SELECT
                    COUNT(*),
                    COUNT(*) FILTER (WHERE {rank} = 1),
                    COUNT(*) FILTER (WHERE {rank} = 1 AND {count} > 1)
                 FROM {candidates_ident}"
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .with_context(|| format!("Failed summarizing candidates for step {}", step.name))?;

    if cases_ambiguous > 0 {
        let sample = ambiguous_sample(conn, &candidates, &step.id_column)?;
        if step.policy == MatchPolicy::Unique {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {candidates_ident}"))
                .context("Failed dropping candidate table")?;
            bail!(
                "Step {}: {} cases have more than one candidate in {} (e.g. {} = {})",
                step.name,
                cases_ambiguous,
                step.table,
                step.id_column,
                sample.join(", ")
            );
        }
        warn!(
            step = %step.name,
            cases = cases_ambiguous,
            sample = %sample.join(", "),
            "Cases with several candidates; keeping one per case ({})",
            step.policy
        );
    }

    let select_list = std::iter::once("base.*".to_string())
        .chain(payload.iter().map(|c| format!("c.{}", quote_ident(c))))
        .collect::<Vec<_>>()
        .join(", ");
    let output_sql = format!(
        "
        CREATE OR REPLACE TABLE {output_ident} AS
        SELECT {select_list}
        FROM {base_ident} AS base
        LEFT JOIN {candidates_ident} AS c
            ON base.{case_row} = c.{case_row} AND c.{rank} = 1
        ORDER BY base.{case_row};
        DROP TABLE {candidates_ident};
        ",
        output_ident = quote_ident(output),
        base_ident = quote_ident(base),
    );
    conn.execute_batch(&output_sql)
        .with_context(|| format!("Failed attaching {} onto {base}", step.table))?;

    let cases_total = count_rows(conn, base)?;
    let output_rows = count_rows(conn, output)?;
    ensure!(
        output_rows == cases_total,
        "Step {} changed the row count from {cases_total} to {output_rows}",
        step.name
    );

    Ok(AttachOutcome {
        step: step.name.clone(),
        join_keys,
        policy: step.policy,
        window: step.window.as_ref().map(|w| w.bounds),
        cases_total,
        cases_matched,
        cases_ambiguous,
        candidate_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(conn: &Connection) {
        conn.execute_batch(
            "
            CREATE TABLE base AS
            SELECT * FROM (VALUES
                (0, 1, DATE '2020-01-01', 'a'),
                (1, 2, DATE '2020-06-01', 'b'),
                (2, 3, NULL, 'c'),
                (3, 4, DATE '2021-03-01', 'd')
            ) AS t(_case_row, fake_id, P_SurgDate, note);

            CREATE TABLE raw_after AS
            SELECT * FROM (VALUES
                (1, '2020-11-01', 10),
                (1, '2020-12-15', 20),
                (1, '2020-12-15', 20),
                (1, '2023-01-01', 30),
                (2, '2021-06-03', 40),
                (2, '2021-05-30', 41),
                (3, '2021-01-01', 50),
                (9, '2021-01-01', 60)
            ) AS t(fake_id, POSTP_Date, score);
            ",
        )
        .unwrap();
    }

    fn post_step(policy: MatchPolicy) -> AttachStep {
        AttachStep {
            name: "post".to_string(),
            table: "aux_after".to_string(),
            id_column: "fake_id".to_string(),
            window: Some(WindowSpec {
                anchor_column: "P_SurgDate".to_string(),
                date_column: "POSTP_Date".to_string(),
                bounds: DateWindow::around(365, 180).unwrap(),
            }),
            policy,
        }
    }

    fn contains(window: DateWindow, offset_days: i64) -> bool {
        window.start_days <= offset_days && offset_days <= window.end_days
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn attached(conn: &Connection, table: &str) -> Vec<(i64, Option<String>, Option<i64>)> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT fake_id, CAST(POSTP_Date AS VARCHAR), score FROM {table} ORDER BY _case_row"
            ))
            .unwrap();
        let mut rows = stmt.query([]).unwrap();
        let mut out = Vec::new();
        while let Some(row) = rows.next().unwrap() {
            out.push((row.get(0).unwrap(), row.get(1).unwrap(), row.get(2).unwrap()));
        }
        out
    }

    #[test]
    fn window_helpers() {
        let w = DateWindow::around(365, 180).unwrap();
        assert_eq!(w, DateWindow { start_days: 185, end_days: 545 });
        assert!(contains(w, 185) && contains(w, 545) && !contains(w, 546));
        assert!(DateWindow::new(1, 0).is_err());
        assert!(DateWindow::around(365, -1).is_err());
        assert!(DateWindow::around(i64::MIN, 1).is_err());
        assert!(DateWindow::around(i64::MAX, 1).is_err());
        assert_eq!(
            DateWindow::around(0, i64::MAX).unwrap(),
            DateWindow::new(-i64::MAX, i64::MAX).unwrap()
        );
        assert_eq!(w.to_string(), "[+185d, +545d]");
        assert_eq!(MatchPolicy::Nearest { target_days: 365 }.to_string(), "nearest(+365d)");
    }

    #[test]
    fn coerce_date_expr_by_type() {
        assert_eq!(coerce_date_expr("d", "DATE").unwrap(), "\"d\"");
        assert_eq!(
            coerce_date_expr("d", "TIMESTAMP_NS").unwrap(),
            "CAST(\"d\" AS DATE)"
        );
        assert!(coerce_date_expr("d", "VARCHAR").unwrap().starts_with("COALESCE("));
        assert!(coerce_date_expr("d", "DOUBLE").is_err());
    }

    #[test]
    fn string_dates_are_parsed() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE raw AS SELECT * FROM (VALUES
                (1, '2020-03-04'), (2, '20200304'), (3, '04.03.2020'),
                (4, '03/04/2020'), (5, '2020-03-04 10:30:00'), (6, 'not a date')
            ) AS t(fake_id, d)",
        )
        .unwrap();
        prepare_aux(&conn, "raw", &cols(&["d", "fake_id"]), &["d"], "prepared").unwrap();
        let mut stmt = conn
            .prepare("SELECT CAST(d AS VARCHAR) FROM prepared ORDER BY fake_id")
            .unwrap();
        let mut rows = stmt.query([]).unwrap();
        let mut parsed: Vec<Option<String>> = Vec::new();
        while let Some(row) = rows.next().unwrap() {
            parsed.push(row.get(0).unwrap());
        }
        let expected = Some("2020-03-04".to_string());
        assert!(parsed[..5].iter().all(|d| d == &expected), "{parsed:?}");
        assert_eq!(parsed[5], None);
    }

    #[test]
    fn prepare_aux_drops_exact_duplicates_in_source_order() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);
        prepare_aux(
            &conn,
            "raw_after",
            &cols(&["POSTP_Date", "fake_id", "score"]),
            &["POSTP_Date"],
            "aux_after",
        )
        .unwrap();
        assert_eq!(count_rows(&conn, "aux_after").unwrap(), 7);
        let types = load_column_types(&conn, "aux_after").unwrap();
        assert!(types.iter().any(|(n, t)| n == "POSTP_Date" && t == "DATE"));
        let first_row: i64 = conn
            .query_row(
                "SELECT _aux_row FROM aux_after WHERE fake_id = 1 AND score = 10",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(first_row, 1);
    }

    #[test]
    fn nearest_candidate_to_target_wins() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);
        prepare_aux(
            &conn,
            "raw_after",
            &cols(&["POSTP_Date", "fake_id", "score"]),
            &["POSTP_Date"],
            "aux_after",
        )
        .unwrap();

        let outcome = attach(
            &conn,
            "base",
            &post_step(MatchPolicy::Nearest { target_days: 365 }),
            "with_post",
        )
        .unwrap();

        assert_eq!(
            attached(&conn, "with_post"),
            vec![
                // target 2020-12-31: 2020-12-15 is 16 days away, 2020-11-01 is 60 days
                // away and 2023-01-01 falls outside the window.
                (1, Some("2020-12-15".to_string()), Some(20)),
                // target 2021-06-01: 2021-05-30 (2 days) beats 2021-06-03 (2 days) on date.
                (2, Some("2021-05-30".to_string()), Some(41)),
                // no anchor date, never matches.
                (3, None, None),
                // no background rows.
                (4, None, None),
            ]
        );
        assert_eq!(outcome.join_keys, cols(&["fake_id"]));
        assert_eq!(outcome.cases_total, 4);
        assert_eq!(outcome.cases_matched, 2);
        assert_eq!(outcome.cases_ambiguous, 2);
        assert_eq!(outcome.candidate_rows, 4);
        assert_eq!(count_rows(&conn, "with_post").unwrap(), 4);
        assert!(!load_column_names(&conn, "with_post")
            .unwrap()
            .contains(&"_aux_row".to_string()));
    }

    #[test]
    fn retained_matches_fall_inside_the_window() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);
        prepare_aux(
            &conn,
            "raw_after",
            &cols(&["POSTP_Date", "fake_id", "score"]),
            &["POSTP_Date"],
            "aux_after",
        )
        .unwrap();
        let step = post_step(MatchPolicy::First);
        attach(&conn, "base", &step, "with_post").unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT DATE_DIFF('day', P_SurgDate, POSTP_Date) FROM with_post WHERE POSTP_Date IS NOT NULL",
            )
            .unwrap();
        let mut rows = stmt.query([]).unwrap();
        let bounds = step.window.as_ref().unwrap().bounds;
        let mut seen = 0;
        while let Some(row) = rows.next().unwrap() {
            let offset: i64 = row.get(0).unwrap();
            assert!(contains(bounds, offset), "offset {offset} outside {bounds}");
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn first_policy_uses_source_order() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);
        prepare_aux(
            &conn,
            "raw_after",
            &cols(&["POSTP_Date", "fake_id", "score"]),
            &["POSTP_Date"],
            "aux_after",
        )
        .unwrap();
        attach(&conn, "base", &post_step(MatchPolicy::First), "with_post").unwrap();
        let rows = attached(&conn, "with_post");
        assert_eq!(rows[0], (1, Some("2020-11-01".to_string()), Some(10)));
        assert_eq!(rows[1], (2, Some("2021-06-03".to_string()), Some(40)));
    }

    #[test]
    fn unique_policy_rejects_ambiguous_cases() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);
        prepare_aux(
            &conn,
            "raw_after",
            &cols(&["POSTP_Date", "fake_id", "score"]),
            &["POSTP_Date"],
            "aux_after",
        )
        .unwrap();
        let err = attach(&conn, "base", &post_step(MatchPolicy::Unique), "with_post")
            .unwrap_err()
            .to_string();
        assert!(err.contains("2 cases have more than one candidate"), "{err}");
        assert!(err.contains("fake_id = 1, 2"), "{err}");
    }

    #[test]
    fn equality_only_step_attaches_first_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE base AS
            SELECT * FROM (VALUES (0, 1), (1, 2), (2, 3)) AS t(_case_row, fake_id);
            CREATE TABLE raw_op AS
            SELECT * FROM (VALUES
                (1, '2020-01-01', 'L'),
                (2, '2020-06-01', 'R'),
                (2, '2020-07-01', 'L')
            ) AS t(fake_id, P_SurgDate, P_Side);
            ",
        )
        .unwrap();
        prepare_aux(
            &conn,
            "raw_op",
            &cols(&["P_Side", "P_SurgDate", "fake_id"]),
            &["P_SurgDate"],
            "aux_op",
        )
        .unwrap();
        let step = AttachStep {
            name: "op".to_string(),
            table: "aux_op".to_string(),
            id_column: "fake_id".to_string(),
            window: None,
            policy: MatchPolicy::First,
        };
        let outcome = attach(&conn, "base", &step, "with_op").unwrap();
        assert_eq!(outcome.cases_matched, 2);
        assert_eq!(outcome.cases_ambiguous, 1);

        let side: Option<String> = conn
            .query_row("SELECT P_Side FROM with_op WHERE fake_id = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(side.as_deref(), Some("R"));
        let missing: Option<String> = conn
            .query_row("SELECT P_Side FROM with_op WHERE fake_id = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(missing, None);

        let nearest = AttachStep {
            policy: MatchPolicy::Nearest { target_days: 0 },
            ..step
        };
        assert!(attach(&conn, "base", &nearest, "with_op2").is_err());
    }

    #[test]
    fn missing_key_column_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE base AS SELECT 0 AS _case_row, 1 AS other_id;
            CREATE TABLE raw AS SELECT 1 AS fake_id, 5 AS score;
            ",
        )
        .unwrap();
        prepare_aux(&conn, "raw", &cols(&["fake_id", "score"]), &[], "aux").unwrap();
        let step = AttachStep {
            name: "op".to_string(),
            table: "aux".to_string(),
            id_column: "fake_id".to_string(),
            window: None,
            policy: MatchPolicy::First,
        };
        let err = attach(&conn, "base", &step, "out").unwrap_err().to_string();
        assert!(err.contains("key column fake_id is not shared"), "{err}");
    }
}
