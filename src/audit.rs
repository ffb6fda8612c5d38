use anyhow::{Context, Result};
use duckdb::Connection;
use tracing::info;

use crate::common::{count_rows, load_column_names, quote_ident};
use crate::linkage::{AUX_ROW_COLUMN, CASE_ROW_COLUMN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnCount {
    pub column: String,
    pub non_null: i64,
}

fn is_helper_column(name: &str) -> bool {
    name == CASE_ROW_COLUMN || name == AUX_ROW_COLUMN
}

/// Rows and data columns of a table; helper columns are not counted.
pub fn table_dims(conn: &Connection, table: &str) -> Result<(i64, usize)> {
    let rows = count_rows(conn, table)?;
    let columns = load_column_names(conn, table)?
        .iter()
        .filter(|c| !is_helper_column(c))
        .count();
    Ok((rows, columns))
}

pub fn log_dims(conn: &Connection, table: &str) -> Result<()> {
    let (rows, columns) = table_dims(conn, table)?;
    info!(table, rows, columns, "Rows and columns of {table}: {rows} {columns}");
    Ok(())
}

/// Non-null counts for the requested columns that exist in `table`.
pub fn non_null_counts(conn: &Connection, table: &str, columns: &[&str]) -> Result<Vec<ColumnCount>> {
    let present = load_column_names(conn, table)?;
    let columns: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| present.iter().any(|p| p == c))
        .collect();
    if columns.is_empty() {
        return Ok(Vec::new());
    }

    let select_exprs = columns
        .iter()
        .map(|c| format!("COUNT({})", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let query = format!("SELECT {select_exprs} FROM {}", quote_ident(table));
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed preparing non-null count query for {table}"))?;
    let mut rows = stmt
        .query([])
        .with_context(|| format!("Failed running non-null count query for {table}"))?;
    let row = rows
        .next()
        .context("Failed reading non-null count row")?
        .context("Non-null count query returned no rows")?;

    let mut counts = Vec::with_capacity(columns.len());
    for (idx, column) in columns.into_iter().enumerate() {
        let non_null: i64 = row
            .get(idx)
            .with_context(|| format!("Failed reading non-null count for {column}"))?;
        counts.push(ColumnCount {
            column: column.to_string(),
            non_null,
        });
    }
    Ok(counts)
}

pub fn log_non_null_counts(conn: &Connection, table: &str, columns: &[&str]) -> Result<()> {
    for count in non_null_counts(conn, table, columns)? {
        info!(table, column = %count.column, non_null = count.non_null, "Non-null values");
    }
    Ok(())
}

/// Prints every table's column names, one per line, under a header.
pub fn print_columns(conn: &Connection, tables: &[(&str, &str)]) -> Result<()> {
    for (label, table) in tables {
        let columns = load_column_names(conn, table)?;
        println!("{label} ({} columns):", columns.len());
        for name in columns {
            println!("  {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_skip_helper_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t AS SELECT * FROM (VALUES (0, 1, NULL), (1, 2, DATE '2020-01-01')) AS v(_case_row, fake_id, PREP_Date)",
        )
        .unwrap();
        assert_eq!(table_dims(&conn, "t").unwrap(), (2, 2));
    }

    #[test]
    fn non_null_counts_ignore_absent_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t AS SELECT * FROM (VALUES (1, NULL), (2, DATE '2020-01-01'), (3, NULL)) AS v(fake_id, PREP_Date)",
        )
        .unwrap();
        let counts = non_null_counts(&conn, "t", &["fake_id", "POSTP_Date", "PREP_Date"]).unwrap();
        assert_eq!(
            counts,
            vec![
                ColumnCount {
                    column: "fake_id".to_string(),
                    non_null: 3
                },
                ColumnCount {
                    column: "PREP_Date".to_string(),
                    non_null: 1
                },
            ]
        );
        assert!(non_null_counts(&conn, "t", &["missing"]).unwrap().is_empty());
    }
}
