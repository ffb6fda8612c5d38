use anyhow::{Context, Result, bail};
use duckdb::Connection;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub fn delete_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed deleting {}", path.display()))?;
    }
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }
    Ok(())
}

/// Sibling path used for write-then-rename output.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("output");
    path.with_file_name(format!("{file_name}.tmp"))
}

pub fn finish_tmp(tmp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp_path, path).with_context(|| {
        format!(
            "Failed moving {} to {}",
            tmp_path.display(),
            path.display()
        )
    })
}

pub fn extension_lower(path: &Path) -> String {
    path.extension()
        .and_then(|x| x.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn sql_escape_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

pub fn sql_escape_str(text: &str) -> String {
    text.replace('\'', "''")
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// DuckDB table function reading a parquet or CSV file.
pub fn source_expr(input_path: &Path) -> Result<String> {
    let escaped = sql_escape_path(input_path);
    match extension_lower(input_path).as_str() {
        "parquet" => Ok(format!("read_parquet('{escaped}')")),
        "csv" => Ok(format!("read_csv_auto('{escaped}', header=true)")),
        _ => bail!(
            "Unsupported input extension for {}. Use .feather, .arrow, .parquet or .csv",
            input_path.display()
        ),
    }
}

/// Column names and DuckDB type names of a table, in table order.
pub fn load_column_types(conn: &Connection, table: &str) -> Result<Vec<(String, String)>> {
    let query = format!(
        "SELECT name, type FROM pragma_table_info('{}') ORDER BY cid",
        sql_escape_str(table)
    );
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("Failed preparing DuckDB pragma_table_info for {table}"))?;
    let mut rows = stmt
        .query([])
        .with_context(|| format!("Failed querying DuckDB pragma_table_info for {table}"))?;
    let mut columns = Vec::new();
    while let Some(row) = rows
        .next()
        .with_context(|| format!("Failed iterating pragma_table_info rows for {table}"))?
    {
        let name: String = row.get(0).context("Failed reading column name")?;
        let type_name: String = row.get(1).context("Failed reading column type")?;
        columns.push((name, type_name));
    }
    Ok(columns)
}

pub fn load_column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    Ok(load_column_types(conn, table)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    conn.query_row(&query, [], |row| row.get(0))
        .with_context(|| format!("Failed counting rows of {table}"))
}
