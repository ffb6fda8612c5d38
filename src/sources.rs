use anyhow::{Context, Result, bail};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::common::{count_rows, extension_lower, quote_ident, sql_escape_path, source_expr};
use crate::feather::stage_feather_as_parquet;

/// One input table: where it comes from and the DuckDB table it lands in.
#[derive(Debug, Clone)]
pub struct Source {
    pub label: &'static str,
    pub path: PathBuf,
    pub table: String,
}

impl Source {
    pub fn new(label: &'static str, path: PathBuf) -> Self {
        Self {
            label,
            path,
            table: format!("src_{label}"),
        }
    }
}

fn is_feather(path: &Path) -> bool {
    matches!(
        extension_lower(path).as_str(),
        "feather" | "arrow" | "ipc"
    )
}

/// Loads `source` into its DuckDB table and returns the row count.
///
/// Feather files are staged as parquet under `staging_dir` first.
pub fn load_source(conn: &Connection, source: &Source, staging_dir: &Path) -> Result<i64> {
    if !source.path.exists() {
        bail!(
            "Input file for {} missing at {}",
            source.label,
            source.path.display()
        );
    }

    let expr = if is_feather(&source.path) {
        let staged = staging_dir.join(format!("{}.parquet", source.table));
        stage_feather_as_parquet(&source.path, &staged)?;
        format!("read_parquet('{}')", sql_escape_path(&staged))
    } else {
        source_expr(&source.path)?
    };

    conn.execute_batch(&format!(
        "CREATE OR REPLACE TABLE {} AS SELECT * FROM {expr}",
        quote_ident(&source.table)
    ))
    .with_context(|| {
        format!(
            "Failed loading {} from {}",
            source.label,
            source.path.display()
        )
    })?;

    let rows = count_rows(conn, &source.table)?;
    info!(
        "Loaded {} ({} rows) from {}",
        source.label,
        rows,
        source.path.display()
    );
    Ok(rows)
}
