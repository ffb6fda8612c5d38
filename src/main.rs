mod args;
mod audit;
mod columns;
mod common;
mod constants;
mod feather;
mod linkage;
mod pipeline;
mod report;
mod sources;
mod xlsx;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use args::Args;
use pipeline::{LinkageConfig, list_columns, run};

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = LinkageConfig::try_from(&args)?;

    if args.list_columns {
        return list_columns(&config).context("listing input columns failed");
    }

    info!(
        "Linking {} with {}, {} and {}",
        config.inputs.cases.display(),
        config.inputs.op.display(),
        config.inputs.prom_before.display(),
        config.inputs.prom_after.display()
    );
    info!(
        "pre-period window {} ({}), post-period window {} ({})",
        config.pre_window, config.pre_policy, config.post_window, config.post_policy
    );

    let summary = run(&config).context("case linkage failed")?;
    info!(
        "Extended {} cases to {} columns",
        summary.case_rows,
        summary.table.schema.fields().len()
    );
    Ok(())
}
