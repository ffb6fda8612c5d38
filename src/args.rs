use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_ANCHOR_COLUMN, DEFAULT_DATA_DIR, DEFAULT_KEY_COLUMN, DEFAULT_OUTPUT_DIR,
    DEFAULT_POST_DATE_COLUMN, DEFAULT_POST_TARGET_DAYS, DEFAULT_POST_TOLERANCE_DAYS,
    DEFAULT_PRE_DATE_COLUMN, DEFAULT_PRE_WINDOW_END_DAYS, DEFAULT_PRE_WINDOW_START_DAYS,
};

/// How to pick one candidate when several background rows match a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Closest date to the target offset from the anchor date.
    Nearest,
    /// First candidate in source row order.
    First,
    /// Fail when a case has more than one candidate.
    Unique,
}

/// Policy for the operations join, which has no date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OpPolicyArg {
    First,
    Unique,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeatherCompression {
    None,
    Lz4,
    Zstd,
}

#[derive(Debug, Parser)]
#[command(name = "case_linkage")]
#[command(
    about = "Link case records with operation and pre/post-period measurement data using date-window joins"
)]
pub struct Args {
    /// Directory holding the input tables.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Directory receiving the extended case data exports.
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// Case table (.feather, .arrow, .parquet or .csv). Defaults to <data-dir>/df_cases.feather.
    #[arg(long)]
    pub cases_path: Option<PathBuf>,

    /// Operation table. Defaults to <data-dir>/df_op.feather.
    #[arg(long)]
    pub op_path: Option<PathBuf>,

    /// Pre-period measurement table. Defaults to <data-dir>/df_prom_before.feather.
    #[arg(long)]
    pub prom_before_path: Option<PathBuf>,

    /// Post-period measurement table. Defaults to <data-dir>/df_prom_after.feather.
    #[arg(long)]
    pub prom_after_path: Option<PathBuf>,

    /// Identifier column present in every table.
    #[arg(long, default_value = DEFAULT_KEY_COLUMN)]
    pub key_column: String,

    /// Anchor (surgery) date column, provided by the operation table.
    #[arg(long, default_value = DEFAULT_ANCHOR_COLUMN)]
    pub anchor_column: String,

    /// Date column of the pre-period table.
    #[arg(long, default_value = DEFAULT_PRE_DATE_COLUMN)]
    pub pre_date_column: String,

    /// Date column of the post-period table.
    #[arg(long, default_value = DEFAULT_POST_DATE_COLUMN)]
    pub post_date_column: String,

    /// Pre-period window start, in days relative to the anchor date.
    #[arg(long, default_value_t = DEFAULT_PRE_WINDOW_START_DAYS, allow_hyphen_values = true)]
    pub pre_window_start_days: i64,

    /// Pre-period window end, in days relative to the anchor date.
    #[arg(long, default_value_t = DEFAULT_PRE_WINDOW_END_DAYS, allow_hyphen_values = true)]
    pub pre_window_end_days: i64,

    /// Resolution of several pre-period candidates for one case.
    #[arg(long, value_enum, default_value_t = PolicyArg::Nearest)]
    pub pre_policy: PolicyArg,

    /// Target used by the nearest policy on the pre-period side, in days from the anchor.
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub pre_target_days: i64,

    /// Post-period target, in days after the anchor date.
    #[arg(long, default_value_t = DEFAULT_POST_TARGET_DAYS, allow_hyphen_values = true)]
    pub post_target_days: i64,

    /// Accepted distance from the post-period target, in days.
    #[arg(long, default_value_t = DEFAULT_POST_TOLERANCE_DAYS)]
    pub post_tolerance_days: i64,

    /// Resolution of several post-period candidates for one case.
    #[arg(long, value_enum, default_value_t = PolicyArg::Nearest)]
    pub post_policy: PolicyArg,

    /// Resolution of several operation rows for one case.
    #[arg(long, value_enum, default_value_t = OpPolicyArg::First)]
    pub op_policy: OpPolicyArg,

    /// Compression of the exported feather file.
    #[arg(long, value_enum, default_value_t = FeatherCompression::None)]
    pub feather_compression: FeatherCompression,

    /// Skip the spreadsheet export.
    #[arg(long, default_value_t = false)]
    pub skip_xlsx: bool,

    /// Print the column names of every input table and exit.
    #[arg(long, default_value_t = false)]
    pub list_columns: bool,

    /// Keep the parquet files staged from feather inputs.
    #[arg(long, default_value_t = false)]
    pub keep_staging: bool,
}
