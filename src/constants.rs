pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_OUTPUT_DIR: &str = "output";

pub const CASES_FILE: &str = "df_cases.feather";
pub const OP_FILE: &str = "df_op.feather";
pub const PROM_BEFORE_FILE: &str = "df_prom_before.feather";
pub const PROM_AFTER_FILE: &str = "df_prom_after.feather";

pub const OUTPUT_STEM: &str = "extended_case_data";

pub const DEFAULT_KEY_COLUMN: &str = "fake_id";
pub const DEFAULT_ANCHOR_COLUMN: &str = "P_SurgDate";
pub const DEFAULT_PRE_DATE_COLUMN: &str = "PREP_Date";
pub const DEFAULT_POST_DATE_COLUMN: &str = "POSTP_Date";

// Pre-period measurements are valid up to 180 days before surgery.
pub const DEFAULT_PRE_WINDOW_START_DAYS: i64 = -180;
pub const DEFAULT_PRE_WINDOW_END_DAYS: i64 = 0;

// Post-period measurements target the one-year follow-up.
pub const DEFAULT_POST_TARGET_DAYS: i64 = 365;
pub const DEFAULT_POST_TOLERANCE_DAYS: i64 = 180;

// Row limit of a single xlsx worksheet, header included.
pub const XLSX_MAX_ROWS: usize = 1_048_576;
pub const XLSX_MAX_COLUMNS: usize = 16_384;

pub const FEATHER_INDEX_COLUMN: &str = "index";
