use anyhow::{Context, Result, ensure};
use arrow::{
    array::{Array, ArrayRef, AsArray},
    compute::cast,
    datatypes::{DataType, Date32Type, Float64Type, TimeUnit, TimestampSecondType},
    util::display::{ArrayFormatter, FormatOptions},
};
use rust_xlsxwriter::{ExcelDateTime, Format, Workbook, Worksheet};
use std::path::Path;

use crate::common::{delete_if_exists, ensure_parent_dir, finish_tmp, tmp_path_for};
use crate::constants::{XLSX_MAX_COLUMNS, XLSX_MAX_ROWS};
use crate::feather::Table;

const SECONDS_PER_DAY: i64 = 86_400;
const MAX_CELL_CHARS: usize = 32_767;

struct CellFormats {
    header: Format,
    date: Format,
    timestamp: Format,
}

fn truncate_cell(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_CHARS {
        text.to_string()
    } else {
        text.chars().take(MAX_CELL_CHARS).collect()
    }
}

fn write_column(
    worksheet: &mut Worksheet,
    formats: &CellFormats,
    col: u16,
    first_row: u32,
    array: &ArrayRef,
) -> Result<()> {
    let rows = (0..array.len()).filter(|&i| !array.is_null(i));
    match array.data_type() {
        DataType::Boolean => {
            let values = array.as_boolean();
            for i in rows {
                worksheet.write_boolean(first_row + i as u32, col, values.value(i))?;
            }
        }
        DataType::Date32 | DataType::Date64 => {
            let days = cast(array.as_ref(), &DataType::Date32).context("Failed casting date column")?;
            let days = days.as_primitive::<Date32Type>();
            for i in rows {
                let seconds = i64::from(days.value(i)) * SECONDS_PER_DAY;
                let date = ExcelDateTime::from_timestamp(seconds)
                    .with_context(|| format!("Date at row {i} is outside the spreadsheet range"))?;
                worksheet.write_datetime_with_format(first_row + i as u32, col, &date, &formats.date)?;
            }
        }
        DataType::Timestamp(_, _) => {
            let seconds = cast(array.as_ref(), &DataType::Timestamp(TimeUnit::Second, None))
                .context("Failed casting timestamp column")?;
            let seconds = seconds.as_primitive::<TimestampSecondType>();
            for i in rows {
                let datetime = ExcelDateTime::from_timestamp(seconds.value(i)).with_context(|| {
                    format!("Timestamp at row {i} is outside the spreadsheet range")
                })?;
                worksheet.write_datetime_with_format(
                    first_row + i as u32,
                    col,
                    &datetime,
                    &formats.timestamp,
                )?;
            }
        }
        dt if dt.is_numeric() => {
            let numbers = cast(array.as_ref(), &DataType::Float64).context("Failed casting numeric column")?;
            let numbers = numbers.as_primitive::<Float64Type>();
            for i in rows {
                let value = numbers.value(i);
                if value.is_finite() {
                    worksheet.write_number(first_row + i as u32, col, value)?;
                }
            }
        }
        _ => {
            let formatter = ArrayFormatter::try_new(array.as_ref(), &FormatOptions::default())
                .context("Failed creating cell formatter")?;
            for i in rows {
                let text = formatter.value(i).to_string();
                worksheet.write_string(first_row + i as u32, col, truncate_cell(&text))?;
            }
        }
    }
    Ok(())
}

/// Writes the table to a single-sheet workbook. Nulls stay blank.
pub fn write_xlsx(path: &Path, table: &Table, sheet_name: &str) -> Result<()> {
    let rows = table.num_rows();
    ensure!(
        rows < XLSX_MAX_ROWS,
        "Table has {rows} rows; a worksheet holds at most {} data rows",
        XLSX_MAX_ROWS - 1
    );
    ensure!(
        table.schema.fields().len() <= XLSX_MAX_COLUMNS,
        "Table has {} columns; a worksheet holds at most {XLSX_MAX_COLUMNS}",
        table.schema.fields().len()
    );
    ensure_parent_dir(path)?;

    let formats = CellFormats {
        header: Format::new().set_bold(),
        date: Format::new().set_num_format("yyyy-mm-dd"),
        timestamp: Format::new().set_num_format("yyyy-mm-dd hh:mm:ss"),
    };

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name(sheet_name)
        .with_context(|| format!("Invalid worksheet name {sheet_name}"))?;

    for (col, field) in table.schema.fields().iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, field.name(), &formats.header)?;
    }

    let mut first_row = 1u32;
    for batch in &table.batches {
        for (col, array) in batch.columns().iter().enumerate() {
            write_column(worksheet, &formats, col as u16, first_row, array)?;
        }
        first_row += batch.num_rows() as u32;
    }

    let tmp_path = tmp_path_for(path);
    if let Err(err) = workbook.save(&tmp_path) {
        let _ = delete_if_exists(&tmp_path);
        return Err(err).with_context(|| format!("Failed writing {}", tmp_path.display()));
    }
    finish_tmp(&tmp_path, path)
}
