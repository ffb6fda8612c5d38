use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, Int64Array},
    datatypes::{DataType, Field, Schema, SchemaRef},
    ipc::{
        CompressionType,
        reader::FileReader,
        writer::{FileWriter, IpcWriteOptions},
    },
    record_batch::RecordBatch,
};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, arrow_writer::ArrowWriter};
use parquet::{basic::Compression, file::properties::WriterProperties};
use std::{fs::File, path::Path, sync::Arc};

use crate::args::FeatherCompression;
use crate::common::{delete_if_exists, ensure_parent_dir, finish_tmp, tmp_path_for};
use crate::constants::FEATHER_INDEX_COLUMN;

/// An in-memory table: one schema, any number of batches.
#[derive(Debug, Clone)]
pub struct Table {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl Table {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }
}

/// Reads a feather (Arrow IPC file) table. Compressed buffers are supported.
pub fn read_feather(path: &Path) -> Result<Table> {
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    let reader = FileReader::try_new(file, None).with_context(|| {
        format!(
            "Failed reading {} as a feather v2 / Arrow IPC file",
            path.display()
        )
    })?;
    let schema = reader.schema();
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed decoding record batches of {}", path.display()))?;
    Ok(Table { schema, batches })
}

/// Copies a feather file into parquet so DuckDB can scan it with `read_parquet`.
pub fn stage_feather_as_parquet(input_path: &Path, staged_path: &Path) -> Result<usize> {
    ensure_parent_dir(staged_path)?;
    let table = read_feather(input_path)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let file = File::create(staged_path)
        .with_context(|| format!("Failed creating {}", staged_path.display()))?;
    let mut writer = ArrowWriter::try_new(file, Arc::clone(&table.schema), Some(props))
        .context("Failed creating Parquet ArrowWriter")?;
    for batch in &table.batches {
        writer
            .write(batch)
            .with_context(|| format!("Failed staging {}", input_path.display()))?;
    }
    writer
        .close()
        .context("Failed closing Parquet writer")?;
    Ok(table.num_rows())
}

pub fn read_parquet(path: &Path) -> Result<Table> {
    let file = File::open(path).with_context(|| format!("Failed opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("Failed reading parquet metadata of {}", path.display()))?;
    let schema = Arc::clone(builder.schema());
    let reader = builder
        .build()
        .with_context(|| format!("Failed creating parquet reader for {}", path.display()))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed decoding record batches of {}", path.display()))?;
    Ok(Table { schema, batches })
}

/// Name of the leading row-number column. Falls back to `level_0` when the table
/// already has an `index` column.
fn index_column_name(schema: &Schema) -> &'static str {
    if schema.field_with_name(FEATHER_INDEX_COLUMN).is_ok() {
        "level_0"
    } else {
        FEATHER_INDEX_COLUMN
    }
}

fn with_index_column(table: &Table) -> Result<Table> {
    let index_name = index_column_name(&table.schema);
    let mut fields = vec![Arc::new(Field::new(index_name, DataType::Int64, false))];
    fields.extend(table.schema.fields().iter().cloned());
    let schema = Arc::new(Schema::new_with_metadata(
        fields,
        table.schema.metadata().clone(),
    ));

    let mut offset = 0i64;
    let mut batches = Vec::with_capacity(table.batches.len());
    for batch in &table.batches {
        let rows = batch.num_rows() as i64;
        let index: ArrayRef = Arc::new(Int64Array::from_iter_values(offset..offset + rows));
        offset += rows;

        let mut columns = Vec::with_capacity(batch.num_columns() + 1);
        columns.push(index);
        columns.extend(batch.columns().iter().cloned());
        batches.push(
            RecordBatch::try_new(Arc::clone(&schema), columns)
                .context("Failed adding index column")?,
        );
    }
    Ok(Table { schema, batches })
}

/// Writes the table as a feather file with a leading 0-based row-number column.
pub fn write_feather(path: &Path, table: &Table, compression: FeatherCompression) -> Result<()> {
    ensure_parent_dir(path)?;
    let indexed = with_index_column(table)?;

    let options = IpcWriteOptions::default();
    let options = match compression {
        FeatherCompression::None => options,
        FeatherCompression::Lz4 => options.try_with_compression(Some(CompressionType::LZ4_FRAME))?,
        FeatherCompression::Zstd => options.try_with_compression(Some(CompressionType::ZSTD))?,
    };

    let tmp_path = tmp_path_for(path);
    let file =
        File::create(&tmp_path).with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    let result = (|| -> Result<()> {
        let mut writer = FileWriter::try_new_with_options(file, &indexed.schema, options)
            .context("Failed creating Arrow IPC writer")?;
        for batch in &indexed.batches {
            writer
                .write(batch)
                .context("Failed writing Arrow IPC record batch")?;
        }
        writer.finish().context("Failed finishing Arrow IPC file")?;
        Ok(())
    })();
    if let Err(err) = result {
        // Don't leave a partial file next to the output.
        let _ = delete_if_exists(&tmp_path);
        return Err(err);
    }
    finish_tmp(&tmp_path, path)
}
