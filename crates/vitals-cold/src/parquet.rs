//! Parquet encoding for sample partitions.
//!
//! One partition file holds every sample for a `(site, point, day)`. The
//! site is carried by the object path, so the columns are just
//! `point_name`, `ts` (ms epoch), and `value`, zstd-compressed.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{Array as _, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use vitals_types::Sample;

use crate::error::{Error, Result};

fn partition_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("point_name", DataType::Utf8, false),
        Field::new("ts", DataType::Int64, false),
        Field::new("value", DataType::Float64, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build()
}

/// Encode a partition's samples into one compressed Parquet buffer.
pub fn encode_partition(samples: &[Sample]) -> Result<Bytes> {
    let schema = partition_schema();

    let point_names = StringArray::from(
        samples
            .iter()
            .map(|s| Some(s.point_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let timestamps = Int64Array::from(samples.iter().map(|s| s.ts).collect::<Vec<_>>());
    let values = Float64Array::from(samples.iter().map(|s| s.value).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(point_names), Arc::new(timestamps), Arc::new(values)],
    )
    .map_err(|e| Error::Parquet {
        message: format!("record batch build failed: {e}"),
    })?;

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer =
        ArrowWriter::try_new(&mut cursor, schema, Some(writer_properties())).map_err(|e| {
            Error::Parquet {
                message: format!("parquet writer init failed: {e}"),
            }
        })?;
    writer.write(&batch).map_err(|e| Error::Parquet {
        message: format!("parquet write failed: {e}"),
    })?;
    writer.close().map_err(|e| Error::Parquet {
        message: format!("parquet close failed: {e}"),
    })?;

    Ok(Bytes::from(cursor.into_inner()))
}

/// Decode a partition buffer back into samples for the given site.
pub fn decode_partition(site: &str, data: Bytes) -> Result<Vec<Sample>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(|e| Error::Parquet {
            message: format!("parquet reader init failed: {e}"),
        })?
        .build()
        .map_err(|e| Error::Parquet {
            message: format!("parquet reader build failed: {e}"),
        })?;

    let mut samples = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| Error::Parquet {
            message: format!("parquet read failed: {e}"),
        })?;

        let point_names = column::<StringArray>(&batch, 0, "point_name")?;
        let timestamps = column::<Int64Array>(&batch, 1, "ts")?;
        let values = column::<Float64Array>(&batch, 2, "value")?;

        for i in 0..batch.num_rows() {
            samples.push(Sample::new(
                site,
                point_names.value(i),
                timestamps.value(i),
                values.value(i),
            ));
        }
    }

    Ok(samples)
}

fn column<'a, T: 'static>(
    batch: &'a RecordBatch,
    index: usize,
    name: &str,
) -> Result<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Error::Parquet {
            message: format!("unexpected column type for {name}"),
        })
}
