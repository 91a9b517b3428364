use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, Int64Array, ListArray, StringArray,
    StructArray, UInt32Array, UInt32Builder,
};
use arrow::buffer::OffsetBuffer;
use arrow::datatypes::{DataType, Field, FieldRef, Fields, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use thiserror::Error;

use crate::record::{OrderBookUpdate, PriceLevel};

/// Written to parquet key/value metadata as `lobrec.schema_name`.
pub const SCHEMA_NAME: &str = "lobrec_l2_book";

/// Bump on any column change.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Unit of the `local_time` column.
pub const LOCAL_TIME_UNIT: &str = "us";

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Missing column: {0}")]
    MissingColumn(&'static str),

    #[error("Column {0} has an unexpected type")]
    ColumnType(&'static str),

    #[error("Null value in column {column} at row {row}")]
    NullValue { column: &'static str, row: usize },

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

fn level_fields() -> Fields {
    Fields::from(vec![
        Field::new("price", DataType::Float64, false),
        Field::new("size", DataType::Float64, false),
        Field::new("order_count", DataType::UInt32, false),
    ])
}

fn level_item_field() -> FieldRef {
    Arc::new(Field::new("item", DataType::Struct(level_fields()), false))
}

/// Arrow schema shared by every file the recorder writes.
pub fn order_book_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("instrument", DataType::Utf8, false),
        Field::new("channel", DataType::Utf8, false),
        Field::new("exchange_time", DataType::Int64, false),
        Field::new("local_time", DataType::Int64, false),
        Field::new("bids", DataType::List(level_item_field()), false),
        Field::new("asks", DataType::List(level_item_field()), false),
    ]))
}

/// Build one side's `list<struct>` column. Row order and level order are kept as-is.
fn levels_column<F>(updates: &[OrderBookUpdate], side: F) -> Result<ListArray, ArrowError>
where
    F: Fn(&OrderBookUpdate) -> &[PriceLevel],
{
    let total: usize = updates.iter().map(|u| side(u).len()).sum();
    let mut price = Float64Builder::with_capacity(total);
    let mut size = Float64Builder::with_capacity(total);
    let mut order_count = UInt32Builder::with_capacity(total);
    let mut lengths = Vec::with_capacity(updates.len());

    for update in updates {
        let levels = side(update);
        for level in levels {
            price.append_value(level.price);
            size.append_value(level.size);
            order_count.append_value(level.order_count);
        }
        lengths.push(levels.len());
    }

    let values = StructArray::try_new(
        level_fields(),
        vec![
            Arc::new(price.finish()) as ArrayRef,
            Arc::new(size.finish()) as ArrayRef,
            Arc::new(order_count.finish()) as ArrayRef,
        ],
        None,
    )?;

    ListArray::try_new(
        level_item_field(),
        OffsetBuffer::from_lengths(lengths),
        Arc::new(values),
        None,
    )
}

/// Convert updates into a single RecordBatch, one row per update, in slice order.
pub fn to_record_batch(updates: &[OrderBookUpdate]) -> Result<RecordBatch, SchemaError> {
    let instrument = StringArray::from_iter_values(updates.iter().map(|u| u.instrument()));
    let channel = StringArray::from_iter_values(updates.iter().map(|u| u.channel()));
    let exchange_time = Int64Array::from_iter_values(updates.iter().map(|u| u.exchange_time()));
    let local_time = Int64Array::from_iter_values(updates.iter().map(|u| u.local_time()));
    let bids = levels_column(updates, OrderBookUpdate::bids)?;
    let asks = levels_column(updates, OrderBookUpdate::asks)?;

    let batch = RecordBatch::try_new(
        order_book_schema(),
        vec![
            Arc::new(instrument),
            Arc::new(channel),
            Arc::new(exchange_time),
            Arc::new(local_time),
            Arc::new(bids),
            Arc::new(asks),
        ],
    )?;
    Ok(batch)
}

fn column<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &'static str,
) -> Result<&'a T, SchemaError> {
    batch
        .column_by_name(name)
        .ok_or(SchemaError::MissingColumn(name))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or(SchemaError::ColumnType(name))
}

fn child<'a, T: Array + 'static>(
    parent: &'a StructArray,
    name: &'static str,
) -> Result<&'a T, SchemaError> {
    parent
        .column_by_name(name)
        .ok_or(SchemaError::MissingColumn(name))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or(SchemaError::ColumnType(name))
}

/// Flattened view of one side's levels, decoded once per batch.
struct LevelsReader<'a> {
    list: &'a ListArray,
    price: &'a Float64Array,
    size: &'a Float64Array,
    order_count: &'a UInt32Array,
}

impl<'a> LevelsReader<'a> {
    fn new(batch: &'a RecordBatch, name: &'static str) -> Result<Self, SchemaError> {
        let list = column::<ListArray>(batch, name)?;
        let values = list
            .values()
            .as_any()
            .downcast_ref::<StructArray>()
            .ok_or(SchemaError::ColumnType(name))?;
        Ok(Self {
            list,
            price: child(values, "price")?,
            size: child(values, "size")?,
            order_count: child(values, "order_count")?,
        })
    }

    fn row(&self, row: usize) -> Vec<PriceLevel> {
        let offsets = self.list.value_offsets();
        let start = offsets[row] as usize;
        let end = offsets[row + 1] as usize;
        (start..end)
            .map(|i| {
                PriceLevel::new(
                    self.price.value(i),
                    self.size.value(i),
                    self.order_count.value(i),
                )
            })
            .collect()
    }
}

/// Inverse of [`to_record_batch`]: recover the exact updates from a batch.
pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<OrderBookUpdate>, SchemaError> {
    let instrument = column::<StringArray>(batch, "instrument")?;
    let channel = column::<StringArray>(batch, "channel")?;
    let exchange_time = column::<Int64Array>(batch, "exchange_time")?;
    let local_time = column::<Int64Array>(batch, "local_time")?;
    let bids = LevelsReader::new(batch, "bids")?;
    let asks = LevelsReader::new(batch, "asks")?;

    let mut updates = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if instrument.is_null(row) {
            return Err(SchemaError::NullValue {
                column: "instrument",
                row,
            });
        }
        if bids.list.is_null(row) || asks.list.is_null(row) {
            return Err(SchemaError::NullValue {
                column: "bids/asks",
                row,
            });
        }
        updates.push(OrderBookUpdate::new(
            instrument.value(row),
            channel.value(row),
            exchange_time.value(row),
            local_time.value(row),
            bids.row(row),
            asks.row(row),
        ));
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(local_time: i64, bids: usize, asks: usize) -> OrderBookUpdate {
        OrderBookUpdate::new(
            "BTC",
            "l2Book",
            1_700_000_000_000 + local_time,
            local_time,
            (0..bids)
                .map(|i| PriceLevel::new(100.0 - i as f64, 1.0 + i as f64, i as u32 + 1))
                .collect(),
            (0..asks)
                .map(|i| PriceLevel::new(101.0 + i as f64, 2.0, 1))
                .collect(),
        )
    }

    #[test]
    fn test_schema_shape() {
        let schema = order_book_schema();
        assert_eq!(schema.fields().len(), 6);
        let bids = schema.field_with_name("bids").unwrap();
        match bids.data_type() {
            DataType::List(item) => match item.data_type() {
                DataType::Struct(fields) => {
                    let names: Vec<&str> = fields.iter().map(|f| f.name().as_str()).collect();
                    assert_eq!(names, vec!["price", "size", "order_count"]);
                }
                other => panic!("expected struct items, got {:?}", other),
            },
            other => panic!("expected list column, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_keeps_row_and_level_order() {
        let updates = vec![sample(1, 3, 2), sample(2, 0, 1), sample(3, 2, 0)];
        let batch = to_record_batch(&updates).unwrap();
        assert_eq!(batch.num_rows(), 3);

        let decoded = from_record_batch(&batch).unwrap();
        assert_eq!(decoded, updates);
        assert_eq!(decoded[0].bids()[0].price, 100.0);
        assert_eq!(decoded[0].bids()[2].price, 98.0);
        assert!(decoded[1].bids().is_empty());
        assert!(decoded[2].asks().is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let batch = to_record_batch(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert!(from_record_batch(&batch).unwrap().is_empty());
    }

    #[test]
    fn test_missing_column_is_reported() {
        let batch = to_record_batch(&[sample(1, 1, 1)]).unwrap();
        let projected = batch.project(&[0, 1, 2, 3]).unwrap();
        let err = from_record_batch(&projected).unwrap_err();
        assert!(matches!(err, SchemaError::MissingColumn("bids")));
    }

    #[test]
    fn test_parquet_readback_preserves_levels() {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
        use parquet::arrow::ArrowWriter;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("book.parquet");
        let updates = vec![sample(10, 5, 5), sample(11, 1, 0)];

        let batch = to_record_batch(&updates).unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let mut decoded = Vec::new();
        for batch in reader {
            decoded.extend(from_record_batch(&batch.unwrap()).unwrap());
        }
        assert_eq!(decoded, updates);
    }
}
