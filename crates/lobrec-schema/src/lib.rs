//! lobrec-schema: the order book update record and its columnar layout
//!
//! One `OrderBookUpdate` becomes one row. Bid and ask ladders are stored as
//! `list<struct<price, size, order_count>>` so a reader recovers every level
//! exactly as it arrived.

pub mod columns;
pub mod record;

pub use columns::{
    from_record_batch, order_book_schema, to_record_batch, SchemaError, LOCAL_TIME_UNIT,
    SCHEMA_NAME, SCHEMA_VERSION,
};
pub use record::{OrderBookUpdate, PriceLevel};
