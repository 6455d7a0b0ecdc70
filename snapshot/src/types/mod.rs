mod chunk;
mod event;
mod job;
mod table_row;
mod worker;

pub use chunk::*;
pub use event::*;
pub use job::*;
pub use table_row::*;
pub use worker::*;

pub use snapshot_postgres::schema::{ColumnSchema, TableName, TableSchema};
pub use tokio_postgres::types::PgLsn;
