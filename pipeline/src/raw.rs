//! Raw per-dataset tables and the descriptor that travels with them.
//!
//! The scrape stage materialises one table per dataset under the `raw`
//! schema and records its [`TableDescriptor`] in `raw_tables`, in the same
//! transaction. Later stages load the descriptor instead of reflecting on
//! the table.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::Jsonb;
use diesel::upsert::excluded;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::catalog::DatasetId;
use crate::error::PipelineError;
use crate::models::RawTableRow;
use crate::schema::raw_tables;

pub const RAW_SCHEMA: &str = "raw";

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const INSERT_BATCH_ROWS: usize = 5_000;

/// Storage type of a raw-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawType {
    Text,
    SmallInt,
    Integer,
    BigInt,
    Double,
    Numeric,
    Boolean,
    Date,
    Timestamptz,
    Money,
}

impl RawType {
    pub fn sql(&self) -> &'static str {
        match self {
            RawType::Text => "TEXT",
            RawType::SmallInt => "SMALLINT",
            RawType::Integer => "INTEGER",
            RawType::BigInt => "BIGINT",
            RawType::Double => "DOUBLE PRECISION",
            RawType::Numeric => "NUMERIC(6, 3)",
            RawType::Boolean => "BOOLEAN",
            RawType::Date => "DATE",
            RawType::Timestamptz => "TIMESTAMP WITH TIME ZONE",
            RawType::Money => "MONEY",
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            RawType::Text => ColumnKind::Text,
            RawType::SmallInt | RawType::Integer | RawType::BigInt => ColumnKind::Integer,
            _ => ColumnKind::Other,
        }
    }

    /// Narrowest integer type holding every value in `[min, max]`.
    pub fn integer_for_range(min: i64, max: i64) -> RawType {
        if -32768 < min && max < 32767 {
            RawType::SmallInt
        } else if -2147483648 < min && max < 2147483647 {
            RawType::Integer
        } else {
            RawType::BigInt
        }
    }
}

/// Structural class of a column, fixed once when the table is described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Text,
    Integer,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub raw_type: RawType,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, raw_type: RawType) -> Self {
        Self {
            name: name.into(),
            raw_type,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        self.raw_type.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub dataset_id: DatasetId,
    pub columns: Vec<RawColumn>,
}

impl TableDescriptor {
    pub fn new(dataset_id: DatasetId, columns: Vec<RawColumn>) -> Result<Self, PipelineError> {
        for column in &columns {
            if column.name.len() > MAX_IDENTIFIER_LEN {
                return Err(PipelineError::ColumnNameTooLong {
                    field: column.name.clone(),
                });
            }
        }
        Ok(Self {
            dataset_id,
            columns,
        })
    }

    /// Fully qualified, quoted table name, e.g. `"raw"."abcd-1234"`.
    pub fn qualified_name(&self) -> String {
        qualified_table(&self.dataset_id)
    }

    pub fn column(&self, name: &str) -> Option<&RawColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

pub fn qualified_table(dataset_id: &DatasetId) -> String {
    format!(
        "{}.{}",
        quote_ident(RAW_SCHEMA),
        quote_ident(dataset_id.as_str())
    )
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// One raw row keyed by column name; values are JSON strings, numbers,
/// booleans or null and are cast by Postgres into the column types.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Replaces the raw table of a dataset with `rows` and records its descriptor.
///
/// Must run inside the caller's transaction so a failed scrape leaves the
/// previous table in place.
#[instrument(skip_all, fields(dataset_id = %descriptor.dataset_id, rows = rows.len()), err)]
pub async fn materialize(
    conn: &mut AsyncPgConnection,
    descriptor: &TableDescriptor,
    rows: &[RawRow],
) -> Result<(), PipelineError> {
    let table = descriptor.qualified_name();
    let schema = descriptor
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.raw_type.sql()))
        .collect::<Vec<_>>()
        .join(", ");

    diesel::sql_query(format!("DROP TABLE IF EXISTS {}", table))
        .execute(conn)
        .await?;
    diesel::sql_query(format!("CREATE TABLE {} ({})", table, schema))
        .execute(conn)
        .await?;

    let insert = format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)",
        table = table
    );
    for batch in rows.chunks(INSERT_BATCH_ROWS) {
        let payload = serde_json::Value::Array(
            batch
                .iter()
                .map(|row| serde_json::Value::Object(row.clone()))
                .collect(),
        );
        diesel::sql_query(&insert)
            .bind::<Jsonb, _>(payload)
            .execute(conn)
            .await?;
    }
    debug!("raw table populated");

    save_descriptor(conn, descriptor).await
}

async fn save_descriptor(
    conn: &mut AsyncPgConnection,
    descriptor: &TableDescriptor,
) -> Result<(), PipelineError> {
    let row = RawTableRow {
        dataset_id: descriptor.dataset_id.to_string(),
        descriptor: serde_json::to_value(&descriptor.columns)?,
        materialized_at: Utc::now(),
    };

    diesel::insert_into(raw_tables::table)
        .values(&row)
        .on_conflict(raw_tables::dataset_id)
        .do_update()
        .set((
            raw_tables::descriptor.eq(excluded(raw_tables::descriptor)),
            raw_tables::materialized_at.eq(excluded(raw_tables::materialized_at)),
        ))
        .execute(conn)
        .await?;

    Ok(())
}

/// Loads the descriptor recorded by the last successful scrape of a dataset.
pub async fn load_descriptor(
    conn: &mut AsyncPgConnection,
    dataset_id: &DatasetId,
) -> Result<Option<TableDescriptor>, PipelineError> {
    let descriptor = raw_tables::table
        .filter(raw_tables::dataset_id.eq(dataset_id.as_str()))
        .select(raw_tables::descriptor)
        .first::<serde_json::Value>(conn)
        .await
        .optional()?;

    descriptor
        .map(|value| -> Result<TableDescriptor, PipelineError> {
            Ok(TableDescriptor {
                dataset_id: dataset_id.clone(),
                columns: serde_json::from_value(value)?,
            })
        })
        .transpose()
}
