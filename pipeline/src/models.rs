use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use std::io::Write;

use crate::catalog::{AssetType, DataType, Dataset, DatasetId, DeclaredColumn};
use crate::error::PipelineError;
use crate::schema::{columns, dataset, inclusions, queue, raw_tables, sql_types};

impl ToSql<sql_types::AssetType, Pg> for AssetType {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<sql_types::AssetType, Pg> for AssetType {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let value = std::str::from_utf8(bytes.as_bytes())?;
        Ok(value.parse()?)
    }
}

#[derive(Queryable, Selectable, Identifiable, Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = dataset)]
#[diesel(primary_key(id))]
pub struct DatasetRow {
    pub id: String,
    pub asset_type: AssetType,
    pub name: String,
    pub description: String,
    pub is_official: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parents: Vec<String>,
    pub column_names: Vec<String>,
    pub column_field_names: Vec<String>,
    pub column_sql_names: Vec<String>,
    pub column_types: Vec<String>,
    pub column_descriptions: Vec<String>,
}

#[derive(Queryable, Selectable, Identifiable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = queue)]
#[diesel(primary_key(dataset_id))]
pub struct QueueEntry {
    pub dataset_id: String,
    pub freshness: DateTime<Utc>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retries: i16,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = raw_tables)]
pub struct RawTableRow {
    pub dataset_id: String,
    pub descriptor: serde_json::Value,
    pub materialized_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = columns)]
pub struct ColumnProfileRow {
    pub dataset: String,
    pub column_name: String,
    pub is_unique: bool,
    pub distinct_count: i64,
    pub is_text: bool,
    pub min_len: i64,
    pub max_len: i64,
    pub min_text: String,
    pub max_text: String,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[diesel(table_name = inclusions)]
pub struct InclusionRow {
    pub source_dataset: String,
    pub source_column: String,
    pub target_dataset: String,
    pub target_column: String,
}

impl From<&Dataset> for DatasetRow {
    fn from(dataset: &Dataset) -> Self {
        let column = |f: fn(&DeclaredColumn) -> String| -> Vec<String> {
            dataset.columns.iter().map(f).collect()
        };

        DatasetRow {
            id: dataset.id.to_string(),
            asset_type: dataset.asset_type,
            name: dataset.name.clone(),
            description: dataset.description.clone(),
            is_official: dataset.is_official,
            created_at: dataset.created_at,
            updated_at: dataset.updated_at,
            parents: dataset.parents.iter().map(|p| p.to_string()).collect(),
            column_names: column(|c| c.name.clone()),
            column_field_names: column(|c| c.field_name.clone()),
            column_sql_names: column(|c| c.sql_name.clone()),
            column_types: column(|c| c.data_type.as_str().to_string()),
            column_descriptions: column(|c| c.description.clone()),
        }
    }
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = PipelineError;

    fn try_from(row: DatasetRow) -> Result<Self, Self::Error> {
        let arity = row.column_names.len();
        if [
            row.column_field_names.len(),
            row.column_sql_names.len(),
            row.column_types.len(),
            row.column_descriptions.len(),
        ]
        .iter()
        .any(|len| *len != arity)
        {
            return Err(PipelineError::Parse {
                message: format!("Column arrays of dataset {} differ in length", row.id),
            });
        }

        let columns = row
            .column_names
            .into_iter()
            .zip(row.column_field_names)
            .zip(row.column_sql_names)
            .zip(row.column_types)
            .zip(row.column_descriptions)
            .map(
                |((((name, field_name), sql_name), data_type), description)| {
                    Ok(DeclaredColumn {
                        name,
                        field_name,
                        sql_name,
                        data_type: data_type.parse::<DataType>()?,
                        description,
                    })
                },
            )
            .collect::<Result<Vec<_>, PipelineError>>()?;

        Ok(Dataset {
            id: row.id.try_into()?,
            asset_type: row.asset_type,
            name: row.name,
            description: row.description,
            is_official: row.is_official,
            created_at: row.created_at,
            updated_at: row.updated_at,
            parents: row
                .parents
                .into_iter()
                .map(DatasetId::try_from)
                .collect::<Result<_, _>>()?,
            columns,
        })
    }
}
