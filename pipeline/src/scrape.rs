//! Scrape stage: downloads a dataset's rows, coerces them to the declared
//! column types and materialises them as the dataset's raw table.

use std::io::Read;

use diesel_async::AsyncPgConnection;
use serde::Deserialize;
use serde_json::{Number, Value};
use tracing::{info, instrument};

use crate::catalog::{AssetType, DataType, Dataset, DatasetId};
use crate::error::PipelineError;
use crate::queue::Stage;
use crate::raw::{materialize, RawColumn, RawRow, RawType, TableDescriptor, MAX_IDENTIFIER_LEN};
use crate::socrata::{sql_name, SocrataClient};
use crate::worker::StageHandler;

/// Cell values treated as missing, compared case-insensitively.
const NULL_TOKENS: [&str; 6] = ["", "null", "n/a", "na", "nan", "none"];

pub fn is_null_token(value: &str) -> bool {
    NULL_TOKENS.iter().any(|token| value.eq_ignore_ascii_case(token))
}

/// A column converted to its storage type, one JSON value per row.
#[derive(Debug, Clone, PartialEq)]
pub struct CoercedColumn {
    pub raw_type: RawType,
    pub values: Vec<Value>,
}

fn mismatch(field: &str, expected: DataType, actual: &str) -> PipelineError {
    PipelineError::TypeCoercion {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn passthrough(raw_type: RawType, values: Vec<Option<String>>) -> CoercedColumn {
    CoercedColumn {
        raw_type,
        values: values
            .into_iter()
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .collect(),
    }
}

/// Converts the non-null cells of a CSV column according to its declared
/// semantic type.
pub fn coerce_column(
    field: &str,
    data_type: DataType,
    values: Vec<Option<String>>,
) -> Result<CoercedColumn, PipelineError> {
    match data_type {
        DataType::CalendarDate => Ok(passthrough(RawType::Date, values)),
        DataType::Date => Ok(passthrough(RawType::Timestamptz, values)),
        DataType::Money => Ok(passthrough(RawType::Money, values)),
        DataType::Checkbox => coerce_checkbox(field, values),
        DataType::Number => coerce_number(field, values),
        DataType::Percent => coerce_percent(field, values),
        DataType::Email
        | DataType::Html
        | DataType::Location
        | DataType::MultiLine
        | DataType::MultiPolygon
        | DataType::Phone
        | DataType::Point
        | DataType::Text
        | DataType::Url => Ok(passthrough(RawType::Text, values)),
    }
}

fn coerce_checkbox(field: &str, values: Vec<Option<String>>) -> Result<CoercedColumn, PipelineError> {
    let values = values
        .into_iter()
        .map(|value| match value {
            None => Ok(Value::Null),
            Some(v) => match v.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch(field, DataType::Checkbox, "text")),
            },
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CoercedColumn {
        raw_type: RawType::Boolean,
        values,
    })
}

fn coerce_number(field: &str, values: Vec<Option<String>>) -> Result<CoercedColumn, PipelineError> {
    let integers = values
        .iter()
        .map(|value| match value {
            None => Some(None),
            Some(v) => v.trim().parse::<i64>().ok().map(Some),
        })
        .collect::<Option<Vec<Option<i64>>>>();

    if let Some(integers) = integers {
        let bounds = integers.iter().flatten().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((v.min(lo), v.max(hi))),
        });
        // An all-null column has no range to fit; keep the widest type.
        let raw_type = bounds
            .map(|(lo, hi)| RawType::integer_for_range(lo, hi))
            .unwrap_or(RawType::BigInt);
        return Ok(CoercedColumn {
            raw_type,
            values: integers
                .into_iter()
                .map(|v| v.map(Value::from).unwrap_or(Value::Null))
                .collect(),
        });
    }

    let values = values
        .into_iter()
        .map(|value| match value {
            None => Ok(Value::Null),
            Some(v) => parse_finite(&v).ok_or_else(|| mismatch(field, DataType::Number, "text")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CoercedColumn {
        raw_type: RawType::Double,
        values,
    })
}

fn coerce_percent(field: &str, values: Vec<Option<String>>) -> Result<CoercedColumn, PipelineError> {
    let values = values
        .into_iter()
        .map(|value| match value {
            None => Ok(Value::Null),
            Some(v) => v
                .strip_suffix('%')
                .and_then(parse_finite)
                .ok_or_else(|| mismatch(field, DataType::Percent, "text")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CoercedColumn {
        raw_type: RawType::Numeric,
        values,
    })
}

fn parse_finite(value: &str) -> Option<Value> {
    let number = value.trim().parse::<f64>().ok()?;
    Number::from_f64(number).map(Value::Number)
}

/// Transposes coerced columns into rows keyed by column name.
fn into_rows(descriptor: &TableDescriptor, columns: Vec<Vec<Value>>, row_count: usize) -> Vec<RawRow> {
    let mut columns: Vec<_> = columns.into_iter().map(Vec::into_iter).collect();
    (0..row_count)
        .map(|_| {
            descriptor
                .columns
                .iter()
                .zip(columns.iter_mut())
                .map(|(column, values)| (column.name.clone(), values.next().unwrap_or(Value::Null)))
                .collect::<RawRow>()
        })
        .collect()
}

/// Parses a rows export, keeping the declared columns in declared order
/// under their SQL names.
pub fn parse_rows_csv<R: Read>(
    dataset: &Dataset,
    reader: R,
) -> Result<(TableDescriptor, Vec<RawRow>), PipelineError> {
    if let Some(column) = dataset
        .columns
        .iter()
        .find(|c| c.sql_name.len() > MAX_IDENTIFIER_LEN)
    {
        return Err(PipelineError::ColumnNameTooLong {
            field: column.sql_name.clone(),
        });
    }

    let mut csv = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
    let headers = csv.headers()?.clone();
    let positions = dataset
        .columns
        .iter()
        .map(|column| {
            headers
                .iter()
                .position(|header| header == column.name)
                .ok_or_else(|| PipelineError::Parse {
                    message: format!("Column {:?} missing from export of {}", column.name, dataset.id),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); positions.len()];
    let mut row_count = 0;
    for record in csv.records() {
        let record = record?;
        for (values, &position) in cells.iter_mut().zip(&positions) {
            let value = record.get(position).unwrap_or_default();
            values.push((!is_null_token(value)).then(|| value.to_string()));
        }
        row_count += 1;
    }

    let mut raw_columns = Vec::with_capacity(cells.len());
    let mut coerced = Vec::with_capacity(cells.len());
    for (declared, values) in dataset.columns.iter().zip(cells) {
        let column = coerce_column(&declared.sql_name, declared.data_type, values)?;
        raw_columns.push(RawColumn::new(declared.sql_name.clone(), column.raw_type));
        coerced.push(column.values);
    }

    let descriptor = TableDescriptor::new(dataset.id.clone(), raw_columns)?;
    let rows = into_rows(&descriptor, coerced, row_count);
    Ok((descriptor, rows))
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
}

fn infer_property(values: Vec<Option<Value>>) -> CoercedColumn {
    let as_integer = |v: &Value| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let as_float = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    };

    if values.iter().flatten().all(|v| as_integer(v).is_some()) {
        return CoercedColumn {
            raw_type: RawType::BigInt,
            values: values
                .iter()
                .map(|v| v.as_ref().and_then(as_integer).map(Value::from).unwrap_or(Value::Null))
                .collect(),
        };
    }
    if values.iter().flatten().all(|v| as_float(v).is_some()) {
        return CoercedColumn {
            raw_type: RawType::Double,
            values: values
                .iter()
                .map(|v| {
                    v.as_ref()
                        .and_then(as_float)
                        .and_then(Number::from_f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                })
                .collect(),
        };
    }
    CoercedColumn {
        raw_type: RawType::Text,
        values: values
            .into_iter()
            .map(|v| match v {
                None => Value::Null,
                Some(Value::String(s)) => Value::String(s),
                Some(other) => Value::String(other.to_string()),
            })
            .collect(),
    }
}

/// Parses a GeoJSON export into a table of feature properties. Geometry is
/// dropped and each property column is typed as integer, float or text.
pub fn parse_geojson(
    dataset_id: &DatasetId,
    body: &[u8],
) -> Result<(TableDescriptor, Vec<RawRow>), PipelineError> {
    let collection: FeatureCollection = serde_json::from_slice(body)?;
    let features: Vec<serde_json::Map<String, Value>> = collection
        .features
        .into_iter()
        .map(|f| f.properties.unwrap_or_default())
        .collect();

    // Property maps iterate in key order, so columns come out sorted by name.
    let mut keys: Vec<&str> = Vec::new();
    for properties in &features {
        for key in properties.keys() {
            if !keys.contains(&key.as_str()) {
                keys.push(key);
            }
        }
    }

    let mut raw_columns: Vec<RawColumn> = Vec::with_capacity(keys.len());
    let mut coerced = Vec::with_capacity(keys.len());
    for key in &keys {
        let name = sql_name(key);
        if raw_columns.iter().any(|c| c.name == name) {
            return Err(PipelineError::Parse {
                message: format!("Property {:?} of {} collides with another column", key, dataset_id),
            });
        }

        let values = features
            .iter()
            .map(|properties| match properties.get(*key) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) if is_null_token(s) => None,
                Some(value) => Some(value.clone()),
            })
            .collect();
        let column = infer_property(values);
        raw_columns.push(RawColumn::new(name, column.raw_type));
        coerced.push(column.values);
    }

    let descriptor = TableDescriptor::new(dataset_id.clone(), raw_columns)?;
    let rows = into_rows(&descriptor, coerced, features.len());
    Ok((descriptor, rows))
}

/// Downloads a dataset and replaces its raw table.
#[derive(Clone)]
pub struct ScrapeStage {
    client: SocrataClient,
}

impl ScrapeStage {
    pub fn new(client: SocrataClient) -> Self {
        Self { client }
    }

    /// Downloads and parses a dataset without touching the database.
    #[instrument(skip_all, fields(dataset_id = %dataset.id, asset_type = %dataset.asset_type), err)]
    pub async fn fetch(&self, dataset: &Dataset) -> Result<(TableDescriptor, Vec<RawRow>), PipelineError> {
        if !dataset.columns.is_empty() {
            let file = self.client.download_rows_csv(&dataset.id).await?;
            let dataset = dataset.clone();
            tokio::task::spawn_blocking(move || {
                let reader = std::io::BufReader::new(file.reopen()?);
                parse_rows_csv(&dataset, reader)
            })
            .await
            .map_err(|e| PipelineError::Io {
                message: format!("CSV parser task failed: {}", e),
            })?
        } else if dataset.asset_type == AssetType::Map {
            let file = self.client.download_geojson(&dataset.id).await?;
            let body = tokio::fs::read(file.path()).await?;
            parse_geojson(&dataset.id, &body)
        } else {
            Err(PipelineError::UnsupportedAsset {
                dataset_id: dataset.id.to_string(),
                message: format!("{} without declared columns", dataset.asset_type),
            })
        }
    }
}

impl StageHandler for ScrapeStage {
    fn stage(&self) -> Stage {
        Stage::Scrape
    }

    async fn run(&self, conn: &mut AsyncPgConnection, dataset: &Dataset) -> Result<(), PipelineError> {
        let (descriptor, rows) = self.fetch(dataset).await?;
        materialize(conn, &descriptor, &rows).await?;
        info!(
            dataset_id = %dataset.id,
            columns = descriptor.columns.len(),
            rows = rows.len(),
            "raw table materialised"
        );
        Ok(())
    }
}
