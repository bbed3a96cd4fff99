use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PipelineError;

/// Portal-assigned dataset identifier, e.g. `abcd-1234`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(value: &str) -> bool {
        let bytes = value.as_bytes();
        bytes.len() == 9
            && bytes[4] == b'-'
            && bytes
                .iter()
                .enumerate()
                .all(|(i, b)| i == 4 || b.is_ascii_lowercase() || b.is_ascii_digit())
    }
}

impl FromStr for DatasetId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(PipelineError::InvalidDatasetId {
                value: s.to_string(),
            })
        }
    }
}

impl TryFrom<String> for DatasetId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(PipelineError::InvalidDatasetId { value })
        }
    }
}

impl From<DatasetId> for String {
    fn from(id: DatasetId) -> Self {
        id.0
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    diesel::AsExpression,
    diesel::FromSqlRow,
)]
#[diesel(sql_type = crate::schema::sql_types::AssetType)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Calendar,
    Chart,
    Datalens,
    Dataset,
    File,
    Filter,
    Href,
    Map,
    Visualization,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Calendar => "calendar",
            AssetType::Chart => "chart",
            AssetType::Datalens => "datalens",
            AssetType::Dataset => "dataset",
            AssetType::File => "file",
            AssetType::Filter => "filter",
            AssetType::Href => "href",
            AssetType::Map => "map",
            AssetType::Visualization => "visualization",
        }
    }

    /// Only tabular datasets and maps carry rows worth scraping.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, AssetType::Dataset | AssetType::Map)
    }
}

impl FromStr for AssetType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "calendar" => AssetType::Calendar,
            "chart" => AssetType::Chart,
            "datalens" => AssetType::Datalens,
            "dataset" => AssetType::Dataset,
            "file" => AssetType::File,
            "filter" => AssetType::Filter,
            "href" => AssetType::Href,
            "map" => AssetType::Map,
            "visualization" => AssetType::Visualization,
            other => {
                return Err(PipelineError::Parse {
                    message: format!("Unknown asset type: {}", other),
                })
            }
        })
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Semantic column type declared by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    CalendarDate,
    Checkbox,
    Date,
    Email,
    Html,
    Location,
    Money,
    MultiLine,
    MultiPolygon,
    Number,
    Percent,
    Phone,
    Point,
    Text,
    Url,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::CalendarDate => "calendar_date",
            DataType::Checkbox => "checkbox",
            DataType::Date => "date",
            DataType::Email => "email",
            DataType::Html => "html",
            DataType::Location => "location",
            DataType::Money => "money",
            DataType::MultiLine => "multi_line",
            DataType::MultiPolygon => "multi_polygon",
            DataType::Number => "number",
            DataType::Percent => "percent",
            DataType::Phone => "phone",
            DataType::Point => "point",
            DataType::Text => "text",
            DataType::Url => "url",
        }
    }

    /// Whether columns of this declared type may hold join keys.
    pub fn is_key_candidate(&self) -> bool {
        matches!(self, DataType::Number | DataType::Text)
    }
}

impl FromStr for DataType {
    type Err = PipelineError;

    /// Accepts both the stored snake_case form and the spellings used by the
    /// catalog API (`calendar date`, `multiline`, ...), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "calendar_date" | "calendar date" => DataType::CalendarDate,
            "checkbox" => DataType::Checkbox,
            "date" => DataType::Date,
            "email" => DataType::Email,
            "html" => DataType::Html,
            "location" => DataType::Location,
            "money" => DataType::Money,
            "multi_line" | "multiline" => DataType::MultiLine,
            "multi_polygon" | "multipolygon" => DataType::MultiPolygon,
            "number" => DataType::Number,
            "percent" => DataType::Percent,
            "phone" => DataType::Phone,
            "point" => DataType::Point,
            "text" => DataType::Text,
            "url" => DataType::Url,
            other => {
                return Err(PipelineError::Parse {
                    message: format!("Unknown data type: {}", other),
                })
            }
        })
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredColumn {
    /// Human-readable column name as it appears in exports.
    pub name: String,
    pub field_name: String,
    /// Postgres-safe name used in the raw table.
    pub sql_name: String,
    pub data_type: DataType,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub asset_type: AssetType,
    pub name: String,
    pub description: String,
    pub is_official: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parents: Vec<DatasetId>,
    pub columns: Vec<DeclaredColumn>,
}

impl Dataset {
    /// Derived views (non-empty parents) are never scheduled; their rows
    /// already live in the parent.
    pub fn is_schedulable(&self) -> bool {
        self.asset_type.is_schedulable() && self.parents.is_empty()
    }

    /// Declared semantic type of a raw-table column, when the catalog has one.
    pub fn declared_type(&self, sql_name: &str) -> Option<DataType> {
        self.columns
            .iter()
            .find(|c| c.sql_name == sql_name)
            .map(|c| c.data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_id_requires_fixed_width_code() {
        assert!("abcd-1234".parse::<DatasetId>().is_ok());
        assert!("abcd1234".parse::<DatasetId>().is_err());
        assert!("ABCD-1234".parse::<DatasetId>().is_err());
        assert!("abcd-12345".parse::<DatasetId>().is_err());
        assert!("ab-d-1234".parse::<DatasetId>().is_err());
    }

    #[test]
    fn data_type_accepts_catalog_spellings() {
        assert_eq!(
            "Calendar date".parse::<DataType>().unwrap(),
            DataType::CalendarDate
        );
        assert_eq!("multiline".parse::<DataType>().unwrap(), DataType::MultiLine);
        assert_eq!(
            DataType::MultiPolygon.as_str().parse::<DataType>().unwrap(),
            DataType::MultiPolygon
        );
        assert!("blob".parse::<DataType>().is_err());
    }

    #[test]
    fn only_root_datasets_and_maps_are_schedulable() {
        let mut dataset = Dataset {
            id: "abcd-0000".parse().unwrap(),
            asset_type: AssetType::Dataset,
            name: "Trees".to_string(),
            description: String::new(),
            is_official: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            parents: vec![],
            columns: vec![],
        };
        assert!(dataset.is_schedulable());

        dataset.asset_type = AssetType::Chart;
        assert!(!dataset.is_schedulable());

        dataset.asset_type = AssetType::Map;
        dataset.parents = vec!["efgh-5678".parse().unwrap()];
        assert!(!dataset.is_schedulable());
    }
}
