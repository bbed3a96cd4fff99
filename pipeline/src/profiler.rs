//! Per-column statistics used to short-list inclusion candidates.

use diesel::prelude::*;
use diesel::sql_types::Jsonb;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::catalog::{Dataset, DatasetId};
use crate::error::PipelineError;
use crate::models::ColumnProfileRow;
use crate::raw::{quote_ident, ColumnKind, RawColumn, TableDescriptor};
use crate::schema::columns;

/// Columns with fewer distinct values are too coarse to be keys.
pub const MIN_DISTINCT: i64 = 4;

/// Borough columns hold the five boroughs plus an "unknown"; anything that
/// small is an enumeration, not a key.
pub const BOROUGH_PREFIX: &str = "boro";
pub const MIN_BOROUGH_DISTINCT: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProfile {
    pub dataset: DatasetId,
    pub column: String,
    pub unique: bool,
    pub distinct_count: i64,
    pub is_text: bool,
    /// Character length bounds for text, value bounds for integers.
    pub min_len: i64,
    pub max_len: i64,
    /// Byte-wise bounds of text values; empty for integers.
    pub min_text: String,
    pub max_text: String,
}

impl ColumnProfile {
    /// Whether every value of `self` could, by the stored aggregates alone,
    /// also occur in `source`. Never rejects a true inclusion.
    pub fn may_be_included_in(&self, source: &ColumnProfile) -> bool {
        self.is_text == source.is_text
            && self.distinct_count <= source.distinct_count
            && self.min_len >= source.min_len
            && self.max_len <= source.max_len
            && (!self.is_text
                || (self.min_text >= source.min_text && self.max_text <= source.max_text))
    }

    /// Whether this profile still matches `column` of the current raw table.
    /// A re-scraped table may have renamed or retyped the column since the
    /// profile was taken.
    pub fn describes(&self, column: &RawColumn) -> bool {
        self.column == column.name
            && match column.kind() {
                ColumnKind::Text => self.is_text,
                ColumnKind::Integer => !self.is_text,
                ColumnKind::Other => false,
            }
    }
}

impl From<&ColumnProfile> for ColumnProfileRow {
    fn from(profile: &ColumnProfile) -> Self {
        ColumnProfileRow {
            dataset: profile.dataset.to_string(),
            column_name: profile.column.clone(),
            is_unique: profile.unique,
            distinct_count: profile.distinct_count,
            is_text: profile.is_text,
            min_len: profile.min_len,
            max_len: profile.max_len,
            min_text: profile.min_text.clone(),
            max_text: profile.max_text.clone(),
        }
    }
}

impl TryFrom<ColumnProfileRow> for ColumnProfile {
    type Error = PipelineError;

    fn try_from(row: ColumnProfileRow) -> Result<Self, Self::Error> {
        Ok(ColumnProfile {
            dataset: row.dataset.try_into()?,
            column: row.column_name,
            unique: row.is_unique,
            distinct_count: row.distinct_count,
            is_text: row.is_text,
            min_len: row.min_len,
            max_len: row.max_len,
            min_text: row.min_text,
            max_text: row.max_text,
        })
    }
}

/// Whether a column with `distinct_count` values is worth keeping.
pub fn admits(column: &str, distinct_count: i64) -> bool {
    if distinct_count < MIN_DISTINCT {
        return false;
    }
    !(column.starts_with(BOROUGH_PREFIX) && distinct_count < MIN_BOROUGH_DISTINCT)
}

/// Columns worth aggregating: structurally text or integer, and declared as
/// number or text when the catalog knows the column at all.
pub fn profilable_columns<'a>(dataset: &Dataset, table: &'a TableDescriptor) -> Vec<&'a RawColumn> {
    table
        .columns
        .iter()
        .filter(|c| c.kind() != ColumnKind::Other)
        .filter(|c| {
            dataset
                .declared_type(&c.name)
                .map_or(true, |ty| ty.is_key_candidate())
        })
        .collect()
}

#[derive(QueryableByName)]
struct Aggregates {
    #[diesel(sql_type = Jsonb)]
    stats: Value,
}

fn aggregate_query(table: &TableDescriptor, columns: &[&RawColumn]) -> String {
    let mut selects = vec!["count(*) AS row_count".to_string()];
    for (i, column) in columns.iter().enumerate() {
        let ident = quote_ident(&column.name);
        let measure = match column.kind() {
            ColumnKind::Text => format!("length({})", ident),
            _ => format!("{}::bigint", ident),
        };
        selects.push(format!("count(DISTINCT {}) AS d{}", ident, i));
        selects.push(format!("min({}) AS lo{}", measure, i));
        selects.push(format!("max({}) AS hi{}", measure, i));
        if column.kind() == ColumnKind::Text {
            selects.push(format!("min({} COLLATE \"C\") AS tlo{}", ident, i));
            selects.push(format!("max({} COLLATE \"C\") AS thi{}", ident, i));
        }
    }

    format!(
        "SELECT to_jsonb(s) AS stats FROM (SELECT {} FROM {}) s",
        selects.join(", "),
        table.qualified_name()
    )
}

fn int_stat(stats: &Value, key: &str) -> Result<i64, PipelineError> {
    stats
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| PipelineError::Parse {
            message: format!("Aggregate {} missing from profile query", key),
        })
}

fn text_stat(stats: &Value, key: &str) -> String {
    stats
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn profiles_from_stats(
    dataset_id: &DatasetId,
    columns: &[&RawColumn],
    stats: &Value,
) -> Result<Vec<ColumnProfile>, PipelineError> {
    let row_count = int_stat(stats, "row_count")?;
    let mut profiles = Vec::new();

    for (i, column) in columns.iter().enumerate() {
        let distinct_count = int_stat(stats, &format!("d{}", i))?;
        if !admits(&column.name, distinct_count) {
            debug!(column = %column.name, distinct_count, "column skipped");
            continue;
        }

        let is_text = column.kind() == ColumnKind::Text;
        profiles.push(ColumnProfile {
            dataset: dataset_id.clone(),
            column: column.name.clone(),
            unique: distinct_count == row_count,
            distinct_count,
            is_text,
            min_len: int_stat(stats, &format!("lo{}", i))?,
            max_len: int_stat(stats, &format!("hi{}", i))?,
            min_text: text_stat(stats, &format!("tlo{}", i)),
            max_text: text_stat(stats, &format!("thi{}", i)),
        });
    }

    Ok(profiles)
}

/// Profiles the raw table of `dataset` and replaces its stored profiles.
///
/// Retained columns are upserted and profiles of columns that no longer
/// qualify are removed, so re-running on an unchanged table is a no-op.
#[instrument(skip_all, fields(dataset_id = %dataset.id), err)]
pub async fn profile_dataset(
    conn: &mut AsyncPgConnection,
    dataset: &Dataset,
    table: &TableDescriptor,
) -> Result<Vec<ColumnProfile>, PipelineError> {
    let candidates = profilable_columns(dataset, table);

    let profiles = if candidates.is_empty() {
        Vec::new()
    } else {
        let aggregates = diesel::sql_query(aggregate_query(table, &candidates))
            .get_result::<Aggregates>(conn)
            .await?;
        profiles_from_stats(&dataset.id, &candidates, &aggregates.stats)?
    };

    for profile in &profiles {
        let row = ColumnProfileRow::from(profile);
        diesel::insert_into(columns::table)
            .values(&row)
            .on_conflict((columns::dataset, columns::column_name))
            .do_update()
            .set(&row)
            .execute(conn)
            .await?;
    }

    // Stale rows are locked in (dataset, column) order before the delete
    // cascades into other datasets' edges. `find_all_inclusions` takes its
    // source locks in the same order. Two datasets that are each other's
    // source can still deadlock; Postgres then aborts one lease, which is
    // charged a retry.
    let retained: Vec<&str> = profiles.iter().map(|p| p.column.as_str()).collect();
    let stale = columns::table
        .filter(columns::dataset.eq(dataset.id.as_str()))
        .filter(columns::column_name.ne_all(retained))
        .order(columns::column_name.asc())
        .select(columns::column_name)
        .for_update()
        .load::<String>(conn)
        .await?;

    let removed = if stale.is_empty() {
        0
    } else {
        diesel::delete(
            columns::table
                .filter(columns::dataset.eq(dataset.id.as_str()))
                .filter(columns::column_name.eq_any(stale)),
        )
        .execute(conn)
        .await?
    };

    info!(
        profiled = profiles.len(),
        considered = candidates.len(),
        removed,
        "column profiles stored"
    );
    Ok(profiles)
}

/// Stored profiles of one dataset, ordered by column name.
pub async fn load_profiles(
    conn: &mut AsyncPgConnection,
    dataset_id: &DatasetId,
) -> Result<Vec<ColumnProfile>, PipelineError> {
    columns::table
        .filter(columns::dataset.eq(dataset_id.as_str()))
        .order(columns::column_name.asc())
        .select(ColumnProfileRow::as_select())
        .load::<ColumnProfileRow>(conn)
        .await?
        .into_iter()
        .map(ColumnProfile::try_from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AssetType, DataType, DeclaredColumn};
    use crate::raw::RawType;
    use chrono::Utc;
    use serde_json::json;

    fn profile(column: &str, is_text: bool, bounds: (i64, i64), text: (&str, &str)) -> ColumnProfile {
        ColumnProfile {
            dataset: "abcd-0000".parse().unwrap(),
            column: column.to_string(),
            unique: true,
            distinct_count: 10,
            is_text,
            min_len: bounds.0,
            max_len: bounds.1,
            min_text: text.0.to_string(),
            max_text: text.1.to_string(),
        }
    }

    #[test]
    fn low_cardinality_columns_are_not_admitted() {
        assert!(!admits("status", 3));
        assert!(admits("status", 4));
        assert!(!admits("borough", 6));
        assert!(!admits("boro_name", 5));
        assert!(admits("borough", 7));
        assert!(admits("neighborhood", 6));
    }

    #[test]
    fn inclusion_bounds_are_inclusive() {
        let source = profile("id", false, (0, 99), ("", ""));
        assert!(profile("id", false, (0, 99), ("", "")).may_be_included_in(&source));
        assert!(profile("id", false, (10, 20), ("", "")).may_be_included_in(&source));
        assert!(!profile("id", false, (90, 109), ("", "")).may_be_included_in(&source));

        let mut wider = profile("id", false, (0, 10), ("", ""));
        wider.distinct_count = 11;
        assert!(!wider.may_be_included_in(&source));
    }

    #[test]
    fn text_candidates_compare_text_bounds() {
        let source = profile("code", true, (1, 2), ("a", "zz"));
        assert!(profile("code", true, (1, 1), ("b", "y")).may_be_included_in(&source));
        assert!(!profile("code", true, (1, 1), ("B", "y")).may_be_included_in(&source));
        assert!(!profile("code", false, (1, 1), ("", "")).may_be_included_in(&source));
    }

    #[test]
    fn retyped_columns_are_no_longer_described() {
        let numeric = profile("id", false, (0, 99), ("", ""));
        assert!(numeric.describes(&RawColumn::new("id", RawType::BigInt)));
        assert!(!numeric.describes(&RawColumn::new("id", RawType::Text)));
        assert!(!numeric.describes(&RawColumn::new("id", RawType::Double)));
        assert!(!numeric.describes(&RawColumn::new("other", RawType::SmallInt)));

        let text = profile("code", true, (1, 2), ("a", "zz"));
        assert!(text.describes(&RawColumn::new("code", RawType::Text)));
        assert!(!text.describes(&RawColumn::new("code", RawType::Integer)));
    }

    #[test]
    fn declared_types_filter_structural_columns() {
        let declared = |sql_name: &str, data_type| DeclaredColumn {
            name: sql_name.to_string(),
            field_name: sql_name.to_string(),
            sql_name: sql_name.to_string(),
            data_type,
            description: String::new(),
        };
        let dataset = Dataset {
            id: "abcd-0000".parse().unwrap(),
            asset_type: AssetType::Dataset,
            name: "Permits".to_string(),
            description: String::new(),
            is_official: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            parents: vec![],
            columns: vec![
                declared("bin", DataType::Number),
                declared("address", DataType::Text),
                declared("phone", DataType::Phone),
            ],
        };
        let table = TableDescriptor::new(
            dataset.id.clone(),
            vec![
                RawColumn::new("bin", RawType::Integer),
                RawColumn::new("address", RawType::Text),
                RawColumn::new("phone", RawType::Text),
                RawColumn::new("fee", RawType::Double),
                RawColumn::new("extra", RawType::Text),
            ],
        )
        .unwrap();

        let names: Vec<&str> = profilable_columns(&dataset, &table)
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["bin", "address", "extra"]);
    }

    #[test]
    fn stats_map_to_profiles() {
        let dataset_id: DatasetId = "abcd-0000".parse().unwrap();
        let id = RawColumn::new("id", RawType::BigInt);
        let letter = RawColumn::new("letter", RawType::Text);
        let flag = RawColumn::new("flag", RawType::Text);
        let stats = json!({
            "row_count": 100,
            "d0": 100, "lo0": 0, "hi0": 99,
            "d1": 26, "lo1": 1, "hi1": 1, "tlo1": "a", "thi1": "z",
            "d2": 2, "lo2": 1, "hi2": 1, "tlo2": "n", "thi2": "y",
        });

        let profiles = profiles_from_stats(&dataset_id, &[&id, &letter, &flag], &stats).unwrap();

        assert_eq!(profiles.len(), 2);
        assert!(profiles[0].unique);
        assert!(!profiles[0].is_text);
        assert_eq!((profiles[0].min_len, profiles[0].max_len), (0, 99));
        assert_eq!(profiles[0].min_text, "");
        assert!(!profiles[1].unique);
        assert_eq!(profiles[1].distinct_count, 26);
        assert_eq!((profiles[1].min_text.as_str(), profiles[1].max_text.as_str()), ("a", "z"));
    }
}
