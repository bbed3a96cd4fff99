//! Inclusion dependency inference.
//!
//! Candidates are short-listed from stored column profiles, then each one is
//! verified against the raw tables. The edges of a target dataset are
//! recomputed from scratch on every run.

use std::collections::HashMap;

use diesel::prelude::*;
use diesel::sql_types::Bool;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::{debug, info, instrument};

use crate::catalog::DatasetId;
use crate::error::PipelineError;
use crate::models::{ColumnProfileRow, InclusionRow};
use crate::profiler::{load_profiles, ColumnProfile};
use crate::raw::{load_descriptor, qualified_table, quote_ident, TableDescriptor};
use crate::schema::{columns, inclusions};

/// A column of the target dataset that may be included in a unique column
/// of another dataset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Candidate {
    pub target_column: String,
    pub source_dataset: DatasetId,
    pub source_column: String,
}

/// Every non-null value of `target.target_column` also occurs in
/// `source.source_column`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InclusionEdge {
    pub source_dataset: DatasetId,
    pub source_column: String,
    pub target_dataset: DatasetId,
    pub target_column: String,
}

impl From<&InclusionEdge> for InclusionRow {
    fn from(edge: &InclusionEdge) -> Self {
        InclusionRow {
            source_dataset: edge.source_dataset.to_string(),
            source_column: edge.source_column.clone(),
            target_dataset: edge.target_dataset.to_string(),
            target_column: edge.target_column.clone(),
        }
    }
}

impl TryFrom<InclusionRow> for InclusionEdge {
    type Error = PipelineError;

    fn try_from(row: InclusionRow) -> Result<Self, Self::Error> {
        Ok(InclusionEdge {
            source_dataset: row.source_dataset.try_into()?,
            source_column: row.source_column,
            target_dataset: row.target_dataset.try_into()?,
            target_column: row.target_column,
        })
    }
}

/// Pairs every target profile with every source profile that passes the
/// bound check. Only unique source columns from other datasets qualify.
pub fn candidate_pairs(targets: &[ColumnProfile], sources: &[ColumnProfile]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = targets
        .iter()
        .flat_map(|target| {
            sources
                .iter()
                .filter(move |source| {
                    source.unique
                        && source.dataset != target.dataset
                        && target.may_be_included_in(source)
                })
                .map(move |source| Candidate {
                    target_column: target.column.clone(),
                    source_dataset: source.dataset.clone(),
                    source_column: source.column.clone(),
                })
        })
        .collect();
    candidates.sort();
    candidates
}

/// Keeps the profiles that still match their dataset's current raw table.
///
/// A source re-scraped since it was last processed may have dropped or
/// retyped a profiled column; verifying such a candidate would fail the
/// target's lease for the source's sake.
async fn current_profiles(
    conn: &mut AsyncPgConnection,
    profiles: Vec<ColumnProfile>,
) -> Result<Vec<ColumnProfile>, PipelineError> {
    let mut tables: HashMap<DatasetId, Option<TableDescriptor>> = HashMap::new();
    let mut current = Vec::with_capacity(profiles.len());

    for profile in profiles {
        if !tables.contains_key(&profile.dataset) {
            let descriptor = load_descriptor(conn, &profile.dataset).await?;
            tables.insert(profile.dataset.clone(), descriptor);
        }

        let described = tables
            .get(&profile.dataset)
            .and_then(Option::as_ref)
            .and_then(|table| table.column(&profile.column))
            .is_some_and(|column| profile.describes(column));
        if described {
            current.push(profile);
        } else {
            debug!(
                dataset_id = %profile.dataset,
                column = %profile.column,
                "skipping profile of a changed raw table"
            );
        }
    }

    Ok(current)
}

/// Short-lists inclusion candidates for `dataset_id` from stored profiles.
#[instrument(skip(conn), err)]
pub async fn fast_filter_inclusions(
    conn: &mut AsyncPgConnection,
    dataset_id: &DatasetId,
) -> Result<Vec<Candidate>, PipelineError> {
    let targets = load_profiles(conn, dataset_id).await?;
    let targets = current_profiles(conn, targets).await?;
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let sources = columns::table
        .filter(columns::is_unique.eq(true))
        .filter(columns::dataset.ne(dataset_id.as_str()))
        .select(ColumnProfileRow::as_select())
        .load::<ColumnProfileRow>(conn)
        .await?
        .into_iter()
        .map(ColumnProfile::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let sources = current_profiles(conn, sources).await?;

    Ok(candidate_pairs(&targets, &sources))
}

#[derive(QueryableByName)]
struct Missing {
    #[diesel(sql_type = Bool)]
    missing: bool,
}

/// Returns whether every non-null value of `target.target_column` occurs in
/// `source.source_column`.
pub async fn is_inclusion(
    conn: &mut AsyncPgConnection,
    target: &DatasetId,
    target_column: &str,
    source: &DatasetId,
    source_column: &str,
) -> Result<bool, PipelineError> {
    let query = indoc::formatdoc!(
        r#"
            SELECT EXISTS (
                SELECT 1 FROM {target} t
                WHERE t.{tcol} IS NOT NULL
                  AND NOT EXISTS (SELECT 1 FROM {source} s WHERE s.{scol} = t.{tcol})
            ) AS missing
        "#,
        target = qualified_table(target),
        tcol = quote_ident(target_column),
        source = qualified_table(source),
        scol = quote_ident(source_column),
    );

    let row = diesel::sql_query(query).get_result::<Missing>(conn).await?;
    Ok(!row.missing)
}

/// Verifies every candidate of `dataset_id` and replaces its stored edges.
///
/// The delete and insert run in one transaction (a savepoint when called
/// under a lease); an empty result clears every prior edge of the dataset.
#[instrument(skip(conn), err)]
pub async fn find_all_inclusions(
    conn: &mut AsyncPgConnection,
    dataset_id: &DatasetId,
) -> Result<Vec<InclusionEdge>, PipelineError> {
    let candidates = fast_filter_inclusions(conn, dataset_id).await?;

    let mut edges = Vec::new();
    for candidate in &candidates {
        let confirmed = is_inclusion(
            conn,
            dataset_id,
            &candidate.target_column,
            &candidate.source_dataset,
            &candidate.source_column,
        )
        .await?;
        debug!(
            target_column = %candidate.target_column,
            source_dataset = %candidate.source_dataset,
            source_column = %candidate.source_column,
            confirmed,
            "candidate verified"
        );
        if confirmed {
            edges.push(InclusionEdge {
                source_dataset: candidate.source_dataset.clone(),
                source_column: candidate.source_column.clone(),
                target_dataset: dataset_id.clone(),
                target_column: candidate.target_column.clone(),
            });
        }
    }

    let rows: Vec<InclusionRow> = edges.iter().map(InclusionRow::from).collect();
    let target = dataset_id.as_str();
    conn.transaction::<_, PipelineError, _>(|conn| {
        Box::pin(async move {
            // Source profiles are locked before any edge, in the order
            // `profile_dataset` locks the rows it deletes.
            let mut sources = inclusions::table
                .filter(inclusions::target_dataset.eq(target))
                .select(inclusions::source_dataset)
                .load::<String>(conn)
                .await?;
            sources.extend(rows.iter().map(|row| row.source_dataset.clone()));
            sources.sort();
            sources.dedup();
            if !sources.is_empty() {
                columns::table
                    .filter(columns::dataset.eq_any(sources))
                    .order((columns::dataset.asc(), columns::column_name.asc()))
                    .select(columns::dataset)
                    .for_key_share()
                    .load::<String>(conn)
                    .await?;
            }

            diesel::delete(inclusions::table.filter(inclusions::target_dataset.eq(target)))
                .execute(conn)
                .await?;
            if !rows.is_empty() {
                diesel::insert_into(inclusions::table)
                    .values(&rows)
                    .execute(conn)
                    .await?;
            }
            Ok(())
        })
    })
    .await?;

    info!(
        candidates = candidates.len(),
        confirmed = edges.len(),
        "inclusion edges replaced"
    );
    Ok(edges)
}

/// Stored edges whose target is `dataset_id`.
pub async fn load_inclusions(
    conn: &mut AsyncPgConnection,
    dataset_id: &DatasetId,
) -> Result<Vec<InclusionEdge>, PipelineError> {
    inclusions::table
        .filter(inclusions::target_dataset.eq(dataset_id.as_str()))
        .order((inclusions::source_dataset.asc(), inclusions::source_column.asc()))
        .select(InclusionRow::as_select())
        .load::<InclusionRow>(conn)
        .await?
        .into_iter()
        .map(InclusionEdge::try_from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(
        dataset: &str,
        column: &str,
        unique: bool,
        distinct_count: i64,
        bounds: (i64, i64),
    ) -> ColumnProfile {
        ColumnProfile {
            dataset: dataset.parse().unwrap(),
            column: column.to_string(),
            unique,
            distinct_count,
            is_text: false,
            min_len: bounds.0,
            max_len: bounds.1,
            min_text: String::new(),
            max_text: String::new(),
        }
    }

    #[test]
    fn only_unique_columns_of_other_datasets_are_sources() {
        let a = profile("aaaa-0000", "a", true, 100, (0, 99));
        let b = profile("bbbb-1111", "a", false, 20, (0, 19));
        let b_self = profile("bbbb-1111", "id", true, 100, (0, 99));
        let c = profile("cccc-2222", "a", false, 20, (90, 109));

        let candidates = candidate_pairs(
            &[b.clone()],
            &[a.clone(), b_self.clone(), c.clone()],
        );
        assert_eq!(
            candidates,
            vec![Candidate {
                target_column: "a".to_string(),
                source_dataset: "aaaa-0000".parse().unwrap(),
                source_column: "a".to_string(),
            }]
        );

        assert!(candidate_pairs(&[c], &[a.clone(), b]).is_empty());
        assert!(candidate_pairs(&[a.clone()], &[a]).is_empty());
    }
}
