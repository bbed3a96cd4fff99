//! DB integration tests for column profiling and inclusion inference

mod common;

use std::time::Duration;

use diesel_async::{AnsiTransactionManager, AsyncConnection, TransactionManager};
use serde_json::Value;

use common::{dataset, days_ago, id, TestDb};
use pipeline_service::catalog::{AssetType, Dataset};
use pipeline_service::error::PipelineError;
use pipeline_service::inference::{fast_filter_inclusions, find_all_inclusions, is_inclusion, load_inclusions, InclusionEdge};
use pipeline_service::profiler::{load_profiles, profile_dataset};
use pipeline_service::raw::{load_descriptor, materialize, RawColumn, RawRow, RawType, TableDescriptor};

fn letters(count: usize, width: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let letter = char::from(b'a' + i as u8);
            letter.to_string().repeat(width)
        })
        .collect()
}

fn table(dataset: &Dataset, a: impl Fn(usize) -> i64, b: &[String], rows: usize) -> (TableDescriptor, Vec<RawRow>) {
    let descriptor = TableDescriptor::new(
        dataset.id.clone(),
        vec![
            RawColumn::new("a", RawType::SmallInt),
            RawColumn::new("b", RawType::Text),
        ],
    )
    .expect("Invalid descriptor");

    let rows = (0..rows)
        .map(|i| {
            let mut row = RawRow::new();
            row.insert("a".to_string(), Value::from(a(i)));
            row.insert("b".to_string(), Value::from(b[i % b.len()].clone()));
            row
        })
        .collect();
    (descriptor, rows)
}

/// A: a = 0..99, b cycles through 26 letters
/// B: a = 0..19 five times, b cycles through 10 letters
/// C: a = 90..109 five times, b cycles through 2 two-letter values
async fn scenario() -> (TestDb, Vec<Dataset>) {
    let db = TestDb::new().await;
    let datasets = vec![
        dataset("aaaa-0000", AssetType::Dataset, days_ago(1)),
        dataset("bbbb-1111", AssetType::Dataset, days_ago(1)),
        dataset("cccc-2222", AssetType::Dataset, days_ago(1)),
    ];
    db.insert_datasets(&datasets).await;

    let tables = [
        table(&datasets[0], |i| i as i64, &letters(26, 1), 100),
        table(&datasets[1], |i| (i % 20) as i64, &letters(10, 1), 100),
        table(&datasets[2], |i| 90 + (i % 20) as i64, &letters(2, 2), 100),
    ];

    let mut conn = db.conn().await;
    for (entry, (descriptor, rows)) in datasets.iter().zip(tables.iter()) {
        materialize(&mut conn, descriptor, rows)
            .await
            .expect("Failed to materialize raw table");
        profile_dataset(&mut conn, entry, descriptor)
            .await
            .expect("Failed to profile dataset");
    }

    (db, datasets)
}

#[tokio::test]
async fn profiles_respect_admission_and_uniqueness() {
    //* Given
    let (db, _) = scenario().await;
    let mut conn = db.conn().await;

    //* When
    let a = load_profiles(&mut conn, &id("aaaa-0000")).await.unwrap();
    let c = load_profiles(&mut conn, &id("cccc-2222")).await.unwrap();

    //* Then
    let a_a = a.iter().find(|p| p.column == "a").expect("A.a profiled");
    assert!(a_a.unique);
    assert_eq!(a_a.distinct_count, 100);
    assert!(!a_a.is_text);
    assert_eq!((a_a.min_len, a_a.max_len), (0, 99));

    let a_b = a.iter().find(|p| p.column == "b").expect("A.b profiled");
    assert!(!a_b.unique);
    assert!(a_b.is_text);
    assert_eq!((a_b.min_len, a_b.max_len), (1, 1));
    assert_eq!((a_b.min_text.as_str(), a_b.max_text.as_str()), ("a", "z"));

    // Two distinct values are too few to be a key.
    assert_eq!(c.iter().map(|p| p.column.as_str()).collect::<Vec<_>>(), vec!["a"]);
}

#[tokio::test]
async fn only_the_subset_key_column_is_inferred() {
    //* Given
    let (db, _) = scenario().await;
    let mut conn = db.conn().await;

    //* When
    let candidates = fast_filter_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap();
    let edges = find_all_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap();
    let c_edges = find_all_inclusions(&mut conn, &id("cccc-2222")).await.unwrap();

    //* Then
    let expected = InclusionEdge {
        source_dataset: id("aaaa-0000"),
        source_column: "a".to_string(),
        target_dataset: id("bbbb-1111"),
        target_column: "a".to_string(),
    };
    assert_eq!(edges, vec![expected.clone()]);
    assert_eq!(load_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap(), vec![expected]);
    assert!(c_edges.is_empty());

    for edge in &edges {
        assert!(candidates.iter().any(|c| c.target_column == edge.target_column
            && c.source_dataset == edge.source_dataset
            && c.source_column == edge.source_column));
    }
}

#[tokio::test]
async fn exact_check_rejects_missing_values() {
    //* Given
    let (db, _) = scenario().await;
    let mut conn = db.conn().await;

    //* When
    let b_in_a = is_inclusion(&mut conn, &id("bbbb-1111"), "a", &id("aaaa-0000"), "a").await.unwrap();
    let c_in_a = is_inclusion(&mut conn, &id("cccc-2222"), "a", &id("aaaa-0000"), "a").await.unwrap();

    //* Then
    assert!(b_in_a);
    assert!(!c_in_a);
}

#[tokio::test]
async fn reprofiling_an_unchanged_table_is_idempotent() {
    //* Given
    let (db, datasets) = scenario().await;
    let mut conn = db.conn().await;
    let before = load_profiles(&mut conn, &id("bbbb-1111")).await.unwrap();

    //* When
    let descriptor = load_descriptor(&mut conn, &id("bbbb-1111"))
        .await
        .unwrap()
        .expect("Descriptor recorded");
    profile_dataset(&mut conn, &datasets[1], &descriptor).await.unwrap();

    //* Then
    assert_eq!(load_profiles(&mut conn, &id("bbbb-1111")).await.unwrap(), before);
}

#[tokio::test]
async fn rerun_replaces_stale_edges() {
    //* Given
    let (db, datasets) = scenario().await;
    let mut conn = db.conn().await;
    find_all_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap();

    // B's keys now reach past A's range.
    let (descriptor, rows) = table(&datasets[1], |i| 200 + (i % 20) as i64, &letters(10, 1), 100);
    materialize(&mut conn, &descriptor, &rows).await.unwrap();
    profile_dataset(&mut conn, &datasets[1], &descriptor).await.unwrap();

    //* When
    let edges = find_all_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap();

    //* Then
    assert!(edges.is_empty());
    assert!(load_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap().is_empty());
}

#[tokio::test]
async fn rescraped_source_with_retyped_column_is_not_a_candidate() {
    //* Given
    let (db, datasets) = scenario().await;
    let mut conn = db.conn().await;

    // A is scraped again with `a` now stored as text, but not yet profiled.
    let descriptor = TableDescriptor::new(
        datasets[0].id.clone(),
        vec![RawColumn::new("a", RawType::Text), RawColumn::new("b", RawType::Text)],
    )
    .expect("Invalid descriptor");
    let (_, rows) = table(&datasets[0], |i| i as i64, &letters(26, 1), 100);
    let rows: Vec<RawRow> = rows
        .into_iter()
        .map(|mut row| {
            let a = row["a"].to_string();
            row.insert("a".to_string(), Value::from(a));
            row
        })
        .collect();
    materialize(&mut conn, &descriptor, &rows).await.unwrap();

    //* When
    let candidates = fast_filter_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap();
    let edges = find_all_inclusions(&mut conn, &id("bbbb-1111")).await;

    //* Then
    assert!(candidates.is_empty());
    assert_eq!(edges.expect("Inference should not fail for the target"), vec![]);
}

#[tokio::test]
async fn reprofiling_a_source_waits_for_inference_of_its_targets() {
    //* Given
    let (db, datasets) = scenario().await;
    let mut inferring = db.conn().await;
    AnsiTransactionManager::begin_transaction(&mut *inferring).await.unwrap();
    let edges = find_all_inclusions(&mut inferring, &id("bbbb-1111")).await.unwrap();
    assert_eq!(edges.len(), 1);

    // A is rescraped without its key column.
    let mut reprofiling = db.conn().await;
    let source = datasets[0].clone();
    let task = tokio::spawn(async move {
        let descriptor = TableDescriptor::new(source.id.clone(), vec![RawColumn::new("b", RawType::Text)])
            .expect("Invalid descriptor");
        let mut row = RawRow::new();
        row.insert("b".to_string(), Value::from("a"));
        reprofiling
            .transaction::<_, PipelineError, _>(|conn| {
                Box::pin(async move {
                    materialize(conn, &descriptor, &[row]).await?;
                    profile_dataset(conn, &source, &descriptor).await?;
                    Ok(())
                })
            })
            .await
    });

    //* When
    tokio::time::sleep(Duration::from_millis(300)).await;
    let blocked = !task.is_finished();
    AnsiTransactionManager::commit_transaction(&mut *inferring).await.unwrap();
    let reprofiled = task.await.expect("Reprofiling task panicked");

    //* Then
    assert!(blocked);
    reprofiled.expect("Reprofiling should not deadlock");
    let mut conn = db.conn().await;
    assert!(load_inclusions(&mut conn, &id("bbbb-1111")).await.unwrap().is_empty());
    assert!(load_profiles(&mut conn, &id("aaaa-0000")).await.unwrap().is_empty());
}
