//! Table generation lifecycle on a file-backed SQLite store.

use anyhow::Result;
use docrag_context::Chunk;
use docrag_retriever::Error;
use docrag_retriever::storage::sqlite_store::{IvfParams, SqliteVectorStore};
use docrag_retriever::storage::{
    GenerationSpec, Promotion, TableNames, VectorStore, VectorStoreManager,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

fn spec() -> GenerationSpec {
    GenerationSpec {
        model: "test/model".to_string(),
        dimension: 3,
    }
}

fn chunks(url: &str, n: usize) -> Vec<Chunk> {
    (0..n)
        .map(|i| Chunk {
            title: None,
            url: url.to_string(),
            content: format!("{url} #{i}"),
            content_length: 500,
            embedding: Some(vec![1.0, i as f32, 0.5]),
        })
        .collect()
}

async fn open(path: &std::path::Path) -> Result<Arc<SqliteVectorStore>> {
    let store = SqliteVectorStore::open(
        path,
        TableNames::from_base("embeddings")?,
        IvfParams::default(),
    )
    .await?;
    Ok(Arc::new(store))
}

async fn build(store: Arc<SqliteVectorStore>, url: &str, n: usize) -> Result<Promotion> {
    let manager = VectorStoreManager::new(store, spec(), 4);
    manager.prepare().await?;
    let rows = manager.populate(&chunks(url, n)).await?;
    manager.build_index(rows).await?;
    Ok(manager.deploy(true).await?)
}

#[tokio::test]
async fn test_prepare_twice_leaves_one_empty_staging() -> Result<()> {
    let dir = tempdir()?;
    let store = open(&dir.path().join("docrag.db")).await?;
    let manager = VectorStoreManager::new(store.clone(), spec(), 4);

    manager.prepare().await?;
    manager.populate(&chunks("https://a", 5)).await?;
    manager.prepare().await?;

    assert_eq!(store.staging_row_count().await?, 0);
    assert_eq!(
        store.table_names().await?,
        vec!["embeddings_new", "embeddings_new_lists", "embeddings_new_meta"]
    );
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_then_replace() -> Result<()> {
    let dir = tempdir()?;
    let store = open(&dir.path().join("docrag.db")).await?;

    assert_eq!(build(store.clone(), "https://first", 6).await?, Promotion::Bootstrapped);
    assert_eq!(
        store.table_names().await?,
        vec!["embeddings", "embeddings_lists", "embeddings_meta"]
    );
    let first = store.live_metadata().await?;

    assert_eq!(build(store.clone(), "https://second", 3).await?, Promotion::Replaced);
    assert_eq!(
        store.table_names().await?,
        vec!["embeddings", "embeddings_lists", "embeddings_meta"]
    );

    let second = store.live_metadata().await?;
    assert_ne!(first.generation, second.generation);
    assert_eq!(second.row_count, 3);
    let hits = store.search_live(&[1.0, 0.0, 0.5], None, 100).await?;
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.url == "https://second"));
    Ok(())
}

#[tokio::test]
async fn test_generation_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("docrag.db");
    build(open(&path).await?, "https://persisted", 2).await?;

    let reopened = open(&path).await?;
    assert!(reopened.live_exists().await?);
    assert_eq!(reopened.live_metadata().await?.row_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_readers_never_see_a_missing_live_table() -> Result<()> {
    let dir = tempdir()?;
    let store = open(&dir.path().join("docrag.db")).await?;
    build(store.clone(), "https://gen-0", 8).await?;

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = store.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut queries = 0usize;
            while !done.load(Ordering::SeqCst) {
                let hits = store.search_live(&[1.0, 1.0, 0.5], None, 100).await?;
                assert!(!hits.is_empty());
                // Every answer comes from exactly one generation
                let url = &hits[0].url;
                assert!(hits.iter().all(|h| &h.url == url));
                queries += 1;
                tokio::task::yield_now().await;
            }
            Ok::<usize, Error>(queries)
        })
    };

    for generation in 1..=5 {
        let promotion = build(store.clone(), &format!("https://gen-{generation}"), 8).await?;
        assert_eq!(promotion, Promotion::Replaced);
    }
    done.store(true, Ordering::SeqCst);

    let queries = reader.await??;
    assert!(queries > 0);
    Ok(())
}

#[tokio::test]
async fn test_populate_refuses_missing_embeddings() -> Result<()> {
    let dir = tempdir()?;
    let store = open(&dir.path().join("docrag.db")).await?;
    let manager = VectorStoreManager::new(store.clone(), spec(), 2);
    manager.prepare().await?;

    let mut batch = chunks("https://a", 5);
    batch[4].embedding = None;
    assert!(matches!(
        manager.populate(&batch).await,
        Err(Error::MissingEmbedding { missing: 1, total: 5 })
    ));
    assert_eq!(store.staging_row_count().await?, 0);
    Ok(())
}
