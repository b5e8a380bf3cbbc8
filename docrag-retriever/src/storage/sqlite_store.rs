//! SQLite implementation of [`VectorStore`].
//!
//! SQLite has no vector index, so this backend keeps an IVF-flat index of its own:
//! rows are assigned to the nearest of `lists` centroids at build time and queries
//! scan only the rows of the `probes` nearest lists.
//!
//! ## Schema (per generation)
//!
//! ```sql
//! CREATE TABLE <name> (
//!     id INTEGER PRIMARY KEY,
//!     title TEXT,
//!     url TEXT NOT NULL,
//!     content TEXT NOT NULL,
//!     content_length INTEGER NOT NULL,
//!     embedding BLOB NOT NULL,           -- f16 vector
//!     list_id INTEGER NOT NULL DEFAULT 0 -- IVF list, assigned by build_staging_index
//! );
//! CREATE TABLE <name>_lists (list_id INTEGER PRIMARY KEY, centroid BLOB NOT NULL);
//! CREATE TABLE <name>_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! Deploy renames the whole triple inside one write transaction. Searches run inside
//! one read transaction, so under WAL a query sees either the old or the new
//! generation, never a mix.

use super::{
    GenerationInfo, GenerationSpec, Promotion, SearchHit, StoreStatus, TableNames, VectorStore,
    check_chunks, ivf,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docrag_context::Chunk;
use half::f16;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteExecutor, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Tables that make up one generation, as suffixes of its name.
const GENERATION_SUFFIXES: [&str; 3] = ["", "_lists", "_meta"];

/// Rows per INSERT statement; 6 binds each stays under SQLite's 32766 variable cap.
const MAX_ROWS_PER_STATEMENT: usize = 5000;

/// k-means training rows per list.
const SAMPLE_PER_LIST: usize = 50;

/// Rows loaded at once while assigning lists.
const ASSIGN_PAGE: i64 = 2000;

/// Ids per `UPDATE ... WHERE id IN (...)`.
const UPDATE_ID_BATCH: usize = 500;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// IVF tuning for the SQLite backend.
#[derive(Debug, Clone, Copy)]
pub struct IvfParams {
    pub kmeans_iterations: usize,
    pub probes: usize,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            kmeans_iterations: 10,
            probes: 10,
        }
    }
}

pub struct SqliteVectorStore {
    pool: SqlitePool,
    tables: TableNames,
    params: IvfParams,
}

impl SqliteVectorStore {
    /// Opens a store from a `sqlite:` URL or a plain file path with a pool of at
    /// most `max_connections`. In-memory URLs always use a single connection.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        tables: TableNames,
        params: IvfParams,
    ) -> Result<Self> {
        if matches!(url, "sqlite::memory:" | ":memory:") {
            return Self::open_memory(tables, params).await;
        }
        let options = if url.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(url)?
        } else {
            SqliteConnectOptions::new().filename(url)
        };
        Self::with_options(options, max_connections, tables, params).await
    }

    /// Opens (creating if needed) a database file.
    pub async fn open(path: &Path, tables: TableNames, params: IvfParams) -> Result<Self> {
        Self::with_options(
            SqliteConnectOptions::new().filename(path),
            DEFAULT_MAX_CONNECTIONS,
            tables,
            params,
        )
        .await
    }

    /// In-memory store on a single long-lived connection, for tests.
    pub async fn open_memory(tables: TableNames, params: IvfParams) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        Ok(Self {
            pool,
            tables,
            params,
        })
    }

    async fn with_options(
        options: SqliteConnectOptions,
        max_connections: u32,
        tables: TableNames,
        params: IvfParams,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(
                options
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5)),
            )
            .await?;
        Ok(Self {
            pool,
            tables,
            params,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Names of all user tables, sorted.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn require_staging(&self) -> Result<()> {
        if table_exists(&self.pool, &self.tables.staging).await? {
            Ok(())
        } else {
            Err(Error::consistency(
                "no staging generation exists; prepare must run first",
            ))
        }
    }

    /// Trains centroids on an evenly strided sample of staging rows.
    async fn train_centroids(&self, rows: usize, lists: usize) -> Result<Vec<Vec<f32>>> {
        let sample_size = (lists * SAMPLE_PER_LIST).min(rows);
        let step = rows.div_ceil(sample_size);
        let sql = format!(
            "SELECT embedding FROM (
                 SELECT embedding, ROW_NUMBER() OVER (ORDER BY id) AS rn FROM {}
             ) WHERE (rn - 1) % ? = 0 LIMIT ?",
            self.tables.staging
        );
        let blobs: Vec<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(step as i64)
            .bind(sample_size as i64)
            .fetch_all(&self.pool)
            .await?;
        let sample: Vec<Vec<f32>> = blobs.iter().map(|b| decode_embedding(b)).collect();

        let iterations = self.params.kmeans_iterations;
        tracing::debug!(
            "Training {} lists on {} of {} rows",
            lists,
            sample.len(),
            rows
        );
        let centroids =
            tokio::task::spawn_blocking(move || ivf::kmeans(&sample, lists, iterations)).await?;
        Ok(centroids)
    }

    /// Writes centroids and assigns every staging row to its nearest list.
    async fn assign_lists(
        &self,
        conn: &mut SqliteConnection,
        centroids: Vec<Vec<f32>>,
    ) -> Result<()> {
        let staging = &self.tables.staging;
        sqlx::query(&format!("DELETE FROM {staging}_lists"))
            .execute(&mut *conn)
            .await?;
        for (list_id, centroid) in centroids.iter().enumerate() {
            sqlx::query(&format!(
                "INSERT INTO {staging}_lists (list_id, centroid) VALUES (?, ?)"
            ))
            .bind(list_id as i64)
            .bind(encode_embedding(centroid))
            .execute(&mut *conn)
            .await?;
        }

        let centroids = Arc::new(centroids);
        let page_sql = format!("SELECT id, embedding FROM {staging} WHERE id > ? ORDER BY id LIMIT ?");
        let mut last_id = 0i64;
        loop {
            let page: Vec<(i64, Vec<u8>)> = sqlx::query_as(&page_sql)
                .bind(last_id)
                .bind(ASSIGN_PAGE)
                .fetch_all(&mut *conn)
                .await?;
            let Some(page_end) = page.last().map(|(id, _)| *id) else {
                break;
            };
            last_id = page_end;

            let centroids = Arc::clone(&centroids);
            let groups = tokio::task::spawn_blocking(move || {
                let mut groups: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
                for (id, blob) in &page {
                    let list = ivf::nearest(&decode_embedding(blob), &centroids);
                    groups.entry(list).or_default().push(*id);
                }
                groups
            })
            .await?;

            for (list, ids) in groups {
                for batch in ids.chunks(UPDATE_ID_BATCH) {
                    let mut builder = QueryBuilder::<Sqlite>::new(format!(
                        "UPDATE {staging} SET list_id = "
                    ));
                    builder.push_bind(list as i64).push(" WHERE id IN (");
                    let mut separated = builder.separated(", ");
                    for id in batch {
                        separated.push_bind(*id);
                    }
                    separated.push_unseparated(")");
                    builder.build().execute(&mut *conn).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    async fn prepare_staging(&self, spec: &GenerationSpec) -> Result<()> {
        let staging = &self.tables.staging;
        let generation = Utc::now().format("%Y%m%d%H%M%S%9f").to_string();

        let mut tx = self.pool.begin().await?;
        drop_generation(&mut tx, staging).await?;
        sqlx::query(&format!(
            "CREATE TABLE {staging} (
                id INTEGER PRIMARY KEY,
                title TEXT,
                url TEXT NOT NULL,
                content TEXT NOT NULL,
                content_length INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                list_id INTEGER NOT NULL DEFAULT 0
            )"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE {staging}_lists (list_id INTEGER PRIMARY KEY, centroid BLOB NOT NULL)"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE {staging}_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)"
        ))
        .execute(&mut *tx)
        .await?;

        write_meta(&mut tx, staging, "model", &spec.model).await?;
        write_meta(&mut tx, staging, "dimension", &spec.dimension.to_string()).await?;
        write_meta(&mut tx, staging, "generation", &generation).await?;
        tx.commit().await?;

        tracing::info!("Prepared staging generation {} in {}", generation, staging);
        Ok(())
    }

    async fn insert_staging(&self, chunks: &[Chunk]) -> Result<u64> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let staging = &self.tables.staging;

        let mut tx = self.pool.begin().await?;
        if !table_exists(&mut *tx, staging).await? {
            return Err(Error::consistency(
                "no staging generation exists; prepare must run first",
            ));
        }
        let meta = read_meta(&mut tx, staging).await?;
        check_chunks(chunks, meta_usize(&meta, "dimension")?)?;

        let mut written = 0u64;
        for batch in chunks.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {staging} (title, url, content, content_length, embedding) "
            ));
            builder.push_values(batch, |mut row, chunk| {
                row.push_bind(chunk.title.clone())
                    .push_bind(chunk.url.clone())
                    .push_bind(chunk.content.clone())
                    .push_bind(chunk.content_length as i64)
                    .push_bind(encode_embedding(
                        chunk.embedding.as_deref().unwrap_or_default(),
                    ));
            });
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn staging_row_count(&self) -> Result<u64> {
        self.require_staging().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.tables.staging))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn build_staging_index(&self, lists: usize) -> Result<usize> {
        let rows = self.staging_row_count().await? as usize;
        let staging = &self.tables.staging;

        let centroids = if rows > 0 && lists > 0 {
            self.train_centroids(rows, lists.min(rows)).await?
        } else {
            Vec::new()
        };
        let effective = centroids.len();

        let mut tx = self.pool.begin().await?;
        if effective > 0 {
            self.assign_lists(&mut tx, centroids).await?;
        }
        let meta = read_meta(&mut tx, staging).await?;
        let generation = meta
            .get("generation")
            .cloned()
            .unwrap_or_else(|| "0".to_string());
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {}_ivf_{generation} ON {staging} (content_length, list_id)",
            self.tables.live
        ))
        .execute(&mut *tx)
        .await?;
        write_meta(&mut tx, staging, "lists", &lists.to_string()).await?;
        write_meta(&mut tx, staging, "effective_lists", &effective.to_string()).await?;
        write_meta(&mut tx, staging, "built_at", &Utc::now().to_rfc3339()).await?;
        tx.commit().await?;

        tracing::info!(
            "Indexed {} rows in {} with {} lists (requested {})",
            rows,
            staging,
            effective,
            lists
        );
        Ok(effective)
    }

    async fn promote_staging(&self) -> Result<Promotion> {
        let TableNames {
            live,
            staging,
            retired,
        } = &self.tables;

        let mut tx = self.pool.begin().await?;
        if !table_exists(&mut *tx, staging).await? {
            return Err(Error::consistency("no staging generation to deploy"));
        }
        drop_generation(&mut tx, retired).await?;

        let had_live = table_exists(&mut *tx, live).await?;
        if had_live {
            rename_generation(&mut tx, live, retired).await?;
        }
        rename_generation(&mut tx, staging, live).await?;
        if had_live {
            drop_generation(&mut tx, retired).await?;
        }
        tx.commit().await?;

        Ok(if had_live {
            Promotion::Replaced
        } else {
            Promotion::Bootstrapped
        })
    }

    async fn live_exists(&self) -> Result<bool> {
        table_exists(&self.pool, &self.tables.live).await
    }

    async fn live_metadata(&self) -> Result<GenerationInfo> {
        let mut tx = self.pool.begin().await?;
        let info = read_generation(&mut tx, &self.tables.live).await?;
        tx.commit().await?;
        info.ok_or_else(not_deployed)
    }

    async fn search_live(
        &self,
        query: &[f32],
        content_length: Option<usize>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let live = &self.tables.live;
        let mut tx = self.pool.begin().await?;
        let info = read_generation(&mut tx, live)
            .await?
            .ok_or_else(not_deployed)?;
        if query.len() != info.dimension {
            return Err(Error::consistency(format!(
                "query has {} dimensions, live generation has {}",
                query.len(),
                info.dimension
            )));
        }

        let lists: Vec<(i64, Vec<u8>)> = sqlx::query_as(&format!(
            "SELECT list_id, centroid FROM {live}_lists ORDER BY list_id"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let probed: Option<Vec<i64>> = if lists.is_empty() {
            None
        } else {
            let centroids: Vec<Vec<f32>> = lists.iter().map(|(_, b)| decode_embedding(b)).collect();
            let nearest = ivf::nearest_lists(query, &centroids, self.params.probes);
            Some(nearest.into_iter().map(|i| lists[i].0).collect())
        };

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT id, embedding FROM {live} WHERE 1 = 1"));
        if let Some(content_length) = content_length {
            builder
                .push(" AND content_length = ")
                .push_bind(content_length as i64);
        }
        if let Some(list_ids) = &probed {
            builder.push(" AND list_id IN (");
            let mut separated = builder.separated(", ");
            for id in list_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }
        let candidates: Vec<(i64, Vec<u8>)> =
            builder.build_query_as().fetch_all(&mut *tx).await?;

        let mut ranked: Vec<(i64, f32)> = candidates
            .iter()
            .map(|(id, blob)| (*id, ivf::cosine_distance(query, &decode_embedding(blob))))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        if ranked.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT id, title, url, content, content_length FROM {live} WHERE id IN ("
        ));
        let mut separated = builder.separated(", ");
        for (id, _) in &ranked {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let rows = builder.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let mut by_id: HashMap<i64, sqlx::sqlite::SqliteRow> =
            rows.into_iter().map(|row| (row.get("id"), row)).collect();
        let hits = ranked
            .into_iter()
            .filter_map(|(id, distance)| {
                let row = by_id.remove(&id)?;
                let content_length: i64 = row.get("content_length");
                Some(SearchHit {
                    id,
                    title: row.get("title"),
                    url: row.get("url"),
                    content: row.get("content"),
                    content_length: content_length as usize,
                    distance,
                })
            })
            .collect();
        Ok(hits)
    }

    async fn status(&self) -> Result<StoreStatus> {
        let mut tx = self.pool.begin().await?;
        let live = read_generation(&mut tx, &self.tables.live).await?;
        let staging_present = table_exists(&mut *tx, &self.tables.staging).await?;
        let mut rows_by_granularity = BTreeMap::new();
        if live.is_some() {
            let counts: Vec<(i64, i64)> = sqlx::query_as(&format!(
                "SELECT content_length, COUNT(*) FROM {} GROUP BY content_length",
                self.tables.live
            ))
            .fetch_all(&mut *tx)
            .await?;
            for (content_length, count) in counts {
                rows_by_granularity.insert(content_length as usize, count as u64);
            }
        }
        tx.commit().await?;

        Ok(StoreStatus {
            backend: self.backend_name().to_string(),
            live,
            staging_present,
            rows_by_granularity,
        })
    }
}

fn not_deployed() -> Error {
    Error::not_ready("no index generation has been deployed yet")
}

/// Stores an embedding as f16 values in native byte order.
fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let halves: Vec<f16> = embedding.iter().map(|x| f16::from_f32(*x)).collect();
    bytemuck::cast_slice(&halves).to_vec()
}

/// Blob bytes carry no alignment guarantee, so values are read pairwise rather
/// than cast in place.
fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f16::from_ne_bytes([pair[0], pair[1]]).to_f32())
        .collect()
}

async fn table_exists<'e>(executor: impl SqliteExecutor<'e>, name: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(executor)
            .await?;
    Ok(count > 0)
}

async fn drop_generation(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    for suffix in GENERATION_SUFFIXES {
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}{suffix}"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn rename_generation(conn: &mut SqliteConnection, from: &str, to: &str) -> Result<()> {
    for suffix in GENERATION_SUFFIXES {
        sqlx::query(&format!("ALTER TABLE {from}{suffix} RENAME TO {to}{suffix}"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn write_meta(conn: &mut SqliteConnection, table: &str, key: &str, value: &str) -> Result<()> {
    sqlx::query(&format!(
        "INSERT OR REPLACE INTO {table}_meta (key, value) VALUES (?, ?)"
    ))
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_meta(conn: &mut SqliteConnection, table: &str) -> Result<HashMap<String, String>> {
    let pairs: Vec<(String, String)> =
        sqlx::query_as(&format!("SELECT key, value FROM {table}_meta"))
            .fetch_all(&mut *conn)
            .await?;
    Ok(pairs.into_iter().collect())
}

fn meta_usize(meta: &HashMap<String, String>, key: &str) -> Result<usize> {
    meta.get(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::consistency(format!("generation metadata is missing {key}")))
}

async fn read_generation(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Option<GenerationInfo>> {
    if !table_exists(&mut *conn, table).await? {
        return Ok(None);
    }
    let meta = read_meta(conn, table).await?;
    let row_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(&mut *conn)
        .await?;

    Ok(Some(GenerationInfo {
        generation: meta.get("generation").cloned().unwrap_or_default(),
        model: meta.get("model").cloned().unwrap_or_default(),
        dimension: meta_usize(&meta, "dimension")?,
        lists: meta_usize(&meta, "lists").unwrap_or(0),
        effective_lists: meta_usize(&meta, "effective_lists").unwrap_or(0),
        row_count: row_count as u64,
        built_at: meta
            .get("built_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc)),
    }))
}
