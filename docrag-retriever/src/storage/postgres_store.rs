//! pgvector implementation of [`VectorStore`], enabled by the `postgres` feature.
//!
//! Each generation is a `<name>` table with a `vector(<dimension>)` column plus a
//! `<name>_meta` key/value table. The ANN index is pgvector's `ivfflat` over
//! `vector_cosine_ops`, matching the `<=>` operator used by queries. Postgres DDL is
//! transactional, so deploy renames and drops inside one transaction.

use super::{
    GenerationInfo, GenerationSpec, Promotion, SearchHit, StoreStatus, TableNames, VectorStore,
    check_chunks,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docrag_context::Chunk;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashMap};

const GENERATION_SUFFIXES: [&str; 2] = ["", "_meta"];

/// Rows per INSERT statement; 5 binds each stays under the 65535 parameter cap.
const MAX_ROWS_PER_STATEMENT: usize = 10_000;

pub struct PgVectorStore {
    pool: PgPool,
    tables: TableNames,
    probes: usize,
}

impl PgVectorStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        tables: TableNames,
        probes: usize,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            tables,
            probes,
        })
    }
}

/// pgvector text form, e.g. `[0.1,0.2]`.
fn vector_literal(v: &[f32]) -> String {
    let values: Vec<String> = v.iter().map(|x| x.to_string()).collect();
    format!("[{}]", values.join(","))
}

async fn table_exists<'e>(executor: impl PgExecutor<'e>, name: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables
                        WHERE table_schema = current_schema() AND table_name = $1)",
    )
    .bind(name)
    .fetch_one(executor)
    .await?;
    Ok(exists)
}

async fn drop_generation(conn: &mut PgConnection, name: &str) -> Result<()> {
    for suffix in GENERATION_SUFFIXES {
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}{suffix}"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn rename_generation(conn: &mut PgConnection, from: &str, to: &str) -> Result<()> {
    for suffix in GENERATION_SUFFIXES {
        sqlx::query(&format!("ALTER TABLE {from}{suffix} RENAME TO {to}{suffix}"))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn write_meta(conn: &mut PgConnection, table: &str, key: &str, value: &str) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {table}_meta (key, value) VALUES ($1, $2)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"
    ))
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_meta(conn: &mut PgConnection, table: &str) -> Result<HashMap<String, String>> {
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

async fn read_generation(conn: &mut PgConnection, table: &str) -> Result<Option<GenerationInfo>> {
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

fn not_deployed() -> Error {
    Error::not_ready("no index generation has been deployed yet")
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn backend_name(&self) -> &str {
        "postgres"
    }

    async fn prepare_staging(&self, spec: &GenerationSpec) -> Result<()> {
        let staging = &self.tables.staging;
        let generation = Utc::now().format("%Y%m%d%H%M%S%9f").to_string();

        let mut tx = self.pool.begin().await?;
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&mut *tx)
            .await?;
        drop_generation(&mut tx, staging).await?;
        sqlx::query(&format!(
            "CREATE TABLE {staging} (
                id BIGSERIAL PRIMARY KEY,
                title TEXT,
                url TEXT NOT NULL,
                content TEXT NOT NULL,
                content_length INTEGER NOT NULL,
                embedding vector({}) NOT NULL
            )",
            spec.dimension
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
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {staging} (title, url, content, content_length, embedding) "
            ));
            builder.push_values(batch, |mut row, chunk| {
                row.push_bind(chunk.title.clone())
                    .push_bind(chunk.url.clone())
                    .push_bind(chunk.content.clone())
                    .push_bind(chunk.content_length as i32)
                    .push_bind(vector_literal(
                        chunk.embedding.as_deref().unwrap_or_default(),
                    ))
                    .push_unseparated("::vector");
            });
            written += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn staging_row_count(&self) -> Result<u64> {
        if !table_exists(&self.pool, &self.tables.staging).await? {
            return Err(Error::consistency(
                "no staging generation exists; prepare must run first",
            ));
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.tables.staging))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn build_staging_index(&self, lists: usize) -> Result<usize> {
        let staging = &self.tables.staging;
        let mut tx = self.pool.begin().await?;
        let meta = read_meta(&mut tx, staging).await?;
        let generation = meta
            .get("generation")
            .cloned()
            .unwrap_or_else(|| "0".to_string());
        let lists = lists.max(1);

        sqlx::query(&format!(
            "CREATE INDEX {live}_ivf_{generation} ON {staging}
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = {lists})",
            live = self.tables.live
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX {live}_cl_{generation} ON {staging} (content_length)",
            live = self.tables.live
        ))
        .execute(&mut *tx)
        .await?;
        write_meta(&mut tx, staging, "lists", &lists.to_string()).await?;
        write_meta(&mut tx, staging, "effective_lists", &lists.to_string()).await?;
        write_meta(&mut tx, staging, "built_at", &Utc::now().to_rfc3339()).await?;
        tx.commit().await?;

        tracing::info!("Built ivfflat index on {} with {} lists", staging, lists);
        Ok(lists)
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

        sqlx::query(&format!("SET LOCAL ivfflat.probes = {}", self.probes.max(1)))
            .execute(&mut *tx)
            .await?;

        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT id, title, url, content, content_length, \
             COALESCE(NULLIF(embedding <=> ",
        );
        builder
            .push_bind(vector_literal(query))
            .push("::vector, 'NaN'::float8), 1.0)::real AS distance FROM ")
            .push(live.as_str());
        if let Some(content_length) = content_length {
            builder
                .push(" WHERE content_length = ")
                .push_bind(content_length as i32);
        }
        builder
            .push(" ORDER BY embedding <=> ")
            .push_bind(vector_literal(query))
            .push("::vector, id LIMIT ")
            .push_bind(limit as i64);

        let rows = builder.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let hits = rows
            .into_iter()
            .map(|row| {
                let content_length: i32 = row.get("content_length");
                SearchHit {
                    id: row.get("id"),
                    title: row.get("title"),
                    url: row.get("url"),
                    content: row.get("content"),
                    content_length: content_length as usize,
                    distance: row.get("distance"),
                }
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
            let counts: Vec<(i32, i64)> = sqlx::query_as(&format!(
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_literal() {
        assert_eq!(vector_literal(&[0.5, -1.0, 2.0]), "[0.5,-1,2]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
