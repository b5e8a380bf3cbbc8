//! Build lifecycle for one staging generation.
//!
//! ```text
//! Empty ──prepare──▶ Prepared ──populate──▶ Populated ──build_index──▶ Indexed ──deploy──▶ Live
//!   ▲                   ▲ │                    │ ▲
//!   └─────── prepare ───┘ └──── populate ──────┘ └─ populate
//! ```
//!
//! `prepare` is accepted from any state and starts a fresh staging generation; the
//! live generation keeps serving until `deploy` succeeds.

use super::{GenerationSpec, Promotion, VectorStore, check_chunks};
use crate::error::{Error, Result};
use docrag_context::Chunk;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Number of IVF lists for a table of `row_count` rows.
///
/// `max(10, rows / 1000)` up to a million rows, `round(sqrt(rows))` above that.
pub fn lists_for_rows(row_count: u64) -> usize {
    if row_count > 1_000_000 {
        (row_count as f64).sqrt().round() as usize
    } else {
        std::cmp::max(10, (row_count / 1000) as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Empty,
    Prepared,
    Populated { rows: u64 },
    Indexed { rows: u64, lists: usize },
    Live,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty"),
            Self::Prepared => f.write_str("prepared"),
            Self::Populated { rows } => write!(f, "populated ({rows} rows)"),
            Self::Indexed { rows, lists } => write!(f, "indexed ({rows} rows, {lists} lists)"),
            Self::Live => f.write_str("live"),
        }
    }
}

/// Outcome of [`VectorStoreManager::build_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexReport {
    pub rows: u64,
    pub lists: usize,
    pub effective_lists: usize,
}

pub struct VectorStoreManager {
    store: Arc<dyn VectorStore>,
    spec: GenerationSpec,
    insert_batch_size: usize,
    state: Mutex<BuildState>,
}

impl VectorStoreManager {
    pub fn new(
        store: Arc<dyn VectorStore>,
        spec: GenerationSpec,
        insert_batch_size: usize,
    ) -> Self {
        Self {
            store,
            spec,
            insert_batch_size: insert_batch_size.max(1),
            state: Mutex::new(BuildState::Empty),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn state(&self) -> BuildState {
        *self.state.lock().await
    }

    /// Drops any stale staging generation and creates an empty one.
    pub async fn prepare(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.store.prepare_staging(&self.spec).await?;
        *state = BuildState::Prepared;
        Ok(())
    }

    /// Inserts all chunks into staging in bounded batches.
    ///
    /// Every chunk must already carry an embedding; otherwise nothing is written.
    /// A failing batch reports how many rows were written before it.
    pub async fn populate(&self, chunks: &[Chunk]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let previous = match *state {
            BuildState::Prepared => 0,
            BuildState::Populated { rows } => rows,
            other => {
                return Err(Error::InvalidTransition {
                    operation: "populate",
                    state: other.to_string(),
                });
            }
        };
        check_chunks(chunks, self.spec.dimension)?;

        let total = chunks.len();
        let mut written = 0u64;
        for batch in chunks.chunks(self.insert_batch_size) {
            match self.store.insert_staging(batch).await {
                Ok(rows) => {
                    written += rows;
                    tracing::debug!("Inserted batch of {} rows ({}/{})", rows, written, total);
                }
                Err(e) => {
                    *state = BuildState::Populated {
                        rows: previous + written,
                    };
                    return Err(Error::interrupted(written as usize, total, e));
                }
            }
        }

        *state = BuildState::Populated {
            rows: previous + written,
        };
        tracing::info!("Populated {} rows into staging", written);
        Ok(written)
    }

    /// Builds the ANN index once staging holds exactly `row_count` rows.
    pub async fn build_index(&self, row_count: u64) -> Result<IndexReport> {
        let mut state = self.state.lock().await;
        let tracked = match *state {
            BuildState::Prepared => 0,
            BuildState::Populated { rows } => rows,
            other => {
                return Err(Error::InvalidTransition {
                    operation: "build_index",
                    state: other.to_string(),
                });
            }
        };

        let stored = self.store.staging_row_count().await?;
        if stored != row_count || tracked != row_count {
            return Err(Error::consistency(format!(
                "expected {row_count} staging rows, store has {stored} and {tracked} were populated"
            )));
        }

        let lists = lists_for_rows(row_count);
        let effective_lists = self.store.build_staging_index(lists).await?;
        *state = BuildState::Indexed {
            rows: row_count,
            lists,
        };
        Ok(IndexReport {
            rows: row_count,
            lists,
            effective_lists,
        })
    }

    pub fn spec(&self) -> &GenerationSpec {
        &self.spec
    }

    /// Promotes the indexed staging generation to live. With `allow_bootstrap`
    /// unset, a live generation must already exist.
    pub async fn deploy(&self, allow_bootstrap: bool) -> Result<Promotion> {
        let mut state = self.state.lock().await;
        let BuildState::Indexed { rows, .. } = *state else {
            return Err(Error::InvalidTransition {
                operation: "deploy",
                state: state.to_string(),
            });
        };
        if !allow_bootstrap && !self.store.live_exists().await? {
            return Err(Error::consistency(
                "no live generation exists and bootstrap is disabled",
            ));
        }

        let promotion = self.store.promote_staging().await?;
        *state = BuildState::Live;
        tracing::info!("Deployed generation with {} rows ({:?})", rows, promotion);
        Ok(promotion)
    }
}
