// Copyright 2024 The Gantry Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Content-addressed build memoization. Each cache entry is a store branch
//! named by the fingerprint of the build's inputs; the branch tip holds the
//! serialized result and the captured log. An in-memory pending map
//! guarantees at most one build per fingerprint is in flight; coincident
//! demands share the running build's live log. Completed entries survive
//! restarts and are only invalidated through their rebuild trigger.

use std::collections::HashMap;
use std::fmt::{Debug, Error, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blake2::Blake2b512;
use digest::Digest;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cancel::CancellationFlag;
use crate::live_log::{LiveLog, LiveLogManager};
use crate::object_id::Fingerprint;
use crate::store::{Store, StoreError, StoreResult, Transaction};
use crate::term::{panic_message, LogTree};
use crate::tree_path::TreePath;

/// Scheduled by the cache when an asynchronous dependency (a finished or
/// invalidated build) requires the demander to recompute.
pub type RecalcFn = Arc<dyn Fn() + Send + Sync>;

/// The work behind a memoized build node. Appends progress to the live log
/// and resolves to the build's output or a failure message.
pub type BuildFn = Box<
    dyn FnOnce(Arc<LiveLog>, Arc<CancellationFlag>) -> BoxFuture<'static, Result<String, String>>
        + Send,
>;

/// Fingerprint of a build node's inputs; the cache key.
pub fn fingerprint(name: &str, input: &str) -> Fingerprint {
    let mut hasher = Blake2b512::new();
    hasher.update(name.len().to_le_bytes());
    hasher.update(name.as_bytes());
    hasher.update(input.as_bytes());
    Fingerprint::from_bytes(&hasher.finalize()[..20])
}

/// The store branch holding the cache entry for one fingerprint.
pub fn build_branch(name: &str, fingerprint: &Fingerprint) -> String {
    format!("{}-{}", name, &fingerprint.hex()[..24])
}

fn result_path() -> TreePath {
    "result".parse().unwrap()
}

fn log_path() -> TreePath {
    "log".parse().unwrap()
}

fn rebuild_path() -> TreePath {
    "rebuild".parse().unwrap()
}

/// A completed build as persisted on the cache branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub ok: bool,
    pub output: String,
}

impl BuildRecord {
    fn from_result(result: &Result<String, String>) -> Self {
        match result {
            Ok(output) => BuildRecord {
                ok: true,
                output: output.clone(),
            },
            Err(output) => BuildRecord {
                ok: false,
                output: output.clone(),
            },
        }
    }
}

/// What a cache lookup produced: either a finished result with its saved
/// log, or a handle onto the build currently producing one.
#[derive(Debug)]
pub enum CacheState {
    Done { record: BuildRecord, log: LogTree },
    Building { log: LogTree },
}

/// Lazy one-shot invalidation of a cache entry. Forcing it writes a rebuild
/// marker to the entry's branch; the next demand re-executes the build.
pub struct RebuildHandle {
    store: Arc<dyn Store>,
    branch: String,
    forced: AtomicBool,
}

impl RebuildHandle {
    fn new(store: Arc<dyn Store>, branch: String) -> Self {
        RebuildHandle {
            store,
            branch,
            forced: AtomicBool::new(false),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Invalidates the entry. Only the first call writes; later calls are
    /// no-ops.
    pub async fn force(&self) -> StoreResult<()> {
        if self.forced.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(branch = %self.branch, "rebuild requested");
        let branch = self.store.branch(&self.branch);
        loop {
            let mut tx = branch.start_transaction().await?;
            if let Err(err) = tx
                .create_or_replace_file(&rebuild_path(), b"rebuild requested\n")
                .await
            {
                tx.abort().await;
                return Err(err);
            }
            match tx.commit("Request rebuild").await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl Debug for RebuildHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("RebuildHandle")
            .field("branch", &self.branch)
            .field("forced", &self.is_forced())
            .finish()
    }
}

struct PendingBuild {
    log: Arc<LiveLog>,
    waiters: Vec<RecalcFn>,
}

pub struct BuildCache {
    store: Arc<dyn Store>,
    logs: LiveLogManager,
    pending: Mutex<HashMap<String, PendingBuild>>,
}

impl BuildCache {
    pub fn new(store: Arc<dyn Store>, logs: LiveLogManager) -> Self {
        BuildCache {
            store,
            logs,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the cache entry for `(name, input)`, starting a build if
    /// there is neither a completed entry nor one in flight. `on_done` is
    /// invoked (once) when an in-flight build completes, so the demander can
    /// recompute with the final result.
    pub async fn lookup(
        self: &Arc<Self>,
        name: &str,
        input: &str,
        on_done: RecalcFn,
        run: BuildFn,
    ) -> StoreResult<CacheState> {
        let fingerprint = fingerprint(name, input);
        let branch_name = build_branch(name, &fingerprint);

        if let Some(state) = self.join_pending(&branch_name, &on_done) {
            return Ok(state);
        }

        let branch = self.store.branch(&branch_name);
        if let Some(head) = branch.head().await? {
            let tree = branch.tree(&head).await?;
            let complete = tree.exists_file(&result_path()).await?
                && !tree.exists_file(&rebuild_path()).await?;
            if complete {
                let data = tree.read_file(&result_path()).await?;
                let record: BuildRecord = serde_json::from_slice(&data).map_err(|err| {
                    StoreError::Other(format!("Malformed build record on {branch_name}: {err}"))
                })?;
                let rebuild =
                    Arc::new(RebuildHandle::new(self.store.clone(), branch_name.clone()));
                return Ok(CacheState::Done {
                    record,
                    log: LogTree::Saved {
                        branch: branch_name,
                        rebuild,
                        commit: head,
                    },
                });
            }
        }

        // The head read above was a suspension point; someone else may have
        // started the build in the meantime.
        let log = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(build) = pending.get_mut(&branch_name) {
                build.waiters.push(on_done.clone());
                let log = build.log.clone();
                return Ok(CacheState::Building {
                    log: LogTree::Live {
                        branch: branch_name,
                        log,
                    },
                });
            }
            let cancel = Arc::new(CancellationFlag::new());
            let log = self
                .logs
                .create(&branch_name, cancel.clone())
                .map_err(|err| StoreError::Other(err.to_string()))?;
            pending.insert(
                branch_name.clone(),
                PendingBuild {
                    log: log.clone(),
                    waiters: vec![on_done],
                },
            );
            let _ = tokio::spawn(Self::run_build(
                self.clone(),
                branch_name.clone(),
                log.clone(),
                cancel,
                run,
            ));
            log
        };
        Ok(CacheState::Building {
            log: LogTree::Live {
                branch: branch_name,
                log,
            },
        })
    }

    async fn run_build(
        cache: Arc<BuildCache>,
        branch_name: String,
        log: Arc<LiveLog>,
        cancel: Arc<CancellationFlag>,
        run: BuildFn,
    ) {
        info!(branch = %branch_name, "starting build");
        let work = run(log.clone(), cancel.clone());
        let result = match std::panic::AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(format!("build panicked: {}", panic_message(&panic))),
        };
        let record = BuildRecord::from_result(&result);
        if let Err(err) = cache.write_record(&branch_name, &log, &record).await {
            error!(branch = %branch_name, %err, "failed to persist build result");
        }
        log.close().await;
        let waiters = {
            let mut pending = cache.pending.lock().unwrap();
            pending
                .remove(&branch_name)
                .map(|build| build.waiters)
                .unwrap_or_default()
        };
        info!(branch = %branch_name, ok = record.ok, "build finished");
        for waiter in &waiters {
            waiter();
        }
    }

    async fn write_record(
        &self,
        branch_name: &str,
        log: &LiveLog,
        record: &BuildRecord,
    ) -> StoreResult<()> {
        let data = serde_json::to_vec(record)
            .map_err(|err| StoreError::Other(format!("Unencodable build record: {err}")))?;
        let log_bytes = log.contents().await;
        let branch = self.store.branch(branch_name);
        loop {
            let mut tx = branch.start_transaction().await?;
            let write = Self::write_entry(&mut tx, &data, &log_bytes);
            if let Err(err) = write.await {
                tx.abort().await;
                return Err(err);
            }
            match tx.commit("Record build result").await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => {
                    warn!(branch = %branch_name, "cache write conflicted; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_entry(
        tx: &mut Box<dyn Transaction>,
        record: &[u8],
        log_bytes: &[u8],
    ) -> StoreResult<()> {
        tx.create_or_replace_file(&result_path(), record).await?;
        tx.create_or_replace_file(&log_path(), log_bytes).await?;
        match tx.remove(&rebuild_path()).await {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn join_pending(&self, branch_name: &str, on_done: &RecalcFn) -> Option<CacheState> {
        let mut pending = self.pending.lock().unwrap();
        let build = pending.get_mut(branch_name)?;
        build.waiters.push(on_done.clone());
        Some(CacheState::Building {
            log: LogTree::Live {
                branch: branch_name.to_owned(),
                log: build.log.clone(),
            },
        })
    }
}

impl Debug for BuildCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let pending = self.pending.lock().unwrap();
        f.debug_struct("BuildCache")
            .field("pending", &pending.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_input_sensitive() {
        let base = fingerprint("job", "input");
        assert_eq!(fingerprint("job", "input"), base);
        assert_ne!(fingerprint("job", "other"), base);
        assert_ne!(fingerprint("other", "input"), base);
        // The name length is part of the preimage, so shifting a byte
        // between name and input changes the digest.
        assert_ne!(fingerprint("jobi", "nput"), base);
    }

    #[test]
    fn test_build_branch_is_stable() {
        let fingerprint = fingerprint("unit", "x");
        let branch = build_branch("unit", &fingerprint);
        assert!(branch.starts_with("unit-"));
        assert_eq!(branch.len(), "unit-".len() + 24);
    }
}
