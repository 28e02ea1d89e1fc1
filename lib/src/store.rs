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

//! The transactional tree store the engine runs against. The store is an
//! external collaborator; everything in the engine is written against these
//! traits. Branches hold a linear history of commits, each commit holds a
//! tree of directories and files, and transactions advance a branch
//! atomically.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::CancellationFlag;
use crate::object_id::CommitId;
use crate::tree_path::{TreePath, TreePathComponent};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StoreError {
    /// The requested entry does not exist. Callers translate this into
    /// `None`; every other variant is a real failure.
    #[error("No such entry")]
    NotFound,
    /// The branch advanced between opening the transaction and committing
    /// it. Retryable.
    #[error("Branch was modified concurrently")]
    Conflict,
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Store error: {0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Debug, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Timestamp {
    pub timestamp: MillisSinceEpoch,
    // time zone offset in minutes
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(chrono::offset::Local::now())
    }

    pub fn from_datetime<Tz: chrono::TimeZone<Offset = chrono::offset::FixedOffset>>(
        datetime: chrono::DateTime<Tz>,
    ) -> Self {
        Self {
            timestamp: MillisSinceEpoch(datetime.timestamp_millis()),
            tz_offset: datetime.offset().local_minus_utc() / 60,
        }
    }
}

/// Metadata recorded with every commit.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CommitMeta {
    pub message: String,
    pub timestamp: Timestamp,
}

/// Predicate handed to [`Branch::wait_for_head`]. Returns `true` once the
/// caller has seen what it was waiting for.
pub type HeadPredicate<'a> = &'a mut (dyn FnMut(Option<&CommitId>) -> bool + Send);

pub trait Store: Send + Sync + Debug {
    /// Obtains a handle to a named branch. The branch does not need to exist
    /// yet; it comes into being on its first commit.
    fn branch(&self, name: &str) -> Box<dyn Branch>;
}

#[async_trait]
pub trait Branch: Send + Sync {
    fn name(&self) -> &str;

    async fn head(&self) -> StoreResult<Option<CommitId>>;

    /// The immutable tree of a specific commit.
    async fn tree(&self, commit: &CommitId) -> StoreResult<Arc<dyn Tree>>;

    async fn start_transaction(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Repeatedly invokes `pred` with the branch head, first with the current
    /// value and then on every advance, until `pred` returns `true` or
    /// `cancel` trips. Heads are delivered monotonically; intermediate
    /// commits may be skipped.
    async fn wait_for_head(
        &self,
        cancel: &CancellationFlag,
        pred: HeadPredicate<'_>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait Tree: Send + Sync {
    async fn read_file(&self, path: &TreePath) -> StoreResult<Vec<u8>>;

    /// Lists the entries of a directory, sorted by name.
    async fn read_dir(&self, path: &TreePath) -> StoreResult<Vec<TreePathComponent>>;

    async fn exists_file(&self, path: &TreePath) -> StoreResult<bool>;
}

#[async_trait]
pub trait Transaction: Send {
    async fn make_dirs(&mut self, path: &TreePath) -> StoreResult<()>;

    /// Creates a new file; fails if the path already exists.
    async fn create_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()>;

    async fn create_or_replace_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()>;

    async fn remove(&mut self, path: &TreePath) -> StoreResult<()>;

    /// Atomically advances the branch to a commit holding the transaction's
    /// tree. Fails with [`StoreError::Conflict`] if the branch moved since
    /// the transaction was opened.
    async fn commit(self: Box<Self>, message: &str) -> StoreResult<CommitId>;

    async fn abort(self: Box<Self>);
}
