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

//! A store wrapper whose connection can be severed at will, for exercising
//! the engine's reconnect supervision.

use std::sync::Arc;

use async_trait::async_trait;
use gantry_lib::cancel::CancellationFlag;
use gantry_lib::object_id::CommitId;
use gantry_lib::store::{
    Branch, HeadPredicate, Store, StoreError, StoreResult, Transaction, Tree,
};
use tokio::sync::watch;

fn broken_error() -> StoreError {
    StoreError::Other("store connection broken".to_string())
}

#[derive(Debug, Clone)]
pub struct BreakableStore {
    inner: Arc<dyn Store>,
    broken: Arc<watch::Sender<bool>>,
}

impl BreakableStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        BreakableStore {
            inner,
            broken: Arc::new(watch::channel(false).0),
        }
    }

    /// Makes every subsequent operation on this wrapper fail, and wakes
    /// blocked `wait_for_head` calls.
    pub fn break_store(&self) {
        self.broken.send_replace(true);
    }

    pub fn is_broken(&self) -> bool {
        *self.broken.borrow()
    }
}

impl Store for BreakableStore {
    fn branch(&self, name: &str) -> Box<dyn Branch> {
        Box::new(BreakableBranch {
            inner: self.inner.branch(name),
            broken: self.broken.clone(),
        })
    }
}

struct BreakableBranch {
    inner: Box<dyn Branch>,
    broken: Arc<watch::Sender<bool>>,
}

impl BreakableBranch {
    fn check(&self) -> StoreResult<()> {
        if *self.broken.borrow() {
            Err(broken_error())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Branch for BreakableBranch {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn head(&self) -> StoreResult<Option<CommitId>> {
        self.check()?;
        self.inner.head().await
    }

    async fn tree(&self, commit: &CommitId) -> StoreResult<Arc<dyn Tree>> {
        self.check()?;
        self.inner.tree(commit).await
    }

    async fn start_transaction(&self) -> StoreResult<Box<dyn Transaction>> {
        self.check()?;
        self.inner.start_transaction().await
    }

    async fn wait_for_head(
        &self,
        cancel: &CancellationFlag,
        pred: HeadPredicate<'_>,
    ) -> StoreResult<()> {
        let mut rx = self.broken.subscribe();
        if *rx.borrow_and_update() {
            return Err(broken_error());
        }
        let watch_broken = async move {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    break;
                }
            }
        };
        tokio::select! {
            result = self.inner.wait_for_head(cancel, pred) => result,
            _ = watch_broken => Err(broken_error()),
        }
    }
}
