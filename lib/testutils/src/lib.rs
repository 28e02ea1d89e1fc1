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

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use gantry_lib::mem_store::MemStore;
use gantry_lib::mirror::{ProjectId, METADATA_BRANCH};
use gantry_lib::object_id::CommitId;
use gantry_lib::settings::StoreConnector;
use gantry_lib::store::{Store, StoreError};
use gantry_lib::tree_path::{TreePath, TreePathComponent};

pub mod breakable_store;

pub use breakable_store::BreakableStore;

pub fn mem_store() -> Arc<MemStore> {
    Arc::new(MemStore::new())
}

/// A connector that always hands out the given store.
pub fn fixed_connector(store: Arc<dyn Store>) -> StoreConnector {
    Arc::new(move || {
        let store = store.clone();
        async move { Ok(store) }.boxed()
    })
}

pub fn project(text: &str) -> ProjectId {
    text.parse().unwrap()
}

pub fn path(text: &str) -> TreePath {
    text.parse().unwrap()
}

fn component(text: &str) -> TreePathComponent {
    TreePathComponent::new(text).unwrap()
}

/// A 40-hex commit hash built from a seed byte.
pub fn hex40(seed: u8) -> String {
    format!("{seed:02x}").repeat(20)
}

pub fn commit_id(hex: &str) -> CommitId {
    CommitId::try_from_hex(hex).unwrap()
}

/// Writes one file (and its parent directories) on a branch in a single
/// commit.
pub async fn put_file(store: &dyn Store, branch: &str, file: &str, data: &[u8]) {
    let file = path(file);
    let branch = store.branch(branch);
    loop {
        let mut tx = branch.start_transaction().await.unwrap();
        if let Some(parent) = file.parent() {
            tx.make_dirs(&parent).await.unwrap();
        }
        tx.create_or_replace_file(&file, data).await.unwrap();
        match tx.commit(&format!("put {file}")).await {
            Ok(_) => return,
            Err(StoreError::Conflict) => continue,
            Err(err) => panic!("put_file failed: {err}"),
        }
    }
}

/// Removes one path on a branch in a single commit.
pub async fn remove_path(store: &dyn Store, branch: &str, target: &str) {
    let target = path(target);
    let branch = store.branch(branch);
    loop {
        let mut tx = branch.start_transaction().await.unwrap();
        tx.remove(&target).await.unwrap();
        match tx.commit(&format!("remove {target}")).await {
            Ok(_) => return,
            Err(StoreError::Conflict) => continue,
            Err(err) => panic!("remove_path failed: {err}"),
        }
    }
}

/// Seeds (or updates) a PR on the metadata branch. Head and title land in a
/// single commit, the way the forge bridge writes them.
pub async fn seed_pr(
    store: &dyn Store,
    project: &ProjectId,
    number: u64,
    head_hex: &str,
    title: &str,
) {
    let dir = path(&format!("{project}/pr/{number}"));
    let branch = store.branch(METADATA_BRANCH);
    loop {
        let mut tx = branch.start_transaction().await.unwrap();
        tx.make_dirs(&dir).await.unwrap();
        tx.create_or_replace_file(&dir.child(component("head")), format!("{head_hex}\n").as_bytes())
            .await
            .unwrap();
        tx.create_or_replace_file(&dir.child(component("title")), format!("{title}\n").as_bytes())
            .await
            .unwrap();
        match tx.commit(&format!("update pr {number}")).await {
            Ok(_) => return,
            Err(StoreError::Conflict) => continue,
            Err(err) => panic!("seed_pr failed: {err}"),
        }
    }
}

/// Removes a PR from the metadata branch, closing it from the engine's
/// point of view.
pub async fn close_pr(store: &dyn Store, project: &ProjectId, number: u64) {
    remove_path(store, METADATA_BRANCH, &format!("{project}/pr/{number}")).await;
}

/// Seeds (or updates) a ref on the metadata branch. `name` is
/// `heads/...`-style.
pub async fn seed_ref(store: &dyn Store, project: &ProjectId, name: &str, head_hex: &str) {
    put_file(
        store,
        METADATA_BRANCH,
        &format!("{project}/ref/{name}/head"),
        format!("{head_hex}\n").as_bytes(),
    )
    .await;
}

/// Reads a file from the branch head; `None` if the branch or file is
/// absent.
pub async fn read_file(store: &dyn Store, branch: &str, file: &str) -> Option<Vec<u8>> {
    let branch = store.branch(branch);
    let head = branch.head().await.unwrap()?;
    let tree = branch.tree(&head).await.unwrap();
    match tree.read_file(&path(file)).await {
        Ok(data) => Some(data),
        Err(StoreError::NotFound) => None,
        Err(err) => panic!("read_file failed: {err}"),
    }
}

/// Polls `check` until it returns `Some`, or panics after a few seconds.
/// The engine publishes asynchronously, so tests observe effects rather
/// than awaiting them.
pub async fn wait_until<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The integration crate routes every test file through `runner.rs`; a
/// `test_*.rs` that is not declared there would silently never run. This
/// checks the directory and the declarations against each other, in both
/// directions.
pub fn assert_all_tests_are_linked(tests_dir: &Path) {
    let runner = fs::read_to_string(tests_dir.join("runner.rs")).unwrap();
    let mut declared: HashSet<String> = runner
        .lines()
        .filter_map(|line| line.trim().strip_prefix("mod ")?.strip_suffix(';'))
        .map(str::to_owned)
        .collect();
    for entry in fs::read_dir(tests_dir).unwrap() {
        let file = entry.unwrap().path();
        let stem = match (file.extension(), file.file_stem().and_then(|s| s.to_str())) {
            (Some(ext), Some(stem)) if ext == "rs" && stem != "runner" => stem,
            _ => continue,
        };
        assert!(
            declared.remove(stem),
            "{stem}.rs exists but runner.rs has no `mod {stem};`"
        );
    }
    assert!(
        declared.is_empty(),
        "runner.rs declares modules with no file: {declared:?}"
    );
}
