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

//! An in-memory, content-addressed implementation of the store traits.
//! Commit ids are BLAKE2b hashes of the commit's tree, parent, and message,
//! so identical content hashes to identical ids. Branch heads are watch
//! channels, which makes `wait_for_head` push-driven.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use blake2::Blake2b512;
use digest::Digest;
use tokio::sync::watch;

use crate::cancel::CancellationFlag;
use crate::object_id::CommitId;
use crate::store::{
    Branch, CommitMeta, HeadPredicate, Store, StoreError, StoreResult, Timestamp, Transaction,
    Tree,
};
use crate::tree_path::{TreePath, TreePathComponent};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Dir(BTreeMap<TreePathComponent, Node>),
    File(Vec<u8>),
}

impl Node {
    fn empty_dir() -> Node {
        Node::Dir(BTreeMap::new())
    }

    fn get(&self, path: &TreePath) -> Option<&Node> {
        let mut node = self;
        for component in path.components() {
            match node {
                Node::Dir(entries) => node = entries.get(component)?,
                Node::File(_) => return None,
            }
        }
        Some(node)
    }

    fn hash_into(&self, hasher: &mut Blake2b512) {
        match self {
            Node::Dir(entries) => {
                hasher.update(b"D");
                hasher.update(entries.len().to_le_bytes());
                for (name, child) in entries {
                    hasher.update(name.value().len().to_le_bytes());
                    hasher.update(name.value().as_bytes());
                    child.hash_into(hasher);
                }
            }
            Node::File(data) => {
                hasher.update(b"F");
                hasher.update(data.len().to_le_bytes());
                hasher.update(data);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct MemCommit {
    parent: Option<CommitId>,
    root: Arc<Node>,
    meta: CommitMeta,
}

#[derive(Debug)]
struct MemStoreInner {
    commits: Mutex<HashMap<CommitId, MemCommit>>,
    branches: Mutex<HashMap<String, watch::Sender<Option<CommitId>>>>,
}

#[derive(Debug, Clone)]
pub struct MemStore {
    inner: Arc<MemStoreInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            inner: Arc::new(MemStoreInner {
                commits: Mutex::new(HashMap::new()),
                branches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn commit_meta(&self, id: &CommitId) -> Option<CommitMeta> {
        let commits = self.inner.commits.lock().unwrap();
        commits.get(id).map(|commit| commit.meta.clone())
    }

    /// The commits reachable from the branch head, newest first.
    pub fn history(&self, branch: &str) -> Vec<(CommitId, CommitMeta)> {
        let head = {
            let branches = self.inner.branches.lock().unwrap();
            branches.get(branch).and_then(|sender| sender.borrow().clone())
        };
        let commits = self.inner.commits.lock().unwrap();
        let mut result = vec![];
        let mut next = head;
        while let Some(id) = next {
            let Some(commit) = commits.get(&id) else {
                break;
            };
            result.push((id, commit.meta.clone()));
            next = commit.parent.clone();
        }
        result
    }
}

impl MemStoreInner {
    fn branch_sender(&self, name: &str) -> watch::Sender<Option<CommitId>> {
        let mut branches = self.branches.lock().unwrap();
        branches
            .entry(name.to_owned())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

impl Store for MemStore {
    fn branch(&self, name: &str) -> Box<dyn Branch> {
        // Materialize the slot eagerly so later waits and commits agree on
        // the same channel.
        let _ = self.inner.branch_sender(name);
        Box::new(MemBranch {
            inner: self.inner.clone(),
            name: name.to_owned(),
        })
    }
}

struct MemBranch {
    inner: Arc<MemStoreInner>,
    name: String,
}

#[async_trait]
impl Branch for MemBranch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self) -> StoreResult<Option<CommitId>> {
        Ok(self.inner.branch_sender(&self.name).borrow().clone())
    }

    async fn tree(&self, commit: &CommitId) -> StoreResult<Arc<dyn Tree>> {
        let commits = self.inner.commits.lock().unwrap();
        let commit = commits.get(commit).ok_or(StoreError::NotFound)?;
        Ok(Arc::new(MemTree {
            root: commit.root.clone(),
        }))
    }

    async fn start_transaction(&self) -> StoreResult<Box<dyn Transaction>> {
        let base = self.head().await?;
        let root = match &base {
            Some(id) => {
                let commits = self.inner.commits.lock().unwrap();
                let commit = commits.get(id).ok_or(StoreError::NotFound)?;
                (*commit.root).clone()
            }
            None => Node::empty_dir(),
        };
        Ok(Box::new(MemTransaction {
            inner: self.inner.clone(),
            branch: self.name.clone(),
            base,
            root,
        }))
    }

    async fn wait_for_head(
        &self,
        cancel: &CancellationFlag,
        pred: HeadPredicate<'_>,
    ) -> StoreResult<()> {
        let mut rx = self.inner.branch_sender(&self.name).subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let current = rx.borrow_and_update().clone();
            if pred(current.as_ref()) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                changed = rx.changed() => {
                    changed.map_err(|_| StoreError::Other("branch channel closed".to_string()))?;
                }
            }
        }
    }
}

struct MemTree {
    root: Arc<Node>,
}

#[async_trait]
impl Tree for MemTree {
    async fn read_file(&self, path: &TreePath) -> StoreResult<Vec<u8>> {
        match self.root.get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir(_)) => Err(StoreError::Other(format!("Not a file: {path}"))),
            None => Err(StoreError::NotFound),
        }
    }

    async fn read_dir(&self, path: &TreePath) -> StoreResult<Vec<TreePathComponent>> {
        match self.root.get(path) {
            Some(Node::Dir(entries)) => Ok(entries.keys().cloned().collect()),
            Some(Node::File(_)) => Err(StoreError::Other(format!("Not a directory: {path}"))),
            None => Err(StoreError::NotFound),
        }
    }

    async fn exists_file(&self, path: &TreePath) -> StoreResult<bool> {
        Ok(matches!(self.root.get(path), Some(Node::File(_))))
    }
}

struct MemTransaction {
    inner: Arc<MemStoreInner>,
    branch: String,
    base: Option<CommitId>,
    root: Node,
}

impl MemTransaction {
    fn dir_at<'a>(
        root: &'a mut Node,
        path: &TreePath,
    ) -> StoreResult<&'a mut BTreeMap<TreePathComponent, Node>> {
        let mut node = root;
        for component in path.components() {
            let entries = match node {
                Node::Dir(entries) => entries,
                Node::File(_) => {
                    return Err(StoreError::Other(format!("Not a directory: {path}")))
                }
            };
            node = entries.get_mut(component).ok_or(StoreError::NotFound)?;
        }
        match node {
            Node::Dir(entries) => Ok(entries),
            Node::File(_) => Err(StoreError::Other(format!("Not a directory: {path}"))),
        }
    }

    fn parent_dir<'a>(
        root: &'a mut Node,
        path: &TreePath,
    ) -> StoreResult<(&'a mut BTreeMap<TreePathComponent, Node>, TreePathComponent)> {
        let basename = path
            .basename()
            .cloned()
            .ok_or_else(|| StoreError::Other("Path has no basename".to_string()))?;
        let parent = path.parent().unwrap_or_else(TreePath::root);
        let entries = Self::dir_at(root, &parent)?;
        Ok((entries, basename))
    }
}

#[async_trait]
impl Transaction for MemTransaction {
    async fn make_dirs(&mut self, path: &TreePath) -> StoreResult<()> {
        let mut node = &mut self.root;
        for component in path.components() {
            let entries = match node {
                Node::Dir(entries) => entries,
                Node::File(_) => {
                    return Err(StoreError::Other(format!("Not a directory: {path}")))
                }
            };
            node = entries
                .entry(component.clone())
                .or_insert_with(Node::empty_dir);
        }
        match node {
            Node::Dir(_) => Ok(()),
            Node::File(_) => Err(StoreError::Other(format!("Not a directory: {path}"))),
        }
    }

    async fn create_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()> {
        let (entries, basename) = Self::parent_dir(&mut self.root, path)?;
        if entries.contains_key(&basename) {
            return Err(StoreError::Other(format!("Already exists: {path}")));
        }
        entries.insert(basename, Node::File(data.to_vec()));
        Ok(())
    }

    async fn create_or_replace_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()> {
        let (entries, basename) = Self::parent_dir(&mut self.root, path)?;
        if let Some(Node::Dir(_)) = entries.get(&basename) {
            return Err(StoreError::Other(format!("Not a file: {path}")));
        }
        entries.insert(basename, Node::File(data.to_vec()));
        Ok(())
    }

    async fn remove(&mut self, path: &TreePath) -> StoreResult<()> {
        let (entries, basename) = Self::parent_dir(&mut self.root, path)?;
        entries.remove(&basename).ok_or(StoreError::NotFound)?;
        Ok(())
    }

    async fn commit(self: Box<Self>, message: &str) -> StoreResult<CommitId> {
        let mut hasher = Blake2b512::new();
        match &self.base {
            Some(parent) => hasher.update(parent.as_bytes()),
            None => hasher.update(b"root"),
        }
        hasher.update(message.len().to_le_bytes());
        hasher.update(message.as_bytes());
        self.root.hash_into(&mut hasher);
        let id = CommitId::from_bytes(&hasher.finalize()[..20]);

        let MemTransaction {
            inner,
            branch,
            base,
            root,
        } = *self;

        let sender = inner.branch_sender(&branch);
        let current = sender.borrow().clone();
        if current != base {
            return Err(StoreError::Conflict);
        }
        {
            let mut commits = inner.commits.lock().unwrap();
            commits.entry(id.clone()).or_insert_with(|| MemCommit {
                parent: base.clone(),
                root: Arc::new(root),
                meta: CommitMeta {
                    message: message.to_owned(),
                    timestamp: Timestamp::now(),
                },
            });
        }
        sender.send_replace(Some(id.clone()));
        Ok(id)
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> TreePath {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let store = MemStore::new();
        let branch = store.branch("test");
        assert_eq!(branch.head().await.unwrap(), None);

        let mut tx = branch.start_transaction().await.unwrap();
        tx.make_dirs(&path("a/b")).await.unwrap();
        tx.create_file(&path("a/b/c"), b"hello\n").await.unwrap();
        let id = tx.commit("initial").await.unwrap();

        assert_eq!(branch.head().await.unwrap(), Some(id.clone()));
        let tree = branch.tree(&id).await.unwrap();
        assert_eq!(tree.read_file(&path("a/b/c")).await.unwrap(), b"hello\n");
        assert!(tree.exists_file(&path("a/b/c")).await.unwrap());
        assert!(!tree.exists_file(&path("a/b")).await.unwrap());
        assert_eq!(
            tree.read_file(&path("a/missing")).await.unwrap_err(),
            StoreError::NotFound
        );
        assert_eq!(
            tree.read_dir(&path("a")).await.unwrap(),
            vec![TreePathComponent::new("b").unwrap()]
        );
    }

    #[tokio::test]
    async fn test_concurrent_transactions_conflict() {
        let store = MemStore::new();
        let branch = store.branch("test");
        let mut tx1 = branch.start_transaction().await.unwrap();
        tx1.create_file(&path("one"), b"1").await.unwrap();
        let mut tx2 = branch.start_transaction().await.unwrap();
        tx2.create_file(&path("two"), b"2").await.unwrap();
        tx1.commit("first").await.unwrap();
        assert_eq!(tx2.commit("second").await.unwrap_err(), StoreError::Conflict);
    }

    #[tokio::test]
    async fn test_content_addressing_is_stable() {
        let store = MemStore::new();
        let a = store.branch("a");
        let b = store.branch("b");
        let mut tx = a.start_transaction().await.unwrap();
        tx.create_file(&path("f"), b"data").await.unwrap();
        let id_a = tx.commit("msg").await.unwrap();
        let mut tx = b.start_transaction().await.unwrap();
        tx.create_file(&path("f"), b"data").await.unwrap();
        let id_b = tx.commit("msg").await.unwrap();
        assert_eq!(id_a, id_b);
    }

    #[tokio::test]
    async fn test_wait_for_head_sees_new_commits() {
        let store = MemStore::new();
        let branch = store.branch("test");
        let cancel = CancellationFlag::new();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                let branch = store.branch("test");
                let mut tx = branch.start_transaction().await.unwrap();
                tx.create_file(&path("f"), b"x").await.unwrap();
                tx.commit("write").await.unwrap()
            })
        };

        let mut seen = None;
        branch
            .wait_for_head(&cancel, &mut |head| {
                seen = head.cloned();
                head.is_some()
            })
            .await
            .unwrap();
        let written = writer.await.unwrap();
        assert_eq!(seen, Some(written));
    }

    #[tokio::test]
    async fn test_wait_for_head_cancellation() {
        let store = MemStore::new();
        let branch = store.branch("test");
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let result = branch.wait_for_head(&cancel, &mut |_| false).await;
        assert_eq!(result.unwrap_err(), StoreError::Cancelled);
    }
}
