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

//! The metadata mirror projects the forge's PR/ref/status/commit model onto
//! the store's `github-metadata` branch and exposes immutable snapshots of
//! it. Reads go through a [`Snapshot`] pinned to one store commit; writes
//! (status publication, monitoring markers) go through their own
//! transactions on the metadata branch.
//!
//! The tree layout:
//!
//! ```text
//! <user>/<repo>/pr/<n>/head          hex commit hash
//! <user>/<repo>/pr/<n>/title         title
//! <user>/<repo>/ref/<name...>/head   hex commit hash
//! <user>/<repo>/commit/<hash>/status/<context...>/state
//!                                   /description
//!                                   /target_url   (may be absent)
//! <user>/<repo>/.monitor             empty marker
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display, Error, Formatter};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::cancel::CancellationFlag;
use crate::object_id::CommitId;
use crate::store::{Branch, Store, StoreError, StoreResult, Transaction, Tree};
use crate::tree_path::{TreePath, TreePathComponent, TreePathParseError};

/// The store branch mirroring forge state.
pub const METADATA_BRANCH: &str = "github-metadata";

const MONITOR_MARKER: &str = ".monitor";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Metadata branch {METADATA_BRANCH:?} does not exist")]
    NoMetadataBranch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A `(user, repo)` pair. Both halves are validated path segments, so a
/// project id always maps onto the `user/repo` prefix in the metadata tree.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectId {
    user: TreePathComponent,
    repo: TreePathComponent,
}

impl ProjectId {
    pub fn new(user: &str, repo: &str) -> Result<Self, TreePathParseError> {
        Ok(ProjectId {
            user: TreePathComponent::new(user)?,
            repo: TreePathComponent::new(repo)?,
        })
    }

    pub fn user(&self) -> &str {
        self.user.value()
    }

    pub fn repo(&self) -> &str {
        self.repo.value()
    }

    pub fn tree_path(&self) -> TreePath {
        TreePath::from_components(vec![self.user.clone(), self.repo.clone()])
    }
}

impl Debug for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.write_fmt(format_args!("{:?}", self.to_string()))
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}/{}", self.user.value(), self.repo.value())
    }
}

impl FromStr for ProjectId {
    type Err = TreePathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path: TreePath = s.parse()?;
        match path.components() {
            [user, repo] => Ok(ProjectId {
                user: user.clone(),
                repo: repo.clone(),
            }),
            _ => Err(TreePathParseError::InvalidComponent {
                component: s.to_owned(),
                input: s.to_owned(),
            }),
        }
    }
}

/// A commit within a project, as the forge names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub project: ProjectId,
    pub hash: CommitId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub project: ProjectId,
    pub number: u64,
    pub title: String,
    pub head: CommitId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefInfo {
    pub project: ProjectId,
    /// `heads/...` or `tags/...`.
    pub name: TreePath,
    pub head: CommitId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusState {
    Error,
    Pending,
    Success,
    Failure,
}

impl Display for StatusState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let text = match self {
            StatusState::Error => "error",
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unrecognized status state {0:?}")]
pub struct StatusStateParseError(String);

impl FromStr for StatusState {
    type Err = StatusStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(StatusState::Error),
            "pending" => Ok(StatusState::Pending),
            "success" => Ok(StatusState::Success),
            "failure" => Ok(StatusState::Failure),
            _ => Err(StatusStateParseError(s.to_owned())),
        }
    }
}

/// The three status leaves of one commit/context pair, each independently
/// optional.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitStatus {
    pub state: Option<StatusState>,
    pub description: Option<String>,
    pub target_url: Option<String>,
}

/// The PRs and refs of one project within one snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProjectState {
    pub prs: BTreeMap<u64, PullRequest>,
    pub refs: BTreeMap<TreePath, RefInfo>,
}

fn lit(value: &str) -> TreePathComponent {
    TreePathComponent::new(value).expect("static path component")
}

fn pr_dir(project: &ProjectId, number: &TreePathComponent) -> TreePath {
    project.tree_path().child(lit("pr")).child(number.clone())
}

fn status_dir(commit: &CommitRef, context: &TreePath) -> TreePath {
    commit
        .project
        .tree_path()
        .child(lit("commit"))
        .child(lit(&commit.hash.hex()))
        .child(lit("status"))
        .join(context)
}

/// Reads a newline-terminated UTF-8 leaf, without the terminator.
async fn read_text(tree: &dyn Tree, path: &TreePath) -> StoreResult<String> {
    let data = tree.read_file(path).await?;
    let text = String::from_utf8(data)
        .map_err(|err| StoreError::Other(format!("Non-UTF-8 data at {path}: {err}")))?;
    Ok(text.strip_suffix('\n').map(str::to_owned).unwrap_or(text))
}

async fn read_text_opt(tree: &dyn Tree, path: &TreePath) -> StoreResult<Option<String>> {
    match read_text(tree, path).await {
        Ok(text) => Ok(Some(text)),
        Err(StoreError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

/// An immutable view of the metadata branch at one store commit. Per-project
/// state is materialized on first use and cached for the snapshot's
/// lifetime.
pub struct Snapshot {
    commit: CommitId,
    tree: Arc<dyn Tree>,
    projects: Mutex<HashMap<ProjectId, Arc<OnceCell<Arc<ProjectState>>>>>,
}

impl Snapshot {
    fn new(commit: CommitId, tree: Arc<dyn Tree>) -> Self {
        Snapshot {
            commit,
            tree,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn commit(&self) -> &CommitId {
        &self.commit
    }

    pub async fn project(&self, project: &ProjectId) -> Result<Arc<ProjectState>, MirrorError> {
        let cell = {
            let mut projects = self.projects.lock().unwrap();
            projects
                .entry(project.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let state = cell
            .get_or_try_init(|| async {
                Ok::<_, MirrorError>(Arc::new(self.load_project(project).await?))
            })
            .await?;
        Ok(state.clone())
    }

    /// Hydrates a single PR without walking the whole project.
    pub async fn pr(
        &self,
        project: &ProjectId,
        number: u64,
    ) -> Result<Option<PullRequest>, MirrorError> {
        let component = lit(&number.to_string());
        self.load_pr(project, &component, number).await
    }

    /// Hydrates a single ref without walking the whole project.
    pub async fn named_ref(
        &self,
        project: &ProjectId,
        name: &TreePath,
    ) -> Result<Option<RefInfo>, MirrorError> {
        let head_path = project
            .tree_path()
            .child(lit("ref"))
            .join(name)
            .child(lit("head"));
        let Some(text) = read_text_opt(self.tree.as_ref(), &head_path).await? else {
            return Ok(None);
        };
        match CommitId::try_from_hex(&text) {
            Some(head) => Ok(Some(RefInfo {
                project: project.clone(),
                name: name.clone(),
                head,
            })),
            None => {
                warn!(%project, %name, "ref head is not a hex hash; ignoring");
                Ok(None)
            }
        }
    }

    async fn load_project(&self, project: &ProjectId) -> Result<ProjectState, MirrorError> {
        let prs = self.load_prs(project).await?;
        let refs = self.load_refs(project).await?;
        Ok(ProjectState { prs, refs })
    }

    async fn load_prs(
        &self,
        project: &ProjectId,
    ) -> Result<BTreeMap<u64, PullRequest>, MirrorError> {
        let base = project.tree_path().child(lit("pr"));
        let entries = match self.tree.read_dir(&base).await {
            Ok(entries) => entries,
            Err(StoreError::NotFound) => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let mut prs = BTreeMap::new();
        for entry in entries {
            let number: u64 = match entry.value().parse() {
                Ok(number) => number,
                Err(_) => {
                    warn!(%project, id = entry.value(), "malformed PR number; skipping");
                    continue;
                }
            };
            if let Some(pr) = self.load_pr(project, &entry, number).await? {
                prs.insert(number, pr);
            }
        }
        Ok(prs)
    }

    async fn load_pr(
        &self,
        project: &ProjectId,
        component: &TreePathComponent,
        number: u64,
    ) -> Result<Option<PullRequest>, MirrorError> {
        let dir = pr_dir(project, component);
        let Some(head_text) = read_text_opt(self.tree.as_ref(), &dir.child(lit("head"))).await?
        else {
            return Ok(None);
        };
        let Some(head) = CommitId::try_from_hex(&head_text) else {
            warn!(%project, number, "PR head is not a hex hash; skipping");
            return Ok(None);
        };
        let title = match read_text(self.tree.as_ref(), &dir.child(lit("title"))).await {
            Ok(title) => title,
            Err(err) => format!("Bad title: {err}"),
        };
        Ok(Some(PullRequest {
            project: project.clone(),
            number,
            title,
            head,
        }))
    }

    async fn load_refs(
        &self,
        project: &ProjectId,
    ) -> Result<BTreeMap<TreePath, RefInfo>, MirrorError> {
        let base = project.tree_path().child(lit("ref"));
        let top = match self.tree.read_dir(&base).await {
            Ok(entries) => entries,
            Err(StoreError::NotFound) => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let mut refs = BTreeMap::new();
        // Depth-first: a directory containing a `head` file is a ref; other
        // directories are namespaces to recurse into.
        let mut stack: Vec<TreePath> = top
            .into_iter()
            .map(|component| TreePath::from_components(vec![component]))
            .collect();
        while let Some(name) = stack.pop() {
            let dir = base.join(&name);
            if self.tree.exists_file(&dir.child(lit("head"))).await? {
                match name.components() {
                    [first, ..] if first.value() == "heads" || first.value() == "tags" => {}
                    _ => {
                        warn!(%project, %name, "ref outside heads/ or tags/; skipping");
                        continue;
                    }
                }
                if let Some(info) = self.named_ref(project, &name).await? {
                    refs.insert(name, info);
                }
            } else {
                match self.tree.read_dir(&dir).await {
                    Ok(children) => {
                        for child in children {
                            stack.push(name.child(child));
                        }
                    }
                    Err(StoreError::NotFound) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(refs)
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("Snapshot")
            .field("commit", &self.commit)
            .finish_non_exhaustive()
    }
}

/// Read/write access to the metadata branch.
pub struct Mirror {
    store: Arc<dyn Store>,
}

impl Mirror {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Mirror { store }
    }

    fn branch(&self) -> Box<dyn Branch> {
        self.store.branch(METADATA_BRANCH)
    }

    /// A snapshot of the metadata branch head. Fails if the branch does not
    /// exist yet.
    pub async fn snapshot(&self) -> Result<Snapshot, MirrorError> {
        let branch = self.branch();
        let head = branch.head().await?.ok_or(MirrorError::NoMetadataBranch)?;
        self.snapshot_at(branch.as_ref(), head).await
    }

    async fn snapshot_at(
        &self,
        branch: &dyn Branch,
        commit: CommitId,
    ) -> Result<Snapshot, MirrorError> {
        let tree = branch.tree(&commit).await?;
        Ok(Snapshot::new(commit, tree))
    }

    /// Reads the status of one commit/context pair from the current head.
    pub async fn commit_state(
        &self,
        commit: &CommitRef,
        context: &TreePath,
    ) -> Result<CommitStatus, MirrorError> {
        let snapshot = self.snapshot().await?;
        let dir = status_dir(commit, context);
        let tree = snapshot.tree.as_ref();
        let state = match read_text_opt(tree, &dir.child(lit("state"))).await? {
            Some(text) => match text.parse() {
                Ok(state) => Some(state),
                Err(err) => {
                    warn!(commit = %commit.hash.hex(), %err, "unparsable status state");
                    None
                }
            },
            None => None,
        };
        let description = read_text_opt(tree, &dir.child(lit("description"))).await?;
        let target_url = read_text_opt(tree, &dir.child(lit("target_url"))).await?;
        Ok(CommitStatus {
            state,
            description,
            target_url,
        })
    }

    /// Publishes a status for a commit/context pair. Retried on transient
    /// commit conflicts.
    pub async fn set_state(
        &self,
        commit: &CommitRef,
        context: &TreePath,
        state: StatusState,
        description: &str,
        target_url: Option<&str>,
        message: &str,
    ) -> Result<(), MirrorError> {
        let branch = self.branch();
        loop {
            let mut tx = branch.start_transaction().await?;
            let write = Self::write_status(&mut tx, commit, context, state, description, target_url);
            if let Err(err) = write.await {
                tx.abort().await;
                return Err(err.into());
            }
            match tx.commit(message).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict) => {
                    warn!(commit = %commit.hash.hex(), "status write conflicted; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn write_status(
        tx: &mut Box<dyn Transaction>,
        commit: &CommitRef,
        context: &TreePath,
        state: StatusState,
        description: &str,
        target_url: Option<&str>,
    ) -> StoreResult<()> {
        let dir = status_dir(commit, context);
        tx.make_dirs(&dir).await?;
        tx.create_or_replace_file(&dir.child(lit("state")), format!("{state}\n").as_bytes())
            .await?;
        tx.create_or_replace_file(
            &dir.child(lit("description")),
            format!("{description}\n").as_bytes(),
        )
        .await?;
        let url_path = dir.child(lit("target_url"));
        match target_url {
            Some(url) => {
                tx.create_or_replace_file(&url_path, format!("{url}\n").as_bytes())
                    .await?;
            }
            None => match tx.remove(&url_path).await {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(err) => return Err(err),
            },
        }
        Ok(())
    }

    /// Marks projects for monitoring by the forge bridge. One transaction;
    /// commits only if any marker was actually added.
    pub async fn enable_monitoring(&self, projects: &[ProjectId]) -> Result<(), MirrorError> {
        let branch = self.branch();
        let head = branch.head().await?;
        let tree = match &head {
            Some(commit) => Some(branch.tree(commit).await?),
            None => None,
        };
        let mut missing = vec![];
        for project in projects {
            let marker = project.tree_path().child(lit(MONITOR_MARKER));
            let present = match &tree {
                Some(tree) => tree.exists_file(&marker).await?,
                None => false,
            };
            if !present {
                missing.push(project.clone());
            }
        }
        let mut tx = branch.start_transaction().await?;
        if missing.is_empty() {
            tx.abort().await;
            return Ok(());
        }
        for project in &missing {
            let result = async {
                tx.make_dirs(&project.tree_path()).await?;
                tx.create_file(&project.tree_path().child(lit(MONITOR_MARKER)), b"")
                    .await
            };
            if let Err(err) = result.await {
                tx.abort().await;
                return Err(err.into());
            }
        }
        info!(count = missing.len(), "enabling monitoring");
        match tx.commit("Enable monitoring").await {
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Streams each new head of the metadata branch as a [`Snapshot`] until
    /// `cancel` trips. Store failures propagate to the caller's supervisor.
    pub async fn monitor<F>(
        &self,
        cancel: &CancellationFlag,
        mut on_snapshot: F,
    ) -> Result<(), MirrorError>
    where
        F: for<'a> FnMut(&'a Snapshot) -> BoxFuture<'a, Result<(), MirrorError>> + Send,
    {
        let branch = self.branch();
        let mut last_seen: Option<CommitId> = None;
        loop {
            let mut next: Option<CommitId> = None;
            branch
                .wait_for_head(cancel, &mut |head| match head {
                    Some(head) if last_seen.as_ref() != Some(head) => {
                        next = Some(head.clone());
                        true
                    }
                    _ => false,
                })
                .await?;
            let Some(commit) = next else {
                continue;
            };
            let snapshot = self.snapshot_at(branch.as_ref(), commit.clone()).await?;
            on_snapshot(&snapshot).await?;
            last_seen = Some(commit);
        }
    }
}

impl Debug for Mirror {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("Mirror").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_round_trip() {
        let project: ProjectId = "foo/bar".parse().unwrap();
        assert_eq!(project.user(), "foo");
        assert_eq!(project.repo(), "bar");
        assert_eq!(project.to_string(), "foo/bar");
        assert_eq!(project.tree_path().to_string(), "foo/bar");
    }

    #[test]
    fn test_project_id_rejects_other_shapes() {
        assert!("foo".parse::<ProjectId>().is_err());
        assert!("foo/bar/baz".parse::<ProjectId>().is_err());
        assert!("foo//bar".parse::<ProjectId>().is_err());
    }

    #[test]
    fn test_status_state_vocabulary() {
        for state in [
            StatusState::Error,
            StatusState::Pending,
            StatusState::Success,
            StatusState::Failure,
        ] {
            assert_eq!(state.to_string().parse::<StatusState>().unwrap(), state);
        }
        assert!("Success".parse::<StatusState>().is_err());
        assert!("ok".parse::<StatusState>().is_err());
    }
}
