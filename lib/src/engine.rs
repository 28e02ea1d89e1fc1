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

//! The engine loop. On each metadata snapshot it synchronizes the in-memory
//! set of targets (PRs and refs) with their jobs, recomputes every job's
//! term under the global term lock, and publishes changed results back as
//! commit statuses. Store connections are supervised: a failure that the
//! `master` probe confirms is a store outage triggers a reconnect with
//! backoff instead of killing the loop.

use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display, Error, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use itertools::Itertools as _;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::cache::{BuildCache, RebuildHandle, RecalcFn};
use crate::cancel::CancellationFlag;
use crate::live_log::{LiveLogError, LiveLogManager};
use crate::mirror::{
    CommitRef, Mirror, MirrorError, ProjectId, ProjectState, PullRequest, RefInfo, Snapshot,
    StatusState,
};
use crate::object_id::CommitId;
use crate::settings::{EngineConfig, PipelineFn, StoreConnector};
use crate::store::{Store, StoreError};
use crate::term::{evaluate, panic_message, EvalContext, LogTree, Term, TermOutcome};
use crate::tree_path::{TreePath, TreePathComponent, TreePathParseError};

/// The branch probed to tell a store outage from an unrelated failure.
const PROBE_BRANCH: &str = "master";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine was cancelled")]
    Cancelled,
    #[error("No saved build log on branch {0:?}")]
    UnknownBuild(String),
    #[error(transparent)]
    Log(#[from] LiveLogError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The identity of a PR or ref within its project. Stable across head
/// updates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetId {
    Pr(u64),
    Ref(TreePath),
}

impl Display for TargetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            TargetId::Pr(number) => write!(f, "pr/{number}"),
            TargetId::Ref(name) => write!(f, "ref/{name}"),
        }
    }
}

struct TargetState {
    head: CommitId,
    title: String,
}

/// A PR or ref under evaluation. Identity is stable: snapshot updates swap
/// the head and title in place, and the contained jobs live as long as the
/// target does.
pub struct Target {
    project: ProjectId,
    id: TargetId,
    state: Mutex<TargetState>,
    jobs: Mutex<Vec<Arc<Job>>>,
}

impl Target {
    fn new(project: ProjectId, id: TargetId, head: CommitId, title: String) -> Arc<Target> {
        Arc::new(Target {
            project,
            id,
            state: Mutex::new(TargetState { head, title }),
            jobs: Mutex::new(vec![]),
        })
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn head(&self) -> CommitId {
        self.state.lock().unwrap().head.clone()
    }

    pub fn title(&self) -> String {
        self.state.lock().unwrap().title.clone()
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.lock().unwrap().clone()
    }

    fn update(&self, head: CommitId, title: String) {
        let mut state = self.state.lock().unwrap();
        state.head = head;
        state.title = title;
    }

    fn dump(&self) -> String {
        let state = self.state.lock().unwrap();
        let head = state.head.hex();
        let short = &head[..head.len().min(6)];
        match &self.id {
            TargetId::Pr(number) => {
                format!("PR#{number} (commit={short};title={})", state.title)
            }
            TargetId::Ref(name) => format!("Ref {name} (commit={short})"),
        }
    }

    fn web_url(&self, base: &str) -> String {
        match &self.id {
            TargetId::Pr(number) => {
                format!("{base}/pr/{}/{}/{number}", self.project.user(), self.project.repo())
            }
            TargetId::Ref(name) => {
                format!("{base}/ref/{}/{}/{name}", self.project.user(), self.project.repo())
            }
        }
    }
}

impl Debug for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("Target")
            .field("project", &self.project)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// The last result published to the forge for a job. The hash is the
/// target's head at the instant of publication; republication suppression
/// compares against it rather than re-deriving from the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedStatus {
    pub hash: CommitId,
    pub status: StatusState,
    pub description: String,
}

#[derive(Default)]
struct JobState {
    cancel: Option<Arc<CancellationFlag>>,
    published: Option<PublishedStatus>,
    logs: LogTree,
}

/// What the web layer reads of a job.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub status: Option<StatusState>,
    pub description: Option<String>,
    pub logs: LogTree,
}

/// A named pipeline term attached to a target.
pub struct Job {
    name: String,
    /// The status context the job publishes under.
    context: TreePath,
    term: Arc<Term>,
    target: Weak<Target>,
    state: Mutex<JobState>,
}

impl Job {
    fn new(
        name: String,
        term: Arc<Term>,
        target: Weak<Target>,
    ) -> Result<Job, TreePathParseError> {
        let context = TreePath::from_components(vec![TreePathComponent::new("ci")?])
            .join(&name.parse()?);
        Ok(Job {
            name,
            context,
            term,
            target,
            state: Mutex::new(JobState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &TreePath {
        &self.context
    }

    pub fn target(&self) -> Option<Arc<Target>> {
        self.target.upgrade()
    }

    pub fn summary(&self) -> JobSummary {
        let state = self.state.lock().unwrap();
        JobSummary {
            status: state.published.as_ref().map(|published| published.status),
            description: state
                .published
                .as_ref()
                .map(|published| published.description.clone()),
            logs: state.logs.clone(),
        }
    }

    pub fn published(&self) -> Option<PublishedStatus> {
        self.state.lock().unwrap().published.clone()
    }

    fn logs(&self) -> LogTree {
        self.state.lock().unwrap().logs.clone()
    }

    /// Cancels the in-flight evaluation, if any. Idempotent; each handle is
    /// tripped at most once because it is taken out of the slot.
    fn cancel_evaluation(&self) {
        let cancel = self.state.lock().unwrap().cancel.take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    fn set_cancel(&self, cancel: Arc<CancellationFlag>) {
        self.state.lock().unwrap().cancel = Some(cancel);
    }

    fn record(&self, published: PublishedStatus, logs: LogTree) {
        let mut state = self.state.lock().unwrap();
        state.published = Some(published);
        state.logs = logs;
    }

    fn term(&self) -> &Arc<Term> {
        &self.term
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("Job").field("name", &self.name).finish_non_exhaustive()
    }
}

/// The targets of one project, keyed the way snapshots key them.
#[derive(Clone, Default)]
pub struct ProjectTargets {
    pub prs: BTreeMap<u64, Arc<Target>>,
    pub refs: BTreeMap<TreePath, Arc<Target>>,
}

impl ProjectTargets {
    pub fn all(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.prs.values().chain(self.refs.values())
    }
}

/// A live connection to the store, shared by everything the engine does
/// between two reconnects.
#[derive(Clone)]
pub struct Connection {
    pub store: Arc<dyn Store>,
    pub mirror: Arc<Mirror>,
    pub cache: Arc<BuildCache>,
}

type ConnectFuture = Shared<BoxFuture<'static, Connection>>;

struct EngineInner {
    web_base_url: String,
    connector: StoreConnector,
    reconnect_backoff: Duration,
    pipelines: BTreeMap<ProjectId, PipelineFn>,
    canaries: Option<BTreeMap<ProjectId, BTreeSet<TargetId>>>,
    logs: LiveLogManager,
    /// Serializes every result-mutating phase: snapshot sync, recalculation,
    /// and rebuilds.
    term_lock: tokio::sync::Mutex<()>,
    db: Mutex<ConnectFuture>,
    projects: Mutex<BTreeMap<ProjectId, ProjectTargets>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        if let Some(canaries) = &config.canaries {
            for project in canaries.keys() {
                if !config.projects.contains_key(project) {
                    warn!(%project, "canary filter names a project that is not monitored");
                }
            }
        }
        let logs = LiveLogManager::new();
        let db = Self::connect(
            config.store_connector.clone(),
            config.reconnect_backoff,
            logs.clone(),
        );
        Engine {
            inner: Arc::new(EngineInner {
                web_base_url: config.web_base_url,
                connector: config.store_connector,
                reconnect_backoff: config.reconnect_backoff,
                pipelines: config.projects,
                canaries: config.canaries,
                logs,
                term_lock: tokio::sync::Mutex::new(()),
                db: Mutex::new(db),
                projects: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Connects to the store, retrying with backoff until it succeeds.
    fn connect(
        connector: StoreConnector,
        backoff: Duration,
        logs: LiveLogManager,
    ) -> ConnectFuture {
        async move {
            loop {
                match connector().await {
                    Ok(store) => {
                        info!("connected to store");
                        let mirror = Arc::new(Mirror::new(store.clone()));
                        let cache = Arc::new(BuildCache::new(store.clone(), logs.clone()));
                        return Connection {
                            store,
                            mirror,
                            cache,
                        };
                    }
                    Err(err) => {
                        error!(%err, "store connection failed; backing off");
                        sleep(backoff).await;
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn connection(&self) -> Connection {
        let pending = self.inner.db.lock().unwrap().clone();
        pending.await
    }

    /// Replaces the connection with a fresh pending connect. A no-op when a
    /// connect is already in flight.
    fn reconnect(&self) {
        let mut db = self.inner.db.lock().unwrap();
        if db.peek().is_none() {
            return;
        }
        *db = Self::connect(
            self.inner.connector.clone(),
            self.inner.reconnect_backoff,
            self.inner.logs.clone(),
        );
    }

    /// Runs `f` against the current connection, restarting it across store
    /// outages. A failure with a healthy `master` probe is assumed to be the
    /// caller's own and propagates.
    async fn auto_restart<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationFlag,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: Fn(Connection) -> Fut,
        Fut: std::future::Future<Output = Result<T, EngineError>>,
    {
        loop {
            let connection = self.connection().await;
            let err = match f(connection.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match connection.store.branch(PROBE_BRANCH).head().await {
                Ok(_) => return Err(err),
                Err(probe) => {
                    warn!(label, %err, %probe, "store connection lost; reconnecting");
                    self.reconnect();
                }
            }
        }
    }

    /// The monitor loop: marks the configured projects for monitoring, then
    /// feeds every new metadata snapshot through the per-snapshot step until
    /// cancelled.
    pub async fn run(&self, cancel: &CancellationFlag) -> Result<(), EngineError> {
        let projects = self.inner.pipelines.keys().cloned().collect_vec();
        let result = self
            .auto_restart("monitor", cancel, |connection| {
                let engine = self.clone();
                let projects = projects.clone();
                async move {
                    connection.mirror.enable_monitoring(&projects).await?;
                    connection
                        .mirror
                        .monitor(cancel, |snapshot| {
                            let engine = engine.clone();
                            let connection = connection.clone();
                            async move { engine.handle_snapshot(&connection, snapshot).await }
                                .boxed()
                        })
                        .await?;
                    Ok(())
                }
            })
            .await;
        match result {
            Err(EngineError::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// The per-snapshot step. Holds the term lock across target sync and all
    /// recalculations, so evaluations complete in snapshot-arrival order.
    async fn handle_snapshot(
        &self,
        connection: &Connection,
        snapshot: &Snapshot,
    ) -> Result<(), MirrorError> {
        let _guard = self.inner.term_lock.lock().await;
        info!(commit = %snapshot.commit().hex(), "processing metadata snapshot");
        let mut jobs = vec![];
        for (project, pipeline) in &self.inner.pipelines {
            let state = snapshot.project(project).await?;
            jobs.extend(self.sync_project(project, pipeline, &state));
        }
        for job in jobs {
            self.recalculate(connection, snapshot, &job).await?;
        }
        Ok(())
    }

    fn canary_allows(&self, project: &ProjectId, id: &TargetId) -> bool {
        match self.inner.canaries.as_ref().and_then(|map| map.get(project)) {
            Some(allowed) => allowed.contains(id),
            None => true,
        }
    }

    /// Diffs one project's targets against the snapshot: cancels and drops
    /// vanished targets, creates new ones with their pipeline jobs, and
    /// updates surviving heads in place. Returns every current job.
    fn sync_project(
        &self,
        project: &ProjectId,
        pipeline: &PipelineFn,
        state: &ProjectState,
    ) -> Vec<Arc<Job>> {
        let mut map = self.inner.projects.lock().unwrap();
        let entry = map.entry(project.clone()).or_default();

        let prs: BTreeMap<u64, &PullRequest> = state
            .prs
            .iter()
            .filter(|(number, _)| self.canary_allows(project, &TargetId::Pr(**number)))
            .map(|(number, pr)| (*number, pr))
            .collect();
        let closed = entry
            .prs
            .keys()
            .filter(|number| !prs.contains_key(*number))
            .copied()
            .collect_vec();
        for number in closed {
            if let Some(target) = entry.prs.remove(&number) {
                info!(%project, number, "PR closed; cancelling jobs");
                for job in target.jobs() {
                    job.cancel_evaluation();
                }
            }
        }
        for (number, pr) in prs {
            match entry.prs.entry(number) {
                btree_map::Entry::Occupied(slot) => {
                    slot.get().update(pr.head.clone(), pr.title.clone());
                }
                btree_map::Entry::Vacant(slot) => {
                    info!(%project, number, "new PR");
                    slot.insert(Self::new_target(
                        project,
                        TargetId::Pr(number),
                        pr.head.clone(),
                        pr.title.clone(),
                        pipeline,
                    ));
                }
            }
        }

        let refs: BTreeMap<&TreePath, &RefInfo> = state
            .refs
            .iter()
            .filter(|(name, _)| self.canary_allows(project, &TargetId::Ref((*name).clone())))
            .collect();
        let removed = entry
            .refs
            .keys()
            .filter(|name| !refs.contains_key(name))
            .cloned()
            .collect_vec();
        for name in removed {
            if let Some(target) = entry.refs.remove(&name) {
                info!(%project, %name, "ref removed; cancelling jobs");
                for job in target.jobs() {
                    job.cancel_evaluation();
                }
            }
        }
        for (name, info) in refs {
            match entry.refs.entry(name.clone()) {
                btree_map::Entry::Occupied(slot) => {
                    slot.get().update(info.head.clone(), name.to_string());
                }
                btree_map::Entry::Vacant(slot) => {
                    info!(%project, %name, "new ref");
                    slot.insert(Self::new_target(
                        project,
                        TargetId::Ref(name.clone()),
                        info.head.clone(),
                        name.to_string(),
                        pipeline,
                    ));
                }
            }
        }

        entry.all().flat_map(|target| target.jobs()).collect()
    }

    fn new_target(
        project: &ProjectId,
        id: TargetId,
        head: CommitId,
        title: String,
        pipeline: &PipelineFn,
    ) -> Arc<Target> {
        let target = Target::new(project.clone(), id.clone(), head, title);
        let mut jobs = vec![];
        for (name, term) in pipeline(&id) {
            match Job::new(name.clone(), term, Arc::downgrade(&target)) {
                Ok(job) => jobs.push(Arc::new(job)),
                Err(err) => {
                    warn!(%project, %id, %name, %err, "invalid job name; skipping job");
                }
            }
        }
        *target.jobs.lock().unwrap() = jobs;
        target
    }

    /// Schedules one term-lock-guarded re-snapshot-and-recalculate of `job`
    /// on the engine loop. Used as the wakeup for asynchronous dependencies.
    fn recalc_fn(&self, job: &Arc<Job>) -> RecalcFn {
        let engine = self.clone();
        let job = Arc::downgrade(job);
        Arc::new(move || {
            let engine = engine.clone();
            let job = job.clone();
            let _ = tokio::spawn(async move {
                let Some(job) = job.upgrade() else {
                    return;
                };
                if let Err(err) = engine.recalculate_detached(&job).await {
                    warn!(%err, "scheduled recalculation failed");
                }
            });
        })
    }

    async fn recalculate_detached(&self, job: &Arc<Job>) -> Result<(), EngineError> {
        let connection = self.connection().await;
        let _guard = self.inner.term_lock.lock().await;
        let snapshot = connection.mirror.snapshot().await?;
        self.recalculate(&connection, &snapshot, job).await?;
        Ok(())
    }

    /// Re-evaluates one job and publishes the result if the
    /// `(hash, status, description)` triple changed. Must hold the term
    /// lock. Never fails on a term-level error; store-level publication
    /// failures propagate so the supervisor retries.
    async fn recalculate(
        &self,
        connection: &Connection,
        _snapshot: &Snapshot,
        job: &Arc<Job>,
    ) -> Result<(), MirrorError> {
        job.cancel_evaluation();
        let Some(target) = job.target() else {
            return Ok(());
        };
        let head = target.head();
        let cancel = Arc::new(CancellationFlag::new());
        job.set_cancel(cancel.clone());
        let ctx = EvalContext {
            head: head.clone(),
            title: target.title(),
            recalc: self.recalc_fn(job),
            cache: connection.cache.clone(),
            cancel,
        };
        let (outcome, logs) = match AssertUnwindSafe(evaluate(&ctx, job.term())).catch_unwind().await
        {
            Ok(result) => result,
            Err(panic) => (
                TermOutcome::Failure(panic_message(&panic)),
                LogTree::Empty,
            ),
        };
        let status = outcome.status();
        let description = outcome.description().to_string();
        let changed = match job.published() {
            Some(published) => {
                (published.hash, published.status, published.description)
                    != (head.clone(), status, description.clone())
            }
            None => true,
        };
        if changed {
            let message = format!("Set state of {}: {} = {}", target.dump(), job.name(), status);
            let commit = CommitRef {
                project: target.project().clone(),
                hash: head.clone(),
            };
            let url = target.web_url(&self.inner.web_base_url);
            connection
                .mirror
                .set_state(
                    &commit,
                    job.context(),
                    status,
                    &description,
                    Some(&url),
                    &message,
                )
                .await?;
        }
        job.record(
            PublishedStatus {
                hash: head,
                status,
                description,
            },
            logs,
        );
        Ok(())
    }

    /// Forces the rebuild triggers of every saved log on `branch` and
    /// recalculates the affected jobs. Fails without touching anything when
    /// no job's logs reference the branch.
    pub async fn rebuild(&self, branch: &str) -> Result<(), EngineError> {
        let mut matched: Vec<Arc<Job>> = vec![];
        let mut triggers: Vec<Arc<RebuildHandle>> = vec![];
        {
            let map = self.inner.projects.lock().unwrap();
            for targets in map.values() {
                for target in targets.all() {
                    for job in target.jobs() {
                        if collect_rebuilds(&job.logs(), branch, &mut triggers) {
                            matched.push(job);
                        }
                    }
                }
            }
        }
        if matched.is_empty() {
            return Err(EngineError::UnknownBuild(branch.to_owned()));
        }
        info!(branch, jobs = matched.len(), "rebuilding");
        let forced = futures::future::join_all(triggers.iter().map(|trigger| trigger.force()));
        for result in forced.await {
            result?;
        }
        let connection = self.connection().await;
        let _guard = self.inner.term_lock.lock().await;
        let snapshot = connection.mirror.snapshot().await?;
        for job in &matched {
            self.recalculate(&connection, &snapshot, job).await?;
        }
        Ok(())
    }

    /// Cancels the live build streaming to `branch`, if any.
    pub fn cancel_build(&self, branch: &str) -> Result<(), EngineError> {
        Ok(self.inner.logs.cancel(branch)?)
    }

    /// The current in-memory view, for the web layer. Reads may observe a
    /// sync in progress; targets themselves are updated atomically.
    pub fn projects(&self) -> BTreeMap<ProjectId, ProjectTargets> {
        self.inner.projects.lock().unwrap().clone()
    }

    pub fn target(&self, project: &ProjectId, id: &TargetId) -> Option<Arc<Target>> {
        let map = self.inner.projects.lock().unwrap();
        let targets = map.get(project)?;
        match id {
            TargetId::Pr(number) => targets.prs.get(number).cloned(),
            TargetId::Ref(name) => targets.refs.get(name).cloned(),
        }
    }

    pub fn logs(&self) -> &LiveLogManager {
        &self.inner.logs
    }

    /// The store handle of the current connection, for serving saved logs.
    pub async fn store(&self) -> Arc<dyn Store> {
        self.connection().await.store
    }
}

/// Collects the not-yet-forced rebuild triggers for `branch` out of a log
/// tree. Returns whether the tree references the branch at all.
fn collect_rebuilds(tree: &LogTree, branch: &str, out: &mut Vec<Arc<RebuildHandle>>) -> bool {
    match tree {
        LogTree::Saved {
            branch: saved_branch,
            rebuild,
            ..
        } if saved_branch == branch => {
            if !rebuild.is_forced() {
                out.push(rebuild.clone());
            }
            true
        }
        LogTree::Pair(left, right) => {
            let left_match = collect_rebuilds(left, branch, out);
            let right_match = collect_rebuilds(right, branch, out);
            left_match || right_match
        }
        _ => false,
    }
}
