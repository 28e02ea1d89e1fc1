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

//! Process-wide engine configuration: which projects to watch, how to reach
//! the store, and how results link back to the web UI.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Error, Formatter};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::engine::TargetId;
use crate::mirror::ProjectId;
use crate::store::{Store, StoreResult};
use crate::term::Term;

/// Produces a fresh store connection; invoked on startup and after a lost
/// connection.
pub type StoreConnector =
    Arc<dyn Fn() -> BoxFuture<'static, StoreResult<Arc<dyn Store>>> + Send + Sync>;

/// Maps a target to its named pipeline terms. Invoked once when the engine
/// first observes the target.
pub type PipelineFn = Arc<dyn Fn(&TargetId) -> BTreeMap<String, Arc<Term>> + Send + Sync>;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

pub struct EngineConfig {
    /// Base URL the published statuses link back to.
    pub web_base_url: String,
    pub store_connector: StoreConnector,
    pub projects: BTreeMap<ProjectId, PipelineFn>,
    /// When set for a project, targets outside the set are ignored.
    pub canaries: Option<BTreeMap<ProjectId, BTreeSet<TargetId>>>,
    pub reconnect_backoff: Duration,
}

impl EngineConfig {
    pub fn new(web_base_url: impl Into<String>, store_connector: StoreConnector) -> Self {
        EngineConfig {
            web_base_url: web_base_url.into(),
            store_connector,
            projects: BTreeMap::new(),
            canaries: None,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    pub fn add_project(&mut self, project: ProjectId, pipeline: PipelineFn) -> &mut Self {
        self.projects.insert(project, pipeline);
        self
    }

    pub fn set_canaries(&mut self, project: ProjectId, targets: BTreeSet<TargetId>) -> &mut Self {
        self.canaries
            .get_or_insert_with(BTreeMap::new)
            .insert(project, targets);
        self
    }
}

impl Debug for EngineConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("EngineConfig")
            .field("web_base_url", &self.web_base_url)
            .field("projects", &self.projects.keys().collect::<Vec<_>>())
            .field("canaries", &self.canaries)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .finish_non_exhaustive()
    }
}
