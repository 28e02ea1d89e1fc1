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

//! The pipeline language and its evaluator. A term is a pure, declarative
//! DAG: leaves observe the evaluated target's snapshot data, `All` fans in
//! over sub-terms, and `Build` performs memoized side-effectful work keyed
//! by the fingerprint of its input. Shared `Arc` nodes are evaluated at most
//! once per run, so fan-in over the same sub-term collapses.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Error, Formatter};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cache::{BuildCache, BuildFn, CacheState, RebuildHandle, RecalcFn};
use crate::cancel::CancellationFlag;
use crate::live_log::LiveLog;
use crate::mirror::StatusState;
use crate::object_id::CommitId;

/// The environment a build step runs in: the resolved input value, the live
/// log to append progress to, and the cancellation flag of this build.
pub struct BuildContext {
    pub input: String,
    pub log: Arc<LiveLog>,
    pub cancel: Arc<CancellationFlag>,
}

/// The side-effectful work of a [`Term::Build`] node. The cache invokes it
/// at most once per fingerprint.
pub type BuildStep =
    Arc<dyn Fn(BuildContext) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

pub enum Term {
    /// An immediately successful value.
    Const(String),
    /// An immediately failed value.
    Fail(String),
    /// The evaluated target's head commit hash, in hex.
    Head,
    /// The evaluated target's title (PR title, or the ref name).
    Title,
    /// All sub-terms must succeed; pending while any is pending, failed on
    /// the first failure, otherwise the value of the last sub-term.
    All(Vec<Arc<Term>>),
    /// Memoized side-effectful work keyed by the fingerprint of `name` and
    /// the input term's value.
    Build {
        name: String,
        input: Arc<Term>,
        step: BuildStep,
    },
}

impl Term {
    pub fn constant(value: impl Into<String>) -> Arc<Term> {
        Arc::new(Term::Const(value.into()))
    }

    pub fn fail(message: impl Into<String>) -> Arc<Term> {
        Arc::new(Term::Fail(message.into()))
    }

    pub fn head() -> Arc<Term> {
        Arc::new(Term::Head)
    }

    pub fn title() -> Arc<Term> {
        Arc::new(Term::Title)
    }

    pub fn all(terms: Vec<Arc<Term>>) -> Arc<Term> {
        Arc::new(Term::All(terms))
    }

    pub fn build(
        name: impl Into<String>,
        input: Arc<Term>,
        step: impl Fn(BuildContext) -> BoxFuture<'static, Result<String, String>>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Term> {
        Arc::new(Term::Build {
            name: name.into(),
            input,
            step: Arc::new(step),
        })
    }

    fn children(&self) -> Vec<Arc<Term>> {
        match self {
            Term::Const(_) | Term::Fail(_) | Term::Head | Term::Title => vec![],
            Term::All(terms) => terms.clone(),
            Term::Build { input, .. } => vec![input.clone()],
        }
    }
}

impl Debug for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            Term::Const(value) => f.debug_tuple("Const").field(value).finish(),
            Term::Fail(message) => f.debug_tuple("Fail").field(message).finish(),
            Term::Head => f.write_str("Head"),
            Term::Title => f.write_str("Title"),
            Term::All(terms) => f.debug_tuple("All").field(terms).finish(),
            Term::Build { name, input, .. } => f
                .debug_struct("Build")
                .field("name", name)
                .field("input", input)
                .finish_non_exhaustive(),
        }
    }
}

/// The final value of a term evaluation, mapping directly onto the forge's
/// status vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermOutcome {
    Success(String),
    Pending(String),
    Failure(String),
}

impl TermOutcome {
    pub fn status(&self) -> StatusState {
        match self {
            TermOutcome::Success(_) => StatusState::Success,
            TermOutcome::Pending(_) => StatusState::Pending,
            TermOutcome::Failure(_) => StatusState::Failure,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            TermOutcome::Success(description)
            | TermOutcome::Pending(description)
            | TermOutcome::Failure(description) => description,
        }
    }
}

/// The logs produced along one evaluation, mirroring the term's shape.
#[derive(Clone, Default)]
pub enum LogTree {
    #[default]
    Empty,
    Live {
        branch: String,
        log: Arc<LiveLog>,
    },
    Saved {
        branch: String,
        rebuild: Arc<RebuildHandle>,
        commit: CommitId,
    },
    Pair(Box<LogTree>, Box<LogTree>),
}

impl LogTree {
    /// Joins two log trees, dropping empty sides.
    pub fn pair(left: LogTree, right: LogTree) -> LogTree {
        match (left, right) {
            (LogTree::Empty, right) => right,
            (left, LogTree::Empty) => left,
            (left, right) => LogTree::Pair(Box::new(left), Box::new(right)),
        }
    }
}

impl Debug for LogTree {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            LogTree::Empty => f.write_str("Empty"),
            LogTree::Live { branch, .. } => f.debug_tuple("Live").field(branch).finish(),
            LogTree::Saved { branch, commit, .. } => f
                .debug_struct("Saved")
                .field("branch", branch)
                .field("commit", &commit.hex())
                .finish(),
            LogTree::Pair(left, right) => {
                f.debug_tuple("Pair").field(left).field(right).finish()
            }
        }
    }
}

/// Everything one evaluation runs against. The engine constructs one per
/// `recalculate`, with a fresh cancellation flag.
pub struct EvalContext {
    /// The target's head commit at the snapshot being evaluated.
    pub head: CommitId,
    /// The target's title.
    pub title: String,
    /// Schedules one engine-loop recomputation; handed to the cache so
    /// finishing builds wake the job.
    pub recalc: RecalcFn,
    pub cache: Arc<BuildCache>,
    /// Tripped when this evaluation is superseded or its target goes away.
    pub cancel: Arc<CancellationFlag>,
}

/// Evaluates a term against the context. Each DAG node is computed at most
/// once; builds are delegated to the cache, which reports `Pending` demands
/// through live logs and wakes the job via `recalc` when they finish.
pub async fn evaluate(ctx: &EvalContext, term: &Arc<Term>) -> (TermOutcome, LogTree) {
    // Structural identity: nodes are keyed by their `Arc` address, so a
    // sub-term shared between branches is computed once per run.
    let node_id = |node: &Arc<Term>| Arc::as_ptr(node) as usize;
    let order = crate::dag_walk::topo_order_forward([term.clone()], node_id, |node| {
        node.children()
    });
    let mut results: HashMap<usize, (TermOutcome, LogTree)> = HashMap::new();
    for node in order {
        if ctx.cancel.is_cancelled() {
            return (
                TermOutcome::Failure("evaluation cancelled".to_string()),
                LogTree::Empty,
            );
        }
        let result = evaluate_node(ctx, &node, &results).await;
        results.insert(node_id(&node), result);
    }
    results
        .remove(&node_id(term))
        .expect("root term was evaluated")
}

async fn evaluate_node(
    ctx: &EvalContext,
    node: &Arc<Term>,
    results: &HashMap<usize, (TermOutcome, LogTree)>,
) -> (TermOutcome, LogTree) {
    let child = |term: &Arc<Term>| {
        results
            .get(&(Arc::as_ptr(term) as usize))
            .expect("children evaluated before parents")
            .clone()
    };
    match node.as_ref() {
        Term::Const(value) => (TermOutcome::Success(value.clone()), LogTree::Empty),
        Term::Fail(message) => (TermOutcome::Failure(message.clone()), LogTree::Empty),
        Term::Head => (TermOutcome::Success(ctx.head.hex()), LogTree::Empty),
        Term::Title => (TermOutcome::Success(ctx.title.clone()), LogTree::Empty),
        Term::All(terms) => {
            let mut logs = LogTree::Empty;
            let mut pending: Option<TermOutcome> = None;
            let mut value = "ok".to_string();
            for term in terms {
                let (outcome, log) = child(term);
                logs = LogTree::pair(logs, log);
                match outcome {
                    TermOutcome::Failure(message) => {
                        return (TermOutcome::Failure(message), logs);
                    }
                    TermOutcome::Pending(message) => {
                        pending.get_or_insert(TermOutcome::Pending(message));
                    }
                    TermOutcome::Success(output) => value = output,
                }
            }
            match pending {
                Some(outcome) => (outcome, logs),
                None => (TermOutcome::Success(value), logs),
            }
        }
        Term::Build { name, input, step } => {
            let (input_outcome, input_log) = child(input);
            let input_value = match input_outcome {
                TermOutcome::Success(value) => value,
                other => return (other, input_log),
            };
            let step = step.clone();
            let run_input = input_value.clone();
            let run: BuildFn = Box::new(move |log, cancel| {
                step(BuildContext {
                    input: run_input,
                    log,
                    cancel,
                })
            });
            match ctx
                .cache
                .lookup(name, &input_value, ctx.recalc.clone(), run)
                .await
            {
                Ok(CacheState::Done { record, log }) => {
                    let outcome = if record.ok {
                        TermOutcome::Success(record.output)
                    } else {
                        TermOutcome::Failure(record.output)
                    };
                    (outcome, LogTree::pair(input_log, log))
                }
                Ok(CacheState::Building { log }) => (
                    TermOutcome::Pending(format!("Building {name}")),
                    LogTree::pair(input_log, log),
                ),
                Err(err) => (
                    TermOutcome::Failure(format!("{name}: {err}")),
                    input_log,
                ),
            }
        }
    }
}

/// Renders a panic payload for status descriptions.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_children_are_shared_structurally() {
        let shared = Term::constant("x");
        let term = Term::all(vec![shared.clone(), shared.clone()]);
        let order = crate::dag_walk::topo_order_forward(
            [term.clone()],
            |node| Arc::as_ptr(node) as usize,
            |node| node.children(),
        );
        // The shared child shows up once, not twice.
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn test_outcome_status_mapping() {
        assert_eq!(
            TermOutcome::Success("x".to_string()).status(),
            StatusState::Success
        );
        assert_eq!(
            TermOutcome::Pending("x".to_string()).status(),
            StatusState::Pending
        );
        assert_eq!(
            TermOutcome::Failure("x".to_string()).status(),
            StatusState::Failure
        );
    }

    #[test]
    fn test_log_tree_pair_drops_empty() {
        let pair = LogTree::pair(LogTree::Empty, LogTree::Empty);
        assert!(matches!(pair, LogTree::Empty));
    }
}
