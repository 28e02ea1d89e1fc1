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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use futures::FutureExt;
use gantry_lib::cache::{build_branch, fingerprint, BuildCache, BuildFn, CacheState, RecalcFn};
use gantry_lib::live_log::LiveLogManager;
use gantry_lib::store::Store;
use gantry_lib::term::LogTree;
use testutils::{mem_store, wait_until};
use tokio::sync::Notify;

struct Fixture {
    store: Arc<gantry_lib::mem_store::MemStore>,
    logs: LiveLogManager,
    cache: Arc<BuildCache>,
}

fn fixture() -> Fixture {
    let store = mem_store();
    let logs = LiveLogManager::new();
    let dyn_store: Arc<dyn Store> = store.clone();
    let cache = Arc::new(BuildCache::new(dyn_store, logs.clone()));
    Fixture { store, logs, cache }
}

/// A recalc hook that counts how often it fires.
fn counting_recalc() -> (RecalcFn, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = {
        let count = count.clone();
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }) as RecalcFn
    };
    (hook, count)
}

/// A build step that logs, optionally waits for `gate`, and counts runs.
fn step(
    runs: Arc<AtomicUsize>,
    gate: Option<Arc<Notify>>,
    result: Result<&'static str, &'static str>,
) -> BuildFn {
    Box::new(move |log, _cancel| {
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            log.append(b"building\n").await;
            if let Some(gate) = gate {
                gate.notified().await;
            }
            result.map(str::to_string).map_err(str::to_string)
        }
        .boxed()
    })
}

#[tokio::test]
async fn test_miss_builds_then_hit_returns_saved() {
    let fixture = fixture();
    let runs = Arc::new(AtomicUsize::new(0));
    let (recalc, woken) = counting_recalc();

    let state = fixture
        .cache
        .lookup("unit", "input", recalc.clone(), step(runs.clone(), None, Ok("passed")))
        .await
        .unwrap();
    let live_branch = match state {
        CacheState::Building {
            log: LogTree::Live { branch, .. },
        } => branch,
        _ => panic!("expected a live build"),
    };
    assert_eq!(live_branch, build_branch("unit", &fingerprint("unit", "input")));

    // The finished build wakes the demander exactly once.
    wait_until("build completion wakeup", || async {
        (woken.load(Ordering::SeqCst) == 1).then_some(())
    })
    .await;

    let state = fixture
        .cache
        .lookup("unit", "input", recalc, step(runs.clone(), None, Ok("unused")))
        .await
        .unwrap();
    match state {
        CacheState::Done { record, log } => {
            assert!(record.ok);
            assert_eq!(record.output, "passed");
            assert_matches!(log, LogTree::Saved { .. });
        }
        CacheState::Building { .. } => panic!("expected a cached result"),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_demands_share_one_build() {
    let fixture = fixture();
    let runs = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let (recalc_a, woken_a) = counting_recalc();
    let (recalc_b, woken_b) = counting_recalc();

    let first = fixture
        .cache
        .lookup(
            "unit",
            "input",
            recalc_a,
            step(runs.clone(), Some(gate.clone()), Ok("passed")),
        )
        .await
        .unwrap();
    let second = fixture
        .cache
        .lookup(
            "unit",
            "input",
            recalc_b,
            step(runs.clone(), Some(gate.clone()), Ok("never runs")),
        )
        .await
        .unwrap();

    // Both demands see the same live log.
    let (log_a, log_b) = match (&first, &second) {
        (
            CacheState::Building {
                log: LogTree::Live { log: log_a, .. },
            },
            CacheState::Building {
                log: LogTree::Live { log: log_b, .. },
            },
        ) => (log_a.clone(), log_b.clone()),
        _ => panic!("expected two live builds"),
    };
    assert!(Arc::ptr_eq(&log_a, &log_b));

    // notify_one stores a permit, so the build cannot miss the release even
    // if it has not reached the gate yet.
    gate.notify_one();
    wait_until("both demands woken", || async {
        (woken_a.load(Ordering::SeqCst) == 1 && woken_b.load(Ordering::SeqCst) == 1).then_some(())
    })
    .await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    // The cache branch was written exactly once.
    let branch = build_branch("unit", &fingerprint("unit", "input"));
    assert_eq!(fixture.store.history(&branch).len(), 1);
}

#[tokio::test]
async fn test_results_survive_restart() {
    let fixture = fixture();
    let runs = Arc::new(AtomicUsize::new(0));
    let (recalc, woken) = counting_recalc();
    let _ = fixture
        .cache
        .lookup("unit", "input", recalc.clone(), step(runs.clone(), None, Err("broke")))
        .await
        .unwrap();
    wait_until("build completion", || async {
        (woken.load(Ordering::SeqCst) == 1).then_some(())
    })
    .await;

    // A fresh cache (fresh pending map, same store) serves the saved entry.
    let dyn_store: Arc<dyn Store> = fixture.store.clone();
    let restarted = Arc::new(BuildCache::new(dyn_store, LiveLogManager::new()));
    let state = restarted
        .lookup("unit", "input", recalc, step(runs.clone(), None, Ok("unused")))
        .await
        .unwrap();
    match state {
        CacheState::Done { record, .. } => {
            assert!(!record.ok);
            assert_eq!(record.output, "broke");
        }
        CacheState::Building { .. } => panic!("expected a cached result"),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rebuild_trigger_invalidates_once() {
    let fixture = fixture();
    let runs = Arc::new(AtomicUsize::new(0));
    let (recalc, woken) = counting_recalc();
    let _ = fixture
        .cache
        .lookup("unit", "input", recalc.clone(), step(runs.clone(), None, Ok("passed")))
        .await
        .unwrap();
    wait_until("first build", || async {
        (woken.load(Ordering::SeqCst) == 1).then_some(())
    })
    .await;

    let state = fixture
        .cache
        .lookup("unit", "input", recalc.clone(), step(runs.clone(), None, Ok("passed")))
        .await
        .unwrap();
    let rebuild = match state {
        CacheState::Done {
            log: LogTree::Saved { rebuild, .. },
            ..
        } => rebuild,
        _ => panic!("expected a saved entry"),
    };

    assert!(!rebuild.is_forced());
    rebuild.force().await.unwrap();
    assert!(rebuild.is_forced());
    let commits = fixture.store.history(rebuild.branch()).len();
    // The trigger is one-shot; forcing again writes nothing.
    rebuild.force().await.unwrap();
    assert_eq!(fixture.store.history(rebuild.branch()).len(), commits);

    // Next demand re-executes.
    let state = fixture
        .cache
        .lookup("unit", "input", recalc, step(runs.clone(), None, Ok("passed again")))
        .await
        .unwrap();
    assert_matches!(state, CacheState::Building { .. });
    wait_until("rebuild to finish", || async {
        (runs.load(Ordering::SeqCst) == 2).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_cancelling_the_live_log_stops_the_build() {
    let fixture = fixture();
    let (recalc, woken) = counting_recalc();
    let run: BuildFn = Box::new(|log, cancel| {
        async move {
            log.append(b"spinning\n").await;
            cancel.cancelled().await;
            Err("cancelled".to_string())
        }
        .boxed()
    });
    let state = fixture
        .cache
        .lookup("unit", "input", recalc, run)
        .await
        .unwrap();
    let branch = match state {
        CacheState::Building {
            log: LogTree::Live { branch, .. },
        } => branch,
        _ => panic!("expected a live build"),
    };

    fixture.logs.cancel(&branch).unwrap();
    wait_until("cancelled build to settle", || async {
        (woken.load(Ordering::SeqCst) == 1).then_some(())
    })
    .await;
    // The cancelled outcome is persisted like any other failure.
    let state = fixture
        .cache
        .lookup(
            "unit",
            "input",
            Arc::new(|| {}),
            Box::new(|_, _| async { Ok("unused".to_string()) }.boxed()),
        )
        .await
        .unwrap();
    assert_matches!(state, CacheState::Done { record, .. } if !record.ok);
}
