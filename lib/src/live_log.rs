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

//! In-memory append-only log streams for in-progress builds, keyed by the
//! store branch the build will be saved to. At most one live log exists per
//! branch at a time; subscribers get the buffered prefix immediately and
//! then chunks as they arrive. Producers block on a congested subscriber
//! rather than dropping data.

use std::collections::HashMap;
use std::fmt::{Debug, Error, Formatter};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::cancel::CancellationFlag;

/// Frames a producer may have in flight per subscriber before it blocks.
pub const SUBSCRIBER_CAPACITY: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiveLogError {
    #[error("A build is already streaming to branch {0:?}")]
    AlreadyLive(String),
    #[error("No live build log on branch {0:?}")]
    NotFound(String),
}

#[derive(Clone, Default)]
pub struct LiveLogManager {
    inner: Arc<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    live: Mutex<HashMap<String, Arc<LiveLog>>>,
}

impl LiveLogManager {
    pub fn new() -> Self {
        LiveLogManager::default()
    }

    /// Registers a new live log for `branch`. `cancel` is the flag of the
    /// computation feeding the log; [`LiveLog::cancel`] trips it.
    pub fn create(
        &self,
        branch: &str,
        cancel: Arc<CancellationFlag>,
    ) -> Result<Arc<LiveLog>, LiveLogError> {
        let mut live = self.inner.live.lock().unwrap();
        if live.contains_key(branch) {
            return Err(LiveLogError::AlreadyLive(branch.to_owned()));
        }
        let log = Arc::new(LiveLog {
            branch: branch.to_owned(),
            cancel,
            manager: Arc::downgrade(&self.inner),
            state: tokio::sync::Mutex::new(LogState::default()),
        });
        live.insert(branch.to_owned(), log.clone());
        Ok(log)
    }

    pub fn lookup(&self, branch: &str) -> Option<Arc<LiveLog>> {
        self.inner.live.lock().unwrap().get(branch).cloned()
    }

    /// Cancels the computation behind the live log on `branch`, if any.
    pub fn cancel(&self, branch: &str) -> Result<(), LiveLogError> {
        let log = self
            .lookup(branch)
            .ok_or_else(|| LiveLogError::NotFound(branch.to_owned()))?;
        log.cancel();
        Ok(())
    }
}

impl Debug for LiveLogManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let live = self.inner.live.lock().unwrap();
        f.debug_struct("LiveLogManager")
            .field("live", &live.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
struct LogState {
    buffer: Vec<u8>,
    closed: bool,
    subscribers: Vec<mpsc::Sender<Vec<u8>>>,
}

pub struct LiveLog {
    branch: String,
    cancel: Arc<CancellationFlag>,
    manager: Weak<ManagerInner>,
    state: tokio::sync::Mutex<LogState>,
}

impl LiveLog {
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Appends to the buffer and pushes the chunk to every subscriber,
    /// blocking on congested ones. A no-op after close.
    pub async fn append(&self, data: &[u8]) {
        let senders = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.buffer.extend_from_slice(data);
            state.subscribers.retain(|sender| !sender.is_closed());
            state.subscribers.clone()
        };
        for sender in senders {
            // A send error just means the subscriber went away.
            let _ = sender.send(data.to_vec()).await;
        }
    }

    /// Everything appended so far.
    pub async fn contents(&self) -> Vec<u8> {
        self.state.lock().await.buffer.clone()
    }

    /// Subscribes to the log. The stream yields the buffered prefix first,
    /// then chunks as they arrive, and ends when the log is closed.
    pub async fn subscribe(&self) -> LogStream {
        let mut state = self.state.lock().await;
        let initial = state.buffer.clone();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        if !state.closed {
            state.subscribers.push(tx);
        }
        LogStream {
            first: Some(initial),
            rx,
        }
    }

    /// Closes the log: deregisters it from the manager and ends all
    /// subscriber streams.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.subscribers.clear();
        }
        if let Some(manager) = self.manager.upgrade() {
            let mut live = manager.live.lock().unwrap();
            if let Some(registered) = live.get(&self.branch) {
                if std::ptr::eq(Arc::as_ptr(registered), self as *const LiveLog) {
                    live.remove(&self.branch);
                }
            }
        }
    }

    /// Signals the computation feeding this log to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Debug for LiveLog {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("LiveLog")
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

/// A subscriber's view of a live log.
pub struct LogStream {
    first: Option<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl LogStream {
    /// The next chunk, or `None` once the log has been closed. The first
    /// call returns the prefix buffered before subscription (possibly
    /// empty).
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if let Some(first) = self.first.take() {
            return Some(first);
        }
        self.rx.recv().await
    }

    /// Drains the stream to completion.
    pub async fn collect(mut self) -> Vec<u8> {
        let mut data = vec![];
        while let Some(chunk) = self.next_chunk().await {
            data.extend_from_slice(&chunk);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag() -> Arc<CancellationFlag> {
        Arc::new(CancellationFlag::new())
    }

    #[tokio::test]
    async fn test_subscriber_sees_prefix_and_tail() {
        let logs = LiveLogManager::new();
        let log = logs.create("build/x", flag()).unwrap();
        log.append(b"before ").await;
        let stream = log.subscribe().await;
        log.append(b"after").await;
        log.close().await;
        assert_eq!(stream.collect().await, b"before after");
    }

    #[tokio::test]
    async fn test_one_live_log_per_branch() {
        let logs = LiveLogManager::new();
        let log = logs.create("build/x", flag()).unwrap();
        assert_eq!(
            logs.create("build/x", flag()).unwrap_err(),
            LiveLogError::AlreadyLive("build/x".to_string())
        );
        log.close().await;
        // The name is free again after close.
        logs.create("build/x", flag()).unwrap();
    }

    #[tokio::test]
    async fn test_lookup_and_cancel() {
        let logs = LiveLogManager::new();
        let cancel = flag();
        let log = logs.create("build/x", cancel.clone()).unwrap();
        assert!(logs.lookup("build/x").is_some());
        logs.cancel("build/x").unwrap();
        assert!(cancel.is_cancelled());
        log.close().await;
        assert_eq!(
            logs.cancel("build/x").unwrap_err(),
            LiveLogError::NotFound("build/x".to_string())
        );
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let logs = LiveLogManager::new();
        let log = logs.create("build/x", flag()).unwrap();
        let mut stream = log.subscribe().await;
        log.append(b"data").await;
        log.close().await;
        assert_eq!(stream.next_chunk().await, Some(b"".to_vec()));
        assert_eq!(stream.next_chunk().await, Some(b"data".to_vec()));
        assert_eq!(stream.next_chunk().await, None);
    }
}
