// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ordered execution per key on a shared runtime.
//!
//! Tasks submitted under the same [`SessionKey`] run one at a time in
//! submission order; tasks under different keys run concurrently on the
//! runtime's worker threads. The lock only guards the queue bookkeeping and is
//! never held while a task runs.

use std::any::type_name;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

use crate::service::SessionExecutorConfig;
use crate::{AppError, AppResult};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Ordering key. String keys compare by value, so two `Name`s built from
/// equal strings share one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Id(u64),
    Name(Arc<str>),
}

impl From<u64> for SessionKey {
    fn from(id: u64) -> Self {
        SessionKey::Id(id)
    }
}

impl From<&str> for SessionKey {
    fn from(name: &str) -> Self {
        SessionKey::Name(Arc::from(name))
    }
}

impl From<String> for SessionKey {
    fn from(name: String) -> Self {
        SessionKey::Name(Arc::from(name))
    }
}

impl Display for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::Id(id) => write!(f, "#{}", id),
            SessionKey::Name(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Default)]
struct Queues {
    pending: HashMap<SessionKey, VecDeque<Task>>,
    running: HashSet<SessionKey>,
    queued: usize,
    /// set while the backlog sits at or above the warn threshold
    backlog_warned: bool,
}

struct Inner {
    runtime: Handle,
    queues: Mutex<Queues>,
    warn_threshold: usize,
}

#[derive(Clone)]
pub struct SessionExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let queues = self.inner.queues.lock();
        f.debug_struct("SessionExecutor")
            .field("running", &queues.running.len())
            .field("queued", &queues.queued)
            .finish()
    }
}

impl SessionExecutor {
    pub fn new(config: &SessionExecutorConfig, runtime: Handle) -> Self {
        SessionExecutor {
            inner: Arc::new(Inner {
                runtime,
                queues: Mutex::new(Queues::default()),
                warn_threshold: config.queue_warn_threshold.max(1),
            }),
        }
    }

    /// Run `task` after every task previously submitted under `key`.
    pub fn execute<F>(&self, key: impl Into<SessionKey>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let task: Task = Box::pin(task);
        let start_now = {
            let mut queues = self.inner.queues.lock();
            if queues.running.contains(&key) {
                queues.pending.entry(key.clone()).or_default().push_back(task);
                queues.queued += 1;
                if queues.queued >= self.inner.warn_threshold && !queues.backlog_warned {
                    queues.backlog_warned = true;
                    warn!(
                        "session executor backlog reached {} queued tasks",
                        queues.queued
                    );
                }
                None
            } else {
                queues.running.insert(key.clone());
                Some(task)
            }
        };
        if let Some(task) = start_now {
            Inner::drive(self.inner.clone(), key, task);
        }
    }

    /// Like [`execute`](Self::execute) but hands back the task's output.
    /// Resolves to `Cancelled` if the task never produced a value, for
    /// example because it panicked.
    pub fn execute_async<T, F>(
        &self,
        key: impl Into<SessionKey>,
        task: F,
    ) -> impl Future<Output = AppResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: Future<Output = AppResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(key, async move {
            let _ = tx.send(task.await);
        });
        async move {
            rx.await
                .map_err(|_| AppError::Cancelled("session task dropped before completion".into()))?
        }
    }

    /// Number of tasks waiting behind a running task.
    pub fn queued(&self) -> usize {
        self.inner.queues.lock().queued
    }

    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.inner.queues.lock().running.contains(key)
    }
}

impl Inner {
    /// Run tasks of `key` back to back until its queue is empty. Each task is
    /// its own runtime task so a panic only loses that task.
    fn drive(inner: Arc<Inner>, key: SessionKey, first: Task) {
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            let mut task = first;
            loop {
                let result = inner.runtime.spawn(task).await;
                if let Err(join_error) = result {
                    if join_error.is_panic() {
                        let payload = join_error.into_panic();
                        if let Some(message) = payload.downcast_ref::<&'static str>() {
                            error!("session task {} panicked with message: {}", key, message);
                        } else if let Some(message) = payload.downcast_ref::<String>() {
                            error!("session task {} panicked with message: {}", key, message);
                        } else {
                            error!(
                                "session task {} panicked with an unknown type: {}",
                                key,
                                get_type_name(&payload)
                            );
                        }
                    } else {
                        warn!("session task {} was cancelled", key);
                    }
                }
                match inner.next_task(&key) {
                    Some(next) => task = next,
                    None => break,
                }
            }
            trace!("session {} drained", key);
        });
    }

    fn next_task(&self, key: &SessionKey) -> Option<Task> {
        let mut queues = self.queues.lock();
        let next = match queues.pending.get_mut(key) {
            Some(queue) => {
                let next = queue.pop_front();
                if queue.is_empty() {
                    queues.pending.remove(key);
                }
                next
            }
            None => None,
        };
        match next {
            Some(task) => {
                queues.queued -= 1;
                if queues.queued < self.warn_threshold {
                    queues.backlog_warned = false;
                }
                Some(task)
            }
            None => {
                queues.running.remove(key);
                None
            }
        }
    }
}

fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
