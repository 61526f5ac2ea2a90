//! # Query Executor
//!
//! Runs read-only searches on a dedicated OS thread so a slow report cannot
//! share an execution context with ingestion. Requests are served one at a time
//! in arrival order.
//!
//! Queries are written with named placeholders (`:fromDate`, `:plate`). The
//! positional parameters supplied by the caller bind either to the distinct
//! names or to every occurrence, see [`bind_named`]. Placeholders are rewritten
//! to `$n` and executed as a prepared statement. `::type` casts and text inside
//! single-quoted literals are left untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::JoinHandle;

use futures_util::FutureExt;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::connections::store::TelemetryStore;
use crate::pipeline::normalizer::panic_message;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'(?:[^']|'')*'|::|:([A-Za-z_][A-Za-z0-9_]*)").expect("placeholder pattern is valid")
});

/// A failed query, carrying what was asked for diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("query failed: {message}")]
pub struct QueryError {
    pub query: String,
    pub params: Vec<Value>,
    pub message: String,
}

impl QueryError {
    fn new(query: &str, params: &[Value], message: impl Into<String>) -> Self {
        Self {
            query: query.to_string(),
            params: params.to_vec(),
            message: message.into(),
        }
    }
}

/// A query after placeholder rewriting.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    /// Placeholder name behind each positional parameter, index `i` bound to `$i+1`.
    pub names: Vec<String>,
    pub params: Vec<Value>,
}

/// # Bind Named Placeholders
///
/// Two calling conventions are accepted, chosen by the parameter count:
///
/// - one parameter per distinct name, in order of first appearance; a name
///   used again reuses its value;
/// - one parameter per occurrence, in order of appearance, so a repeated name
///   may take a different value each time.
///
/// Queries without named placeholders pass through untouched with their
/// parameters, which allows callers to write `$n` directly.
pub fn bind_named(query: &str, params: &[Value]) -> Result<BoundQuery, String> {
    let occurrences: Vec<&str> = PLACEHOLDER
        .captures_iter(query)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    let mut distinct: Vec<&str> = Vec::new();
    for name in &occurrences {
        if !distinct.contains(name) {
            distinct.push(*name);
        }
    }

    let per_occurrence = params.len() != distinct.len() && params.len() == occurrences.len();
    if !occurrences.is_empty() && params.len() != distinct.len() && !per_occurrence {
        return Err(format!(
            "query names {} placeholders ({}) in {} places but {} parameters were supplied",
            distinct.len(),
            distinct.join(", "),
            occurrences.len(),
            params.len()
        ));
    }

    let mut seen = 0;
    let sql = PLACEHOLDER
        .replace_all(query, |caps: &Captures<'_>| match caps.get(1) {
            Some(name) => {
                let position = if per_occurrence {
                    seen += 1;
                    seen
                } else {
                    distinct.iter().position(|n| *n == name.as_str()).map_or(0, |i| i + 1)
                };
                format!("${}", position)
            }
            None => caps[0].to_string(),
        })
        .into_owned();

    let names = if per_occurrence { &occurrences } else { &distinct };
    Ok(BoundQuery {
        sql,
        names: names.iter().map(|n| n.to_string()).collect(),
        params: params.to_vec(),
    })
}

struct QueryJob {
    correlation_id: u64,
    query: String,
    params: Vec<Value>,
    responder: oneshot::Sender<Result<Vec<Value>, QueryError>>,
}

enum ExecutorMessage {
    Run(QueryJob),
    Stop,
}

async fn execute(store: &dyn TelemetryStore, query: &str, params: &[Value]) -> Result<Vec<Value>, QueryError> {
    let bound = bind_named(query, params).map_err(|m| QueryError::new(query, params, m))?;
    store
        .select_rows(&bound.sql, &bound.params)
        .await
        .map_err(|e| QueryError::new(query, params, e.to_string()))
}

/// Caller side of the query executor thread.
#[derive(Clone)]
pub struct QueryExecutorHandle {
    tx: mpsc::UnboundedSender<ExecutorMessage>,
    next_id: Arc<AtomicU64>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl QueryExecutorHandle {
    /// # Spawn
    ///
    /// Starts the executor thread with its own single-threaded runtime.
    pub fn spawn(store: Arc<dyn TelemetryStore>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ExecutorMessage>();

        let thread = std::thread::Builder::new()
            .name("query-executor".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "Query executor runtime failed to start");
                        return;
                    }
                };
                runtime.block_on(async move {
                    info!("Query executor started");
                    while let Some(message) = rx.recv().await {
                        let ExecutorMessage::Run(job) = message else { break };
                        debug!(correlation_id = job.correlation_id, "Executing query");
                        let result = std::panic::AssertUnwindSafe(execute(store.as_ref(), &job.query, &job.params))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(QueryError::new(&job.query, &job.params, panic_message(panic)))
                            });
                        if job.responder.send(result).is_err() {
                            debug!(correlation_id = job.correlation_id, "Query caller went away");
                        }
                    }
                    info!("Query executor stopped");
                });
            })?;

        Ok(Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    /// Posts one query and waits for its own reply.
    pub async fn execute(&self, query: &str, params: Vec<Value>) -> Result<Vec<Value>, QueryError> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, reply) = oneshot::channel();
        let job = QueryJob {
            correlation_id,
            query: query.to_string(),
            params: params.clone(),
            responder,
        };
        if self.tx.send(ExecutorMessage::Run(job)).is_err() {
            return Err(QueryError::new(query, &params, "query executor is not running"));
        }
        reply
            .await
            .unwrap_or_else(|_| Err(QueryError::new(query, &params, "query executor dropped the request")))
    }

    /// Stops the thread after queued queries finish and waits for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ExecutorMessage::Stop);
        let thread = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                _ => warn!("Query executor thread did not exit cleanly"),
            }
        }
    }
}
