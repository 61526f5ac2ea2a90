//! # Task Dispatcher
//!
//! Routes named jobs for HTTP handlers. The reserved [`EXECUTE_QUERY`] task is
//! forwarded to the isolated query executor; every other name is looked up in
//! the table of locally registered handlers and runs on the caller's runtime.
//! The dispatcher owns the executor's lifecycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::connections::store::TelemetryStore;
use crate::pipeline::query_executor::{QueryError, QueryExecutorHandle};

/// Task name reserved for read-query execution.
pub const EXECUTE_QUERY: &str = "executeQuery";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid parameters for {task}: {message}")]
    InvalidParams { task: String, message: String },
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("task {task} failed: {message}")]
    Failed { task: String, message: String },
}

type LocalTask = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Parameters of the reserved query task: `{ "query": ..., "queryParams": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTaskParams {
    pub query: String,
    #[serde(default)]
    pub query_params: Vec<Value>,
}

pub struct TaskDispatcher {
    executor: QueryExecutorHandle,
    local: RwLock<HashMap<String, LocalTask>>,
}

impl TaskDispatcher {
    /// Spawns the query executor against `store`.
    pub fn start(store: Arc<dyn TelemetryStore>) -> std::io::Result<Self> {
        let executor = QueryExecutorHandle::spawn(store)?;
        info!("Task dispatcher started");
        Ok(Self {
            executor,
            local: RwLock::new(HashMap::new()),
        })
    }

    /// Registers a task that runs in the caller's context. Re-registering a
    /// name replaces the previous handler.
    pub fn register<F, Fut>(&self, name: &str, task: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let task: LocalTask = Arc::new(move |params| task(params).boxed());
        self.local
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), task);
    }

    /// # Run Task
    ///
    /// `executeQuery` resolves to a JSON array of rows.
    pub async fn run_task(&self, name: &str, params: Value) -> Result<Value, TaskError> {
        debug!(task = name, "Running task");
        if name == EXECUTE_QUERY {
            let request: QueryTaskParams =
                serde_json::from_value(params).map_err(|e| TaskError::InvalidParams {
                    task: name.to_string(),
                    message: e.to_string(),
                })?;
            let rows = self
                .executor
                .execute(&request.query, request.query_params)
                .await?;
            return Ok(Value::Array(rows));
        }

        let task = self
            .local
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;
        task(params).await.map_err(|message| TaskError::Failed {
            task: name.to_string(),
            message,
        })
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .local
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.push(EXECUTE_QUERY.to_string());
        names.sort();
        names
    }

    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        info!("Task dispatcher stopped");
    }
}
