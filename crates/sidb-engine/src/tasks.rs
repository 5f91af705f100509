//! Task registry for pruning, verification and aging runs.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sidb_core::{CancelFlag, StoreId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Kind of background run a task tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerType {
    Prune,
    Verify,
    DataAging,
    Reconstruct,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Prune => "prune",
            WorkerType::Verify => "dv2",
            WorkerType::DataAging => "aging",
            WorkerType::Reconstruct => "reconstruct",
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct TaskSnapshot {
    pub upid: String,
    pub node: String,
    pub pid: i64,
    pub starttime: i64,
    pub worker_type: WorkerType,
    pub store: Option<StoreId>,
    pub endtime: Option<i64>,
    pub exitstatus: Option<String>,
    pub log: Vec<String>,
    pub running: bool,
}

#[derive(Clone)]
pub struct TaskRegistry {
    node: String,
    tasks: Arc<RwLock<HashMap<String, TaskSnapshot>>>,
    cancel: Arc<RwLock<HashMap<String, CancelFlag>>>,
    order: Arc<RwLock<VecDeque<String>>>,
    max_tasks: usize,
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

impl TaskRegistry {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            cancel: Arc::new(RwLock::new(HashMap::new())),
            order: Arc::new(RwLock::new(VecDeque::new())),
            max_tasks: 1000,
        }
    }

    /// Register a running task; the returned flag is raised by [`abort`](Self::abort)
    pub async fn create(&self, worker_type: WorkerType, store: Option<StoreId>) -> (String, CancelFlag) {
        let now = Utc::now();
        let pid = std::process::id() as u64;
        let starttime = now.timestamp();
        let task_id: u32 = rand::thread_rng().gen();
        let upid = format!(
            "UPID:{}:{:08X}:{:08X}:{:08X}:{}:{}:",
            self.node,
            pid,
            task_id,
            starttime as u64,
            worker_type.as_str(),
            store.map(|s| s.to_string()).unwrap_or_default(),
        );

        let entry = TaskSnapshot {
            upid: upid.clone(),
            node: self.node.clone(),
            pid: pid as i64,
            starttime,
            worker_type,
            store,
            endtime: None,
            exitstatus: None,
            log: Vec::new(),
            running: true,
        };
        let flag = CancelFlag::new();

        let mut tasks = self.tasks.write().await;
        let mut order = self.order.write().await;
        tasks.insert(upid.clone(), entry);
        order.push_back(upid.clone());
        self.cancel.write().await.insert(upid.clone(), flag.clone());

        while order.len() > self.max_tasks {
            if let Some(oldest) = order.pop_front() {
                if let Some(old) = tasks.get(&oldest) {
                    if old.running {
                        order.push_back(oldest);
                        break;
                    }
                }
                tasks.remove(&oldest);
            }
        }

        (upid, flag)
    }

    pub async fn log(&self, upid: &str, message: &str) {
        let line = format!("{}: {}", timestamp(), message);
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(upid) {
            task.log.push(line);
        }
    }

    pub async fn finish(&self, upid: &str, exitstatus: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(upid) {
            if task.running {
                task.running = false;
                task.endtime = Some(Utc::now().timestamp());
                task.exitstatus = Some(exitstatus.to_string());
            }
        }
        self.cancel.write().await.remove(upid);
    }

    /// Cancel a running task. The run stops at its next checkpoint.
    pub async fn abort(&self, upid: &str) -> bool {
        let Some(flag) = self.cancel.write().await.remove(upid) else {
            return false;
        };
        flag.cancel();
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(upid) {
            task.running = false;
            task.endtime = Some(Utc::now().timestamp());
            task.exitstatus = Some("ABORTED".to_string());
            task.log.push(format!("{}: task aborted", timestamp()));
        }
        true
    }

    pub async fn list(&self, running: Option<bool>, store: Option<StoreId>) -> Vec<TaskSnapshot> {
        let tasks = self.tasks.read().await;
        let order = self.order.read().await;
        order
            .iter()
            .filter_map(|upid| tasks.get(upid))
            .filter(|task| running.map_or(true, |r| task.running == r))
            .filter(|task| store.map_or(true, |s| task.store == Some(s)))
            .cloned()
            .collect()
    }

    pub async fn status(&self, upid: &str) -> Option<(bool, Option<String>)> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(upid)?;
        Some((task.running, task.exitstatus.clone()))
    }

    pub async fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.list(None, None).await
    }

    pub async fn restore(&self, snapshots: Vec<TaskSnapshot>) {
        let mut tasks = self.tasks.write().await;
        let mut order = self.order.write().await;
        tasks.clear();
        order.clear();

        for mut snapshot in snapshots {
            if snapshot.running {
                snapshot.running = false;
                snapshot.exitstatus = Some("ABORTED".to_string());
                snapshot.endtime = Some(Utc::now().timestamp());
                snapshot.log.push(format!(
                    "{}: task restored from persistence and marked stopped",
                    timestamp()
                ));
            }
            order.push_back(snapshot.upid.clone());
            tasks.insert(snapshot.upid.clone(), snapshot);
        }
    }
}
