//! 同步流程相关领域模型
//!
//! 阶段、任务与结果矩阵，供编排器和展示层共用

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::SyncError;

/// 同步流程阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Parsing,
    Generating,
    Uploading,
    Restarting,
    Complete,
    Failed,
}

impl SyncStep {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStep::Parsing => "parsing",
            SyncStep::Generating => "generating",
            SyncStep::Uploading => "uploading",
            SyncStep::Restarting => "restarting",
            SyncStep::Complete => "complete",
            SyncStep::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStep::Complete | SyncStep::Failed)
    }
}

/// 同步流程中的单个任务
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTask {
    Parse,
    Generate,
    UploadServer,
    UploadClient,
    RestartServer,
    RestartClient,
    RestartCaddy,
}

impl SyncTask {
    /// 显示名称
    pub fn label(&self) -> &'static str {
        match self {
            SyncTask::Parse => "Parse Caddyfile",
            SyncTask::Generate => "Generate configs",
            SyncTask::UploadServer => "Upload server",
            SyncTask::UploadClient => "Upload client",
            SyncTask::RestartServer => "Rathole server",
            SyncTask::RestartClient => "Rathole client",
            SyncTask::RestartCaddy => "Caddy",
        }
    }

    /// 任务所属阶段
    pub fn step(&self) -> SyncStep {
        match self {
            SyncTask::Parse => SyncStep::Parsing,
            SyncTask::Generate => SyncStep::Generating,
            SyncTask::UploadServer | SyncTask::UploadClient => SyncStep::Uploading,
            SyncTask::RestartServer | SyncTask::RestartClient | SyncTask::RestartCaddy => {
                SyncStep::Restarting
            }
        }
    }
}

/// 任务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// 单个并发任务的执行结果
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub task: SyncTask,
    /// 失败原因，成功时为 None
    pub error: Option<SyncError>,
    /// 面向用户的简短说明 (如 "Couldn't upload config to client")
    pub friendly: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 持续时间（毫秒）
    pub duration_ms: i64,
}

impl TaskResult {
    /// 创建成功结果
    pub fn ok(task: SyncTask, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        Self {
            task,
            error: None,
            friendly: None,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        }
    }

    /// 创建失败结果
    pub fn failed(
        task: SyncTask,
        started_at: DateTime<Utc>,
        error: SyncError,
        friendly: impl Into<String>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            task,
            error: Some(error),
            friendly: Some(friendly.into()),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// 一个阶段内所有任务的汇总结果
///
/// `results` 按任务启动顺序排列，与完成顺序无关
#[derive(Clone, Debug)]
pub struct StageOutcome {
    pub step: SyncStep,
    pub results: Vec<TaskResult>,
}

impl StageOutcome {
    pub fn new(step: SyncStep, results: Vec<TaskResult>) -> Self {
        Self { step, results }
    }

    pub fn completed(&self) -> Vec<SyncTask> {
        self.results
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.task)
            .collect()
    }

    pub fn failed(&self) -> Vec<SyncTask> {
        self.results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.task)
            .collect()
    }

    /// 按启动顺序的第一个失败
    pub fn first_error(&self) -> Option<&TaskResult> {
        self.results.iter().find(|r| !r.succeeded())
    }

    /// 全部失败结果
    pub fn errors(&self) -> Vec<&TaskResult> {
        self.results.iter().filter(|r| !r.succeeded()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(TaskResult::succeeded)
    }
}

/// 任务状态矩阵
///
/// 记录每个任务的状态，以及已收集到的全部结果
#[derive(Clone, Debug, Default)]
pub struct TaskMatrix {
    statuses: BTreeMap<SyncTask, TaskStatus>,
    results: Vec<TaskResult>,
}

impl TaskMatrix {
    /// 以给定任务集合创建，全部为 Pending
    pub fn new(tasks: impl IntoIterator<Item = SyncTask>) -> Self {
        Self {
            statuses: tasks.into_iter().map(|t| (t, TaskStatus::Pending)).collect(),
            results: Vec::new(),
        }
    }

    /// 标记任务开始执行
    pub fn start(&mut self, tasks: &[SyncTask]) {
        for task in tasks {
            self.statuses.insert(*task, TaskStatus::Running);
        }
    }

    /// 记录一个阶段的结果
    pub fn record(&mut self, outcome: &StageOutcome) {
        for result in &outcome.results {
            let status = if result.succeeded() {
                TaskStatus::Done
            } else {
                TaskStatus::Failed
            };
            self.statuses.insert(result.task, status);
            self.results.push(result.clone());
        }
    }

    pub fn status(&self, task: SyncTask) -> Option<TaskStatus> {
        self.statuses.get(&task).copied()
    }

    pub fn statuses(&self) -> impl Iterator<Item = (SyncTask, TaskStatus)> + '_ {
        self.statuses.iter().map(|(t, s)| (*t, *s))
    }

    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(task: SyncTask, msg: &str) -> TaskResult {
        TaskResult::failed(task, Utc::now(), SyncError::config(msg), msg)
    }

    #[test]
    fn test_sync_step_is_terminal() {
        assert!(!SyncStep::Parsing.is_terminal());
        assert!(!SyncStep::Restarting.is_terminal());
        assert!(SyncStep::Complete.is_terminal());
        assert!(SyncStep::Failed.is_terminal());
        assert_eq!(SyncStep::Uploading.as_str(), "uploading");
    }

    #[test]
    fn test_task_step_mapping() {
        assert_eq!(SyncTask::UploadClient.step(), SyncStep::Uploading);
        assert_eq!(SyncTask::RestartCaddy.step(), SyncStep::Restarting);
        assert_eq!(SyncTask::RestartCaddy.label(), "Caddy");
    }

    #[test]
    fn test_stage_outcome_keeps_every_result() {
        let outcome = StageOutcome::new(
            SyncStep::Restarting,
            vec![
                TaskResult::ok(SyncTask::RestartServer, Utc::now()),
                failure(SyncTask::RestartClient, "client down"),
                failure(SyncTask::RestartCaddy, "caddy down"),
            ],
        );

        assert!(!outcome.is_success());
        assert_eq!(outcome.completed(), vec![SyncTask::RestartServer]);
        assert_eq!(
            outcome.failed(),
            vec![SyncTask::RestartClient, SyncTask::RestartCaddy]
        );
        assert_eq!(outcome.first_error().map(|r| r.task), Some(SyncTask::RestartClient));
        assert_eq!(outcome.errors().len(), 2);
    }

    #[test]
    fn test_task_matrix_lifecycle() {
        let mut matrix = TaskMatrix::new([SyncTask::UploadServer, SyncTask::UploadClient]);
        assert_eq!(matrix.status(SyncTask::UploadServer), Some(TaskStatus::Pending));

        matrix.start(&[SyncTask::UploadServer, SyncTask::UploadClient]);
        assert_eq!(matrix.status(SyncTask::UploadClient), Some(TaskStatus::Running));

        let outcome = StageOutcome::new(
            SyncStep::Uploading,
            vec![
                failure(SyncTask::UploadServer, "boom"),
                TaskResult::ok(SyncTask::UploadClient, Utc::now()),
            ],
        );
        matrix.record(&outcome);

        assert_eq!(matrix.status(SyncTask::UploadServer), Some(TaskStatus::Failed));
        assert_eq!(matrix.status(SyncTask::UploadClient), Some(TaskStatus::Done));
        assert_eq!(matrix.results().len(), 2);
        assert_eq!(matrix.status(SyncTask::Parse), None);
    }
}
