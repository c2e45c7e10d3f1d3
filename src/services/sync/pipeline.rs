//! 同步流程编排
//!
//! Parsing -> Generating -> Uploading -> Restarting -> Complete，
//! 任一阶段出现失败即进入 Failed，已收集的任务结果全部保留。

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::domain::{StageOutcome, SyncStep, SyncTask, TaskMatrix};
use crate::error::{SyncError, SyncResult};
use crate::services::render::ArtifactRenderer;
use crate::services::ssh::SessionPool;

use super::stages;
use super::state::{PipelineState, SyncPlan};

/// 运行模式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// 完整执行到 Complete
    Full,
    /// 生成后暂停，等待 `commit`
    Preview,
}

/// 一次同步调用的状态机
pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    pool: Arc<SessionPool>,
    renderer: Arc<dyn ArtifactRenderer>,
    state: PipelineState,
    matrix: TaskMatrix,
}

impl SyncPipeline {
    pub fn new(
        config: Arc<SyncConfig>,
        pool: Arc<SessionPool>,
        renderer: Arc<dyn ArtifactRenderer>,
    ) -> Self {
        let matrix = TaskMatrix::new(Self::all_tasks(&config));
        Self {
            config,
            pool,
            renderer,
            state: PipelineState::Parsing,
            matrix,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn matrix(&self) -> &TaskMatrix {
        &self.matrix
    }

    fn all_tasks(config: &SyncConfig) -> Vec<SyncTask> {
        let mut tasks = vec![SyncTask::Parse, SyncTask::Generate];
        tasks.extend(stages::upload_tasks());
        tasks.extend(stages::restart_tasks(config));
        tasks
    }

    /// 从 Parsing 开始执行
    ///
    /// 任何状态下调用都会重新开始（包括 Failed）。失败时返回按启动顺序的第一个错误，
    /// 完整结果见 `state()` 和 `matrix()`。
    pub async fn run(&mut self, mode: SyncMode) -> SyncResult<()> {
        self.state = PipelineState::Parsing;
        self.matrix = TaskMatrix::new(Self::all_tasks(&self.config));
        info!(mode = ?mode, "Sync started");

        // Parsing
        self.matrix.start(&[SyncTask::Parse]);
        let (outcome, parsed) = stages::parse_stage(&self.config, &self.pool).await;
        let Some(parsed) = self.advance(outcome, parsed) else {
            return self.failure();
        };
        self.state = PipelineState::Generating(parsed.clone());

        // Generating
        self.matrix.start(&[SyncTask::Generate]);
        let (outcome, artifacts) =
            stages::generate_stage(&self.config, self.renderer.as_ref(), &parsed);
        let Some(artifacts) = self.advance(outcome, artifacts) else {
            return self.failure();
        };
        let plan = SyncPlan { parsed, artifacts };

        if mode == SyncMode::Preview {
            info!(
                services = plan.parsed.services.len(),
                "Preview ready, waiting for commit"
            );
            self.state = PipelineState::Previewed(plan);
            return Ok(());
        }

        self.deploy(plan).await
    }

    /// 用预览时生成的配置继续执行上传和重启，不重新解析
    pub async fn commit(&mut self) -> SyncResult<()> {
        let plan = match std::mem::take(&mut self.state) {
            PipelineState::Previewed(plan) => plan,
            other => {
                let step = other.step();
                self.state = other;
                return Err(SyncError::config(format!(
                    "nothing to commit: pipeline is {}",
                    step.as_str()
                )));
            }
        };
        info!("Committing previewed sync");
        self.deploy(plan).await
    }

    async fn deploy(&mut self, plan: SyncPlan) -> SyncResult<()> {
        // Uploading
        self.state = PipelineState::Uploading(plan.clone());
        let upload = stages::upload_tasks();
        self.matrix.start(&upload);
        let outcome = stages::upload_stage(&self.config, &self.pool, &plan).await;
        if self.advance(outcome, Some(())).is_none() {
            return self.failure();
        }

        // Restarting
        self.state = PipelineState::Restarting(plan.clone());
        let targets = stages::restart_tasks(&self.config);
        self.matrix.start(&targets);
        let outcome = stages::restart_stage(&self.config, &self.pool, &targets).await;
        if self.advance(outcome, Some(())).is_none() {
            return self.failure();
        }

        info!(services = plan.parsed.services.len(), "Sync complete");
        self.state = PipelineState::Complete(plan);
        Ok(())
    }

    /// 记录阶段结果；有失败时转入 Failed 并返回 None
    fn advance<T>(&mut self, outcome: StageOutcome, value: Option<T>) -> Option<T> {
        self.matrix.record(&outcome);

        if outcome.is_success() {
            if let Some(value) = value {
                return Some(value);
            }
        }

        let step = outcome.step;
        for failed in outcome.errors() {
            warn!(step = step.as_str(), task = ?failed.task, "Stage task failed");
        }
        self.state = PipelineState::Failed { step, outcome };
        None
    }

    fn failure(&self) -> SyncResult<()> {
        let error = self.state.error().cloned().unwrap_or_else(|| {
            SyncError::config(format!("{} stage failed", self.state.step().as_str()))
        });
        Err(error)
    }

    /// 失败所在阶段
    pub fn failed_step(&self) -> Option<SyncStep> {
        match &self.state {
            PipelineState::Failed { step, .. } => Some(*step),
            _ => None,
        }
    }
}
