//! 同步流程状态
//!
//! 每个状态只携带该阶段已经可用的数据

use crate::domain::{ChangeSummary, ServiceRecord, StageOutcome, SyncServiceRow, SyncStep};
use crate::error::SyncError;
use crate::parser::Diagnostic;
use crate::services::render::RenderedArtifacts;

/// 解析阶段的产出
#[derive(Clone, Debug, Default)]
pub struct ParsedServices {
    /// 本地服务，按文档顺序
    pub services: Vec<ServiceRecord>,
    /// 本地 / 远程合并后的行，按名称排序
    pub rows: Vec<SyncServiceRow>,
    /// 本地文档的解析警告
    pub diagnostics: Vec<Diagnostic>,
    /// 是否成功读取了远程文档
    pub remote_checked: bool,
    /// 解析时读取的本地文档原文；上传的是这份快照而不是磁盘上的当前内容
    pub source: String,
}

impl ParsedServices {
    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary::from_rows(&self.rows)
    }
}

/// 生成后的同步计划
#[derive(Clone, Debug)]
pub struct SyncPlan {
    pub parsed: ParsedServices,
    pub artifacts: RenderedArtifacts,
}

/// 同步流程状态
#[derive(Clone, Debug, Default)]
pub enum PipelineState {
    #[default]
    Parsing,
    Generating(ParsedServices),
    /// 预览模式在生成后暂停，等待 commit
    Previewed(SyncPlan),
    Uploading(SyncPlan),
    Restarting(SyncPlan),
    Complete(SyncPlan),
    Failed {
        step: SyncStep,
        outcome: StageOutcome,
    },
}

impl PipelineState {
    /// 对应的阶段；暂停的预览仍属于 Generating
    pub fn step(&self) -> SyncStep {
        match self {
            PipelineState::Parsing => SyncStep::Parsing,
            PipelineState::Generating(_) | PipelineState::Previewed(_) => SyncStep::Generating,
            PipelineState::Uploading(_) => SyncStep::Uploading,
            PipelineState::Restarting(_) => SyncStep::Restarting,
            PipelineState::Complete(_) => SyncStep::Complete,
            PipelineState::Failed { .. } => SyncStep::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.step().is_terminal()
    }

    /// 已生成的计划（如有）
    pub fn plan(&self) -> Option<&SyncPlan> {
        match self {
            PipelineState::Previewed(plan)
            | PipelineState::Uploading(plan)
            | PipelineState::Restarting(plan)
            | PipelineState::Complete(plan) => Some(plan),
            _ => None,
        }
    }

    /// 失败时的首个错误（按启动顺序）
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            PipelineState::Failed { outcome, .. } => {
                outcome.first_error().and_then(|r| r.error.as_ref())
            }
            _ => None,
        }
    }
}
