//! 配置中的密钥引用解析
//!
//! - `${VAR}`：从环境变量展开
//! - `op://vault/item/field`：通过 1Password CLI (`op inject`) 批量解析

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::settings::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::infra::CommandRunner;

/// 批量注入时的分隔符
const INJECT_DELIM: &str = "\n---RCM_SEP---\n";

/// `op inject` 超时（可能需要交互式解锁）
const OP_INJECT_TIMEOUT: Duration = Duration::from_secs(120);

fn env_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env ref regex"))
}

/// 解析配置中所有字符串字段的引用
pub async fn resolve_refs(config: &mut SyncConfig) -> SyncResult<()> {
    let mut op_fields = Vec::new();
    for field in config.string_fields_mut() {
        if field.contains("${") {
            *field = expand_env_vars(field);
        } else if field.starts_with("op://") {
            op_fields.push(field);
        }
    }

    if op_fields.is_empty() {
        return Ok(());
    }

    let refs: Vec<String> = op_fields.iter().map(|f| f.to_string()).collect();
    tracing::debug!(count = refs.len(), "Resolving op:// references");
    let values = op_inject_batch(&refs).await?;

    for (field, value) in op_fields.into_iter().zip(values) {
        *field = value;
    }
    Ok(())
}

/// 展开 `${VAR}`，未设置的变量展开为空
pub fn expand_env_vars(s: &str) -> String {
    env_ref_re()
        .replace_all(s, |caps: &regex::Captures| std::env::var(&caps[1]).unwrap_or_default())
        .to_string()
}

/// 一次 `op inject` 调用解析全部引用
async fn op_inject_batch(refs: &[String]) -> SyncResult<Vec<String>> {
    let template = build_inject_template(refs);

    let output = CommandRunner::run_with_input("op", &["inject"], template.as_bytes(), OP_INJECT_TIMEOUT)
        .await
        .map_err(|e| SyncError::config(format!("op inject: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::config(format!("op inject: {}", stderr.trim())));
    }

    split_injected(&String::from_utf8_lossy(&output.stdout), refs)
}

fn build_inject_template(refs: &[String]) -> String {
    refs.iter()
        .map(|r| format!("{{{{ {} }}}}", r))
        .collect::<Vec<_>>()
        .join(INJECT_DELIM)
}

/// 按分隔符拆分注入结果，空值视为错误
fn split_injected(output: &str, refs: &[String]) -> SyncResult<Vec<String>> {
    let values: Vec<&str> = output.split(INJECT_DELIM).collect();
    if values.len() != refs.len() {
        return Err(SyncError::config(format!(
            "op inject: expected {} values, got {}",
            refs.len(),
            values.len()
        )));
    }

    let mut resolved = Vec::with_capacity(values.len());
    let mut empty = Vec::new();
    for (value, raw) in values.iter().zip(refs) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            empty.push(format!("op inject: empty value for {:?}", raw));
        } else {
            resolved.push(trimmed.to_string());
        }
    }

    if !empty.is_empty() {
        return Err(SyncError::config(format!(
            "failed to resolve config values:\n{}",
            empty.join("\n")
        )));
    }
    Ok(resolved)
}
