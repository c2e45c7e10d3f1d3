//! 服务定义领域模型
//!
//! 纯数据类型，无 tokio 依赖

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 从 Caddyfile 注释块中提取的隧道服务
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// 服务名称（唯一）
    pub name: String,
    /// 本地地址 (如 192.168.1.100:8080)
    pub local_addr: String,
    /// VPS 上的端口（来自 reverse_proxy）
    pub remote_port: u16,
    /// 域名列表，按文档顺序，不去重
    pub domains: Vec<String>,
}

impl ServiceRecord {
    /// 第一个域名，没有则返回空字符串
    pub fn primary_domain(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or("")
    }

    /// 逗号分隔的全部域名
    pub fn domains_display(&self) -> String {
        self.domains.join(", ")
    }
}

/// 本地 / 远程对比后的服务行
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncServiceRow {
    pub name: String,
    pub local_addr: String,
    pub remote_port: u16,
    pub domain: String,
    pub is_local: bool,
    pub is_remote: bool,
}

/// 服务行的变更类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowChange {
    /// 仅本地存在，同步后新增
    New,
    /// 两端都存在
    Update,
    /// 仅远程存在，同步后移除
    Removed,
}

impl SyncServiceRow {
    pub fn change(&self) -> RowChange {
        match (self.is_local, self.is_remote) {
            (true, false) => RowChange::New,
            (true, true) => RowChange::Update,
            _ => RowChange::Removed,
        }
    }
}

/// 变更统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub new: usize,
    pub update: usize,
    pub removed: usize,
}

impl ChangeSummary {
    pub fn from_rows(rows: &[SyncServiceRow]) -> Self {
        rows.iter().fold(Self::default(), |mut acc, row| {
            match row.change() {
                RowChange::New => acc.new += 1,
                RowChange::Update => acc.update += 1,
                RowChange::Removed => acc.removed += 1,
            }
            acc
        })
    }
}

/// 按服务名合并本地和远程的解析结果
///
/// 本地服务优先；仅远程存在的服务以 `is_local = false` 保留。结果按名称排序。
pub fn merge_rows(local: &[ServiceRecord], remote: &[ServiceRecord]) -> Vec<SyncServiceRow> {
    let remote_by_name: HashMap<&str, &ServiceRecord> =
        remote.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut rows: Vec<SyncServiceRow> = local
        .iter()
        .map(|svc| SyncServiceRow {
            name: svc.name.clone(),
            local_addr: svc.local_addr.clone(),
            remote_port: svc.remote_port,
            domain: svc.primary_domain().to_string(),
            is_local: true,
            is_remote: remote_by_name.contains_key(svc.name.as_str()),
        })
        .collect();

    for svc in remote {
        if !local.iter().any(|l| l.name == svc.name) {
            rows.push(SyncServiceRow {
                name: svc.name.clone(),
                local_addr: svc.local_addr.clone(),
                remote_port: svc.remote_port,
                domain: svc.primary_domain().to_string(),
                is_local: false,
                is_remote: true,
            });
        }
    }

    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, port: u16, domains: &[&str]) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            local_addr: "192.168.1.10:80".to_string(),
            remote_port: port,
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn test_primary_domain() {
        let s = svc("test", 1, &["first.example.com", "second.example.com"]);
        assert_eq!(s.primary_domain(), "first.example.com");
        assert_eq!(s.domains_display(), "first.example.com, second.example.com");

        let empty = svc("empty", 1, &[]);
        assert_eq!(empty.primary_domain(), "");
        assert_eq!(empty.domains_display(), "");
    }

    #[test]
    fn test_merge_rows_marks_presence() {
        let local = vec![svc("web", 8001, &["web.example.com"]), svc("api", 8002, &[])];
        let remote = vec![svc("web", 8001, &["web.example.com"]), svc("old", 8009, &[])];

        let rows = merge_rows(&local, &remote);
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["api", "old", "web"]);

        assert_eq!(rows[0].change(), RowChange::New);
        assert_eq!(rows[1].change(), RowChange::Removed);
        assert_eq!(rows[2].change(), RowChange::Update);
        assert_eq!(rows[2].domain, "web.example.com");

        let summary = ChangeSummary::from_rows(&rows);
        assert_eq!(
            summary,
            ChangeSummary {
                new: 1,
                update: 1,
                removed: 1
            }
        );
    }

    #[test]
    fn test_merge_rows_without_remote() {
        let local = vec![svc("web", 8001, &[])];
        let rows = merge_rows(&local, &[]);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_local);
        assert!(!rows[0].is_remote);
    }
}
