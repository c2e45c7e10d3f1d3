//! Caddyfile service extractor
//!
//! Services are declared by an annotation comment directly above a site block:
//!
//! ```text
//! # plex: 192.168.1.100:32400
//! plex.example.com {
//!     reverse_proxy localhost:8001
//! }
//! ```
//!
//! The scan never fails on malformed input. Lines it cannot use are skipped and
//! reported through [`Diagnostic`]s instead.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::domain::ServiceRecord;
use crate::error::{SyncError, SyncResult};

/// `# service_name: local_addr`
///
/// Names are ASCII word characters and inner hyphens only.
fn annotation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#\s*([A-Za-z0-9_][A-Za-z0-9_-]*[A-Za-z0-9_]|[A-Za-z0-9_]):\s*(.+)$")
            .expect("valid annotation regex")
    })
}

/// `domain.com, domain2.com {`
fn block_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-zA-Z0-9.,\s\-_]+)\s*\{").expect("valid block header regex"))
}

/// `reverse_proxy [http://](localhost|127.0.0.1):PORT`
fn reverse_proxy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"reverse_proxy\s+(?:https?://)?(?:localhost|127\.0\.0\.1):(\d+)")
            .expect("valid reverse_proxy regex")
    })
}

/// Result of one parse pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedDocument {
    /// Services in first-seen order.
    pub services: Vec<ServiceRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A line the extractor skipped or tolerated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based line number.
    pub line: usize,
    pub kind: DiagnosticKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Port digits did not fit a TCP port; recorded as 0.
    PortOutOfRange(String),
    /// `reverse_proxy` at brace depth 0.
    ReverseProxyOutsideBlock,
    /// `reverse_proxy` inside a block that has no annotation comment.
    UnannotatedReverseProxy,
    /// More closing than opening braces; depth clamped to 0.
    StrayClosingBrace,
    /// Input ended inside the block opened at this line.
    UnclosedBlock,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DiagnosticKind::PortOutOfRange(raw) => {
                write!(f, "line {}: port {} out of range, using 0", self.line, raw)
            }
            DiagnosticKind::ReverseProxyOutsideBlock => {
                write!(f, "line {}: reverse_proxy outside a site block ignored", self.line)
            }
            DiagnosticKind::UnannotatedReverseProxy => write!(
                f,
                "line {}: reverse_proxy without a '# name: address' annotation ignored",
                self.line
            ),
            DiagnosticKind::StrayClosingBrace => {
                write!(f, "line {}: unmatched closing brace", self.line)
            }
            DiagnosticKind::UnclosedBlock => {
                write!(f, "line {}: block is never closed", self.line)
            }
        }
    }
}

struct Annotation {
    name: String,
    local_addr: String,
}

/// Parse Caddyfile text into service records.
pub fn parse(content: &str) -> ParsedDocument {
    let mut services: Vec<ServiceRecord> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut diagnostics = Vec::new();

    let mut pending: Option<Annotation> = None;
    let mut domains: Vec<String> = Vec::new();
    let mut depth: usize = 0;
    let mut block_line = 0;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = annotation_re().captures(line) {
            pending = Some(Annotation {
                name: caps[1].to_string(),
                local_addr: caps[2].trim().to_string(),
            });
            continue;
        }

        // Site headers only count at the top level; nested matchers such as
        // `handle {` keep the enclosing site's domains.
        if depth == 0 {
            if let Some(caps) = block_header_re().captures(line) {
                domains = split_domains(&caps[1]);
                depth = 1;
                block_line = line_no;
                continue;
            }
        }

        let opens = line.matches('{').count();
        let closes = line.matches('}').count();
        if depth + opens < closes {
            diagnostics.push(Diagnostic {
                line: line_no,
                kind: DiagnosticKind::StrayClosingBrace,
            });
            depth = 0;
        } else {
            depth = depth + opens - closes;
        }

        if let Some(caps) = reverse_proxy_re().captures(line) {
            match pending.as_ref() {
                Some(annotation) if depth > 0 => {
                    let port = match caps[1].parse::<u16>() {
                        Ok(port) => port,
                        Err(_) => {
                            diagnostics.push(Diagnostic {
                                line: line_no,
                                kind: DiagnosticKind::PortOutOfRange(caps[1].to_string()),
                            });
                            0
                        }
                    };

                    if let Some(&i) = by_name.get(&annotation.name) {
                        services[i].domains.extend(domains.iter().cloned());
                    } else {
                        by_name.insert(annotation.name.clone(), services.len());
                        services.push(ServiceRecord {
                            name: annotation.name.clone(),
                            local_addr: annotation.local_addr.clone(),
                            remote_port: port,
                            domains: domains.clone(),
                        });
                    }
                }
                _ => {
                    let kind = if depth == 0 {
                        DiagnosticKind::ReverseProxyOutsideBlock
                    } else {
                        DiagnosticKind::UnannotatedReverseProxy
                    };
                    diagnostics.push(Diagnostic { line: line_no, kind });
                }
            }
        }

        if depth == 0 {
            pending = None;
            domains.clear();
        }
    }

    if depth > 0 {
        diagnostics.push(Diagnostic {
            line: block_line,
            kind: DiagnosticKind::UnclosedBlock,
        });
    }

    ParsedDocument {
        services,
        diagnostics,
    }
}

/// Read and parse a local Caddyfile.
///
/// Returns the text as read alongside its parse, so callers can ship the
/// exact bytes they parsed. Only an unreadable file is an error.
pub async fn parse_file(path: &Path) -> SyncResult<(String, ParsedDocument)> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SyncError::ParseFailure {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let parsed = parse(&content);
    for diag in &parsed.diagnostics {
        tracing::debug!(path = %path.display(), "{}", diag);
    }
    tracing::debug!(
        path = %path.display(),
        services = parsed.services.len(),
        warnings = parsed.diagnostics.len(),
        "Parsed Caddyfile"
    );
    Ok((content, parsed))
}

fn split_domains(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}
