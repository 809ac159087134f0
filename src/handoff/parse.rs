//! 交接文档解析
//!
//! 行式扫描：定位头部行后逐行识别 Status 行、`Key: 值` 分区头与分区内的续行
//! （可带 `-` / `*` / `•` 项目符号）。字面量 "none"（任意大小写）是显式空标记，
//! 不会成为真实条目。扫描结束后检查必填分区，最后用 JSON Schema 做一道结构门禁。

use std::collections::HashSet;
use std::sync::OnceLock;

use super::{ExecutionHandoff, HandoffStatus, HANDOFF_HEADER};

/// 必须出现的六个分区（Status 单独检查；Follow-up 与 Draft 可选）
const REQUIRED_SECTIONS: [Section; 6] = [
    Section::Plan,
    Section::Actions,
    Section::Data,
    Section::Errors,
    Section::Verification,
    Section::Missing,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Section {
    Plan,
    Actions,
    Data,
    Errors,
    Verification,
    Missing,
    FollowUp,
    Draft,
}

impl Section {
    /// 识别分区键：大小写不敏感；follow-up 额外允许连字符 / 空格 / 下划线变体
    fn from_key(key: &str) -> Option<Self> {
        let key = key.trim().to_lowercase();
        match key.as_str() {
            "plan" => return Some(Section::Plan),
            "actions" => return Some(Section::Actions),
            "data" => return Some(Section::Data),
            "errors" => return Some(Section::Errors),
            "verification" => return Some(Section::Verification),
            "missing" => return Some(Section::Missing),
            "draft" => return Some(Section::Draft),
            _ => {}
        }
        let squashed: String = key.chars().filter(|c| !"-_ ".contains(*c)).collect();
        if squashed == "followup" {
            return Some(Section::FollowUp);
        }
        None
    }

    fn name(&self) -> &'static str {
        match self {
            Section::Plan => "plan",
            Section::Actions => "actions",
            Section::Data => "data",
            Section::Errors => "errors",
            Section::Verification => "verification",
            Section::Missing => "missing",
            Section::FollowUp => "follow_up",
            Section::Draft => "draft",
        }
    }

    /// Follow-up 与 Draft 是标量分区（多行拼接），其余按列表累积
    fn is_scalar(&self) -> bool {
        matches!(self, Section::FollowUp | Section::Draft)
    }
}

/// 解析结果：ok 表示零错误且零缺失；handoff 为尽力而为的结构化结果（状态默认 blocked）
#[derive(Debug)]
pub struct ParseReport {
    pub ok: bool,
    pub handoff: ExecutionHandoff,
    pub errors: Vec<String>,
    pub missing_fields: Vec<String>,
}

impl ParseReport {
    /// 汇总失败原因，供修复提示与兜底错误使用
    pub fn failure_summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing_fields.is_empty() {
            parts.push(format!("missing: {}", self.missing_fields.join(", ")));
        }
        if !self.errors.is_empty() {
            parts.push(format!("errors: {}", self.errors.join("; ")));
        }
        if parts.is_empty() {
            "unknown".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// 去掉行首项目符号（`-` / `*` / `•`），返回剩余文本
fn strip_bullet(line: &str) -> &str {
    let line = line.trim();
    for marker in ['-', '*', '•'] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim();
        }
    }
    line
}

fn is_none_marker(text: &str) -> bool {
    text.eq_ignore_ascii_case("none")
}

fn append_item(handoff: &mut ExecutionHandoff, section: Section, item: &str) {
    match section {
        Section::Plan => handoff.plan.push(item.to_string()),
        Section::Actions => handoff.actions.push(item.to_string()),
        Section::Data => handoff.data.push(item.to_string()),
        Section::Errors => handoff.errors.push(item.to_string()),
        Section::Verification => handoff.verification.push(item.to_string()),
        Section::Missing => handoff.missing.push(item.to_string()),
        Section::FollowUp => append_scalar(&mut handoff.follow_up, item),
        Section::Draft => append_scalar(&mut handoff.draft, item),
    }
}

/// 标量分区多行时以换行拼接
fn append_scalar(slot: &mut Option<String>, item: &str) {
    match slot {
        Some(existing) => {
            existing.push('\n');
            existing.push_str(item);
        }
        None => *slot = Some(item.to_string()),
    }
}

/// 解析执行阶段输出为结构化交接文档。
///
/// 头部行缺失是硬失败（missing_fields = ["header"]，立即返回）；其余问题
/// （非法状态值、缺失分区）累积记录后继续扫描，让调用方拿到尽力而为的结果。
pub fn parse_handoff(raw: &str) -> ParseReport {
    let mut handoff = ExecutionHandoff {
        raw: raw.to_string(),
        ..Default::default()
    };
    let mut errors: Vec<String> = Vec::new();
    let mut missing_fields: Vec<String> = Vec::new();

    let lines: Vec<&str> = raw.lines().collect();
    let Some(header_idx) = lines
        .iter()
        .position(|l| l.trim().eq_ignore_ascii_case(HANDOFF_HEADER))
    else {
        missing_fields.push("header".to_string());
        return ParseReport {
            ok: false,
            handoff,
            errors,
            missing_fields,
        };
    };

    let mut seen: HashSet<Section> = HashSet::new();
    let mut status_seen = false;
    let mut current: Option<Section> = None;

    for line in &lines[header_idx + 1..] {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // 项目符号行一定是分区内容，不参与分区头识别
        let bulleted = trimmed.starts_with(['-', '*', '•']);

        if !bulleted {
            if let Some((key, value)) = trimmed.split_once(':') {
                if key.trim().eq_ignore_ascii_case("status") {
                    status_seen = true;
                    current = None;
                    let value = value.trim();
                    match HandoffStatus::parse(value) {
                        Some(status) => handoff.status = status,
                        None => errors.push(format!("invalid status value: '{value}'")),
                    }
                    continue;
                }
                if let Some(section) = Section::from_key(key) {
                    seen.insert(section);
                    current = Some(section);
                    let inline = value.trim();
                    if !inline.is_empty() && !is_none_marker(inline) {
                        append_item(&mut handoff, section, inline);
                    }
                    continue;
                }
            }
        }

        // 分区内的续行：去项目符号后追加；"none" 是显式空标记
        if let Some(section) = current {
            let item = strip_bullet(trimmed);
            if item.is_empty() || is_none_marker(item) {
                continue;
            }
            append_item(&mut handoff, section, item);
        }
    }

    if !status_seen {
        missing_fields.push("status".to_string());
    }
    for section in REQUIRED_SECTIONS {
        if !seen.contains(&section) {
            missing_fields.push(section.name().to_string());
        }
    }

    // 结构门禁：即便分区齐全，也要再过一遍 schema 校验
    errors.extend(validate_against_schema(&handoff));

    let ok = errors.is_empty() && missing_fields.is_empty();
    ParseReport {
        ok,
        handoff,
        errors,
        missing_fields,
    }
}

fn validator() -> &'static jsonschema::Validator {
    static VALIDATOR: OnceLock<jsonschema::Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        let schema = serde_json::to_value(schemars::schema_for!(ExecutionHandoff))
            .expect("handoff schema serializes");
        jsonschema::validator_for(&schema).expect("handoff schema compiles")
    })
}

fn validate_against_schema(handoff: &ExecutionHandoff) -> Vec<String> {
    let instance = match serde_json::to_value(handoff) {
        Ok(v) => v,
        Err(e) => return vec![format!("handoff serialization failed: {e}")],
    };
    validator()
        .iter_errors(&instance)
        .map(|e| format!("schema violation: {e}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "\
EXECUTION_HANDOFF
Status: done
Plan:
- look up the issue
- close it
Actions:
- closed ENG-123 via tracker_close_issue
Data:
- ENG-123 was already resolved
Errors:
- none
Verification:
- re-fetched ENG-123, state is closed
Missing:
- none
Follow-up:
- none
Draft:
- Done. ENG-123 is closed.
";

    #[test]
    fn test_parse_full_document() {
        let report = parse_handoff(FULL);
        assert!(report.ok, "errors: {:?}", report.errors);
        let h = report.handoff;
        assert_eq!(h.status, HandoffStatus::Done);
        assert_eq!(h.plan.len(), 2);
        assert_eq!(h.actions, vec!["closed ENG-123 via tracker_close_issue"]);
        assert!(h.errors.is_empty());
        assert!(h.missing.is_empty());
        assert_eq!(h.follow_up, None);
        assert_eq!(h.draft.as_deref(), Some("Done. ENG-123 is closed."));
    }

    #[test]
    fn test_missing_header_is_hard_failure() {
        let report = parse_handoff("Status: done\nPlan:\n- x\n");
        assert!(!report.ok);
        assert_eq!(report.missing_fields, vec!["header".to_string()]);
    }

    #[test]
    fn test_missing_sections_are_reported() {
        let report = parse_handoff("EXECUTION_HANDOFF\nStatus: done\nPlan:\n- x\n");
        assert!(!report.ok);
        for name in ["actions", "data", "errors", "verification", "missing"] {
            assert!(
                report.missing_fields.contains(&name.to_string()),
                "expected {name} in {:?}",
                report.missing_fields
            );
        }
        assert!(!report.missing_fields.contains(&"plan".to_string()));
    }

    #[test]
    fn test_invalid_status_recorded_but_scan_continues() {
        let text = FULL.replace("Status: done", "Status: finished");
        let report = parse_handoff(&text);
        assert!(!report.ok);
        assert!(report.errors.iter().any(|e| e.contains("finished")));
        // 状态回落为默认 blocked，但其余分区照常解析
        assert_eq!(report.handoff.status, HandoffStatus::Blocked);
        assert_eq!(report.handoff.plan.len(), 2);
        // Status 行出现过，不算缺失
        assert!(!report.missing_fields.contains(&"status".to_string()));
    }

    #[test]
    fn test_absent_status_defaults_to_blocked() {
        let text = FULL.replace("Status: done\n", "");
        let report = parse_handoff(&text);
        assert!(!report.ok);
        assert!(report.missing_fields.contains(&"status".to_string()));
        assert_eq!(report.handoff.status, HandoffStatus::Blocked);
    }

    #[test]
    fn test_follow_up_key_variants_and_multiline_concat() {
        let text = "\
EXECUTION_HANDOFF
Status: needs_info
Plan:
- none
Actions:
- none
Data:
- none
Errors:
- none
Verification:
- none
Missing:
- budget range
Follow up:
- What budget range should I use?
- And which region?
";
        let report = parse_handoff(text);
        assert!(report.ok, "errors: {:?}", report.errors);
        assert_eq!(
            report.handoff.follow_up.as_deref(),
            Some("What budget range should I use?\nAnd which region?")
        );
    }

    #[test]
    fn test_none_markers_and_bullet_styles() {
        let text = "\
EXECUTION_HANDOFF
Status: done
Plan: none
Actions:
* first action
• second action
- NONE
Data:
- none
Errors:
- none
Verification:
- checked twice
Missing:
- none
";
        let report = parse_handoff(text);
        assert!(report.ok, "errors: {:?}", report.errors);
        assert!(report.handoff.plan.is_empty());
        assert_eq!(report.handoff.actions, vec!["first action", "second action"]);
    }

    #[test]
    fn test_inline_value_becomes_first_item() {
        let text = "\
EXECUTION_HANDOFF
Status: done
Plan: reply directly
Actions: none
Data: user asked a greeting
Errors: none
Verification: none
Missing: none
";
        let report = parse_handoff(text);
        assert!(report.ok, "errors: {:?}", report.errors);
        assert_eq!(report.handoff.plan, vec!["reply directly"]);
        assert_eq!(report.handoff.data, vec!["user asked a greeting"]);
    }

    #[test]
    fn test_bulleted_line_with_colon_stays_in_section() {
        let text = "\
EXECUTION_HANDOFF
Status: done
Plan:
- none
Actions:
- data: exported 3 rows to the report
Data:
- none
Errors:
- none
Verification:
- none
Missing:
- none
";
        let report = parse_handoff(text);
        assert!(report.ok, "errors: {:?}", report.errors);
        assert_eq!(report.handoff.actions, vec!["data: exported 3 rows to the report"]);
        assert!(report.handoff.data.is_empty());
    }

    #[test]
    fn test_preamble_before_header_is_ignored() {
        let text = format!("Sure, here is the handoff:\n\n{FULL}");
        let report = parse_handoff(&text);
        assert!(report.ok, "errors: {:?}", report.errors);
        assert_eq!(report.handoff.status, HandoffStatus::Done);
    }
}
