//! 交接文档序列化
//!
//! 解析的逆操作：按固定分区顺序输出，列表项写成 `- item`，空分区写 `- none`。
//! 已知限制：字面量 "none" 无法表示为真实条目（解析侧会把它当空标记丢弃）。

use super::{ExecutionHandoff, HANDOFF_HEADER};

fn write_list(out: &mut String, key: &str, items: &[String]) {
    out.push_str(key);
    out.push_str(":\n");
    if items.is_empty() {
        out.push_str("- none\n");
        return;
    }
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}

/// 标量分区：缺失或空白写 `- none`，多行值逐行成项（解析侧会以换行拼回）
fn write_scalar(out: &mut String, key: &str, value: Option<&str>) {
    out.push_str(key);
    out.push_str(":\n");
    match value {
        Some(v) if !v.trim().is_empty() => {
            for line in v.lines() {
                out.push_str("- ");
                out.push_str(line);
                out.push('\n');
            }
        }
        _ => out.push_str("- none\n"),
    }
}

/// 按固定分区顺序序列化交接文档（呈现阶段的输入形态，也用于测试回环）
pub fn serialize_handoff(handoff: &ExecutionHandoff) -> String {
    let mut out = String::new();
    out.push_str(HANDOFF_HEADER);
    out.push('\n');
    out.push_str("Status: ");
    out.push_str(handoff.status.as_str());
    out.push('\n');
    write_list(&mut out, "Plan", &handoff.plan);
    write_list(&mut out, "Actions", &handoff.actions);
    write_list(&mut out, "Data", &handoff.data);
    write_list(&mut out, "Errors", &handoff.errors);
    write_list(&mut out, "Verification", &handoff.verification);
    write_list(&mut out, "Missing", &handoff.missing);
    write_scalar(&mut out, "Follow-up", handoff.follow_up.as_deref());
    write_scalar(&mut out, "Draft", handoff.draft.as_deref());
    out
}
