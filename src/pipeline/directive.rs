//! 呈现阶段指令派生
//!
//! 根据交接状态生成呈现指令：planning / needs_info / blocked 一律不许声称完成，
//! 给任务回执、亮出计划并追问；done 基于交接内容作答，未验证的变更要点名。
//! 用户原话命中「简报」启发式（意图词 + 实体词共现）且状态为 done 时，追加固定的
//! 四分区简报排版指令（逐区标注数据来源）。

use crate::handoff::{ExecutionHandoff, HandoffStatus};

/// 呈现阶段基础系统提示词（无工具，只基于对话与交接文档作答）
pub const PRESENTER_PROMPT: &str = "\
You are the presentation phase of a two-phase assistant. The execution phase has \
already done the work and summarized it in the execution handoff below. Write the \
final reply to the user based only on the conversation and that handoff. Never \
mention the handoff document itself. Use plain text with light markdown \
(links, bold) only.";

/// 简报意图词
const BRIEFING_INTENT: &[&str] = &[
    "brief",
    "briefing",
    "tell me about",
    "overview",
    "summary of",
    "summarize",
];

/// 简报实体词（公司 / 商机 / 联系人一类）
const BRIEFING_ENTITY: &[&str] = &[
    "company",
    "account",
    "deal",
    "contact",
    "customer",
    "client",
    "prospect",
    "lead",
    "org",
];

/// 简报启发式：意图词与实体词同时出现
pub fn looks_like_briefing(input: &str) -> bool {
    let lower = input.to_lowercase();
    BRIEFING_INTENT.iter().any(|w| lower.contains(w))
        && BRIEFING_ENTITY.iter().any(|w| lower.contains(w))
}

/// 固定四分区简报排版指令
const BRIEFING_DIRECTIVE: &str = "\
Format the reply as a briefing with exactly four sections: \
1. Snapshot, 2. Recent activity, 3. Risks & open items, 4. Suggested next steps. \
Under each section, cite the source of the information (from the handoff Data bullets).";

fn join_or(items: &[String], fallback: &str) -> String {
    if items.is_empty() {
        fallback.to_string()
    } else {
        items.join("; ")
    }
}

/// 从交接状态派生呈现指令
pub fn presenter_directive(handoff: &ExecutionHandoff, user_input: &str) -> String {
    let mut lines: Vec<String> = Vec::new();

    match handoff.status {
        HandoffStatus::Planning | HandoffStatus::NeedsInfo => {
            lines.push("- Start with a one-line receipt acknowledging the task.".to_string());
            if handoff.plan.is_empty() {
                lines.push(
                    "- Sketch a short plan of how you would proceed (the executor did not record one)."
                        .to_string(),
                );
            } else {
                lines.push(format!("- Surface the plan: {}.", handoff.plan.join("; ")));
            }
            lines.push("- Do not claim that any work was completed.".to_string());
            match &handoff.follow_up {
                Some(q) => lines.push(format!("- Ask the user: {q}")),
                None => lines.push(
                    "- Ask a short clarifying question or confirm how to proceed.".to_string(),
                ),
            }
        }
        HandoffStatus::Blocked => {
            lines.push("- Start with a one-line receipt acknowledging the task.".to_string());
            if !handoff.plan.is_empty() {
                lines.push(format!("- Surface the plan: {}.", handoff.plan.join("; ")));
            }
            lines.push("- Do not claim that any work was completed.".to_string());
            lines.push(format!(
                "- Explain what is missing: {}.",
                join_or(&handoff.missing, "unclear")
            ));
            lines.push(format!(
                "- Mention the errors hit: {}.",
                join_or(&handoff.errors, "none recorded")
            ));
            lines.push("- Suggest concrete next steps to get unblocked.".to_string());
            match &handoff.follow_up {
                Some(q) => lines.push(format!("- Ask the user: {q}")),
                None => lines.push(
                    "- Ask a short clarifying question or confirm how to proceed.".to_string(),
                ),
            }
        }
        HandoffStatus::Done => {
            lines.push(
                "- Answer the user using the handoff's Data and Actions content.".to_string(),
            );
            if !handoff.plan.is_empty() {
                lines.push(
                    "- Optionally open with a one-line receipt of the plan that was followed."
                        .to_string(),
                );
            }
            let unverified = !handoff.actions.is_empty()
                && (handoff.verification.is_empty()
                    || handoff
                        .verification
                        .iter()
                        .all(|v| v.to_lowercase().contains("not run")));
            if unverified {
                lines.push(
                    "- Actions were taken but no verification was recorded: say so explicitly \
                     for anything that changed external state."
                        .to_string(),
                );
            }
            if handoff.draft.is_some() {
                lines.push(
                    "- Use the handoff Draft as the starting point for the reply.".to_string(),
                );
            }
            if looks_like_briefing(user_input) {
                lines.push(format!("- {BRIEFING_DIRECTIVE}"));
            }
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handoff(status: HandoffStatus) -> ExecutionHandoff {
        ExecutionHandoff {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn test_briefing_heuristic_needs_both_word_classes() {
        assert!(looks_like_briefing("Give me a brief on the Acme deal"));
        assert!(looks_like_briefing("tell me about this customer"));
        // 只有意图词
        assert!(!looks_like_briefing("give me a brief update"));
        // 只有实体词
        assert!(!looks_like_briefing("close the deal"));
        assert!(!looks_like_briefing("what's the weather"));
    }

    #[test]
    fn test_done_with_briefing_appends_layout() {
        let mut h = handoff(HandoffStatus::Done);
        h.data.push("Acme is in stage 3".to_string());
        let d = presenter_directive(&h, "tell me about the Acme account");
        assert!(d.contains("four sections"));
        assert!(d.contains("Snapshot"));

        let d = presenter_directive(&h, "what's the status of ENG-123?");
        assert!(!d.contains("four sections"));
    }

    #[test]
    fn test_needs_info_never_claims_completion_and_asks_follow_up() {
        let mut h = handoff(HandoffStatus::NeedsInfo);
        h.follow_up = Some("Which region should I use?".to_string());
        let d = presenter_directive(&h, "set up the report");
        assert!(d.contains("Do not claim"));
        assert!(d.contains("Which region should I use?"));
    }

    #[test]
    fn test_blocked_surfaces_missing_and_errors() {
        let mut h = handoff(HandoffStatus::Blocked);
        h.missing = vec!["api credentials".to_string()];
        h.errors = vec!["CRM returned 500".to_string()];
        let d = presenter_directive(&h, "update the deal");
        assert!(d.contains("api credentials"));
        assert!(d.contains("CRM returned 500"));
        assert!(d.contains("next steps"));
    }

    #[test]
    fn test_done_flags_unverified_actions() {
        let mut h = handoff(HandoffStatus::Done);
        h.actions = vec!["closed ENG-123".to_string()];
        h.verification = vec!["not run".to_string()];
        let d = presenter_directive(&h, "close ENG-123");
        assert!(d.contains("no verification was recorded"));

        h.verification = vec!["re-fetched issue, state is closed".to_string()];
        let d = presenter_directive(&h, "close ENG-123");
        assert!(!d.contains("no verification was recorded"));
    }

    #[test]
    fn test_done_uses_draft_when_present() {
        let mut h = handoff(HandoffStatus::Done);
        h.draft = Some("Done. Closed it.".to_string());
        let d = presenter_directive(&h, "close ENG-123");
        assert!(d.contains("starting point"));
    }
}
