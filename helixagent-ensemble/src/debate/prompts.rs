//! Role instruction templates and prompt assembly.
//!
//! Each participant's prompt is built from the session topic, the prior
//! round's transcript slice, and the role-specific instruction template.
//! Memory context arrives already folded into the topic by the gateway's
//! enhancement stage.

use crate::debate::session::{DebateRole, Turn};
use crate::models::Message;

/// Role-specific system instruction.
pub fn role_instruction(role: DebateRole) -> &'static str {
    match role {
        DebateRole::Analyst => {
            "You are the Analyst in a structured debate. Break the topic into \
             its key facts, constraints and unknowns. State evidence plainly; \
             do not propose a final answer."
        }
        DebateRole::Proposer => {
            "You are the Proposer in a structured debate. Building on the \
             analysis so far, propose a concrete answer or solution and \
             justify it briefly."
        }
        DebateRole::Critic => {
            "You are the Critic in a structured debate. Examine the current \
             proposal for flaws, risks and missing considerations. Raise \
             concrete issues; do not rewrite the proposal."
        }
        DebateRole::Synthesizer => {
            "You are the Synthesizer in a structured debate. Combine the \
             analysis, proposal and critique into a single coherent answer. \
             Your synthesis is the candidate consensus."
        }
        DebateRole::Mediator => {
            "You are the Mediator in a structured debate. Weigh the \
             synthesis against the critique and state the final position, \
             noting any remaining disagreement."
        }
    }
}

/// Messages for one participant in one round.
pub fn participant_messages(
    topic: &str,
    role: DebateRole,
    round: u32,
    prior_round: &[&Turn],
) -> Vec<Message> {
    let mut user = format!("Debate topic:\n{topic}\n");
    if prior_round.is_empty() {
        user.push_str(&format!("\nThis is round {round}; no prior turns.\n"));
    } else {
        user.push_str(&format!("\nRound {} transcript:\n", round - 1));
        for turn in prior_round {
            user.push_str(&format!("[{}] {}\n", turn.role.as_str(), turn.content));
        }
    }
    user.push_str(&format!(
        "\nSpeak as the {} for round {round}.",
        role.as_str()
    ));

    vec![Message::system(role_instruction(role)), Message::user(user)]
}

/// Validation-phase prompt: score and annotate the candidate.
pub fn validation_messages(topic: &str, role: DebateRole, candidate: &str) -> Vec<Message> {
    vec![
        Message::system(role_instruction(role)),
        Message::user(format!(
            "Debate topic:\n{topic}\n\nCandidate consensus:\n{candidate}\n\n\
             Validate this candidate from your role's perspective. List each \
             problem on its own line prefixed with \"ISSUE:\". If you find \
             none, reply \"NO ISSUES\"."
        )),
    ]
}

/// Polish-phase prompt: the Synthesizer rewrites using validation notes.
pub fn polish_messages(topic: &str, candidate: &str, issues: &[String]) -> Vec<Message> {
    let notes = issues
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    vec![
        Message::system(role_instruction(DebateRole::Synthesizer)),
        Message::user(format!(
            "Debate topic:\n{topic}\n\nCurrent candidate:\n{candidate}\n\n\
             Validation notes:\n{notes}\n\nRewrite the candidate so every \
             note is addressed. Reply with the rewritten answer only."
        )),
    ]
}

/// Final-phase prompt: the Mediator emits the final consensus.
pub fn final_messages(topic: &str, candidate: &str) -> Vec<Message> {
    vec![
        Message::system(role_instruction(DebateRole::Mediator)),
        Message::user(format!(
            "Debate topic:\n{topic}\n\nAgreed candidate:\n{candidate}\n\n\
             State the final consensus answer for the user. Reply with the \
             answer only."
        )),
    ]
}

/// Count of `ISSUE:` lines in a validation reply.
pub fn count_issues(reply: &str) -> Vec<String> {
    reply
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            trimmed
                .strip_prefix("ISSUE:")
                .map(|rest| rest.trim().to_string())
        })
        .filter(|issue| !issue.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn round_one_has_no_prior_transcript() {
        let messages = participant_messages("What is 2+2?", DebateRole::Analyst, 1, &[]);
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("no prior turns"));
    }

    #[test]
    fn later_rounds_quote_the_previous_round() {
        let prior = Turn {
            round: 1,
            role: DebateRole::Synthesizer,
            content: "the answer is 4".to_string(),
            provider_used: "mock".to_string(),
            latency: Duration::from_millis(5),
            quality_score: 0.9,
            emitted_at: Utc::now(),
        };
        let messages =
            participant_messages("What is 2+2?", DebateRole::Critic, 2, &[&prior]);
        assert!(messages[1].content.contains("[synthesizer] the answer is 4"));
    }

    #[test]
    fn issues_are_parsed_line_by_line() {
        let reply = "Looks mostly fine.\nISSUE: missing citation\nISSUE: tone too informal\n";
        let issues = count_issues(reply);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0], "missing citation");
    }

    #[test]
    fn no_issues_reply_parses_empty() {
        assert!(count_issues("NO ISSUES").is_empty());
    }
}
