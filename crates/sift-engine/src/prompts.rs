use chrono::{DateTime, Utc};

use sift_core::types::{ConversationTurn, Preferences, ResponseFormat, Role, Tone, UserContext, Verbosity};

use crate::registry::OperationInfo;

pub const PLANNER_SYSTEM: &str = "You are the planning stage of a personal-data assistant. \
You turn a request into an execution graph of typed operations. You never answer the request yourself.";

pub const SYNTHESIS_SYSTEM: &str = "You are a personal assistant answering questions about the user's \
email, calendar, contacts and chat. Answer only from the findings you are given and say plainly \
when something could not be checked.";

/// Everything the planner sees about one request.
pub struct PlanningPrompt<'a> {
    pub query: &'a str,
    pub history: &'a [ConversationTurn],
    pub user: &'a UserContext,
    pub now: DateTime<Utc>,
    pub operations: &'a [OperationInfo],
}

impl PlanningPrompt<'_> {
    pub fn render(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("Current time: {}\n\n", self.now.to_rfc3339()));

        prompt.push_str("## User\n");
        prompt.push_str(&self.user.summary());
        prompt.push_str("\n\n");

        if !self.history.is_empty() {
            prompt.push_str("## Recent conversation\n");
            for turn in self.history {
                let who = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                prompt.push_str(&format!("[{}] {}\n", who, turn.text));
            }
            prompt.push('\n');
        }

        prompt.push_str("## Available operations\n");
        for op in self.operations {
            prompt.push_str(&format!(
                "- {}: {}\n  example parameters: {}\n",
                op.tag, op.description, op.parameter_hint
            ));
        }

        prompt.push_str(
            r#"
## Rules
- Every node has a unique `id`, a `type` from the list above, `parameters`, `dependsOn` and an integer `stage` >= 0.
- A node may only depend on nodes in a strictly lower stage. Nodes in the same stage run in parallel.
- To use another node's output write {"$ref": "<node id>", "path": "<field>"} as a parameter value and list that node in `dependsOn`. Filters and searches output `items` and `count`; batch_thread_read outputs `threads`. A list of references is concatenated.
- cross_reference combines results of earlier nodes, so it always has at least one entry in `dependsOn`.
- Use as few nodes as the request needs. If no personal data is needed, return an empty `nodes` array.
- Fill `resourceEstimate` with your best guess of tokens, cost in USD and time in ms.
"#,
        );

        prompt.push_str(&format!("\n## Request\n{}\n", self.query));
        prompt
    }
}

/// Appended to the planning prompt on the second attempt.
pub fn correction(error: &str) -> String {
    format!(
        "\n## Your previous plan was rejected\n{}\nReturn a corrected plan that fixes every problem above.\n",
        error
    )
}

/// Appended when re-planning after fatal node failures.
pub fn replan_note(failures: &[String]) -> String {
    let mut note = String::from("\n## A previous plan for this request failed\n");
    for f in failures {
        note.push_str(&format!("- {}\n", f));
    }
    note.push_str("Plan again without repeating the failing steps as they were.\n");
    note
}

pub fn style_instructions(preferences: &Preferences) -> String {
    let tone = match preferences.tone {
        Tone::Neutral => "Use a neutral tone.",
        Tone::Friendly => "Use a warm, friendly tone.",
        Tone::Formal => "Use a formal tone.",
    };
    let verbosity = match preferences.verbosity {
        Verbosity::Brief => "Keep it to two or three sentences.",
        Verbosity::Normal => "Be concise but complete.",
        Verbosity::Detailed => "Give a thorough answer with relevant specifics.",
    };
    let format = match preferences.format {
        ResponseFormat::Prose => "Write plain prose.",
        ResponseFormat::Bullets => "Answer as a bulleted list.",
        ResponseFormat::Markdown => "Format the answer as Markdown.",
    };
    format!("{} {} {}", tone, verbosity, format)
}

pub fn synthesis(query: &str, findings: &str, preferences: &Preferences) -> String {
    format!(
        "## Request\n{}\n\n## Findings\n{}\n\n## Style\n{}\n\nAnswer the request using only these findings. \
         If some findings failed or were skipped, mention what could not be checked.",
        query,
        findings,
        style_instructions(preferences)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StrategyRegistry;
    use sift_test_utils::fixed_now;

    #[test]
    fn test_planning_prompt_contents() {
        let registry = StrategyRegistry::with_builtins();
        let ops = registry.operations();
        let history = vec![
            ConversationTurn::user("anything from Dana?"),
            ConversationTurn::assistant("Two emails this week."),
        ];
        let user = UserContext {
            name: Some("Ada".into()),
            notes: vec!["boss: dana@acme.com".into()],
            ..Default::default()
        };
        let prompt = PlanningPrompt {
            query: "which of them are urgent?",
            history: &history,
            user: &user,
            now: fixed_now(),
            operations: &ops,
        }
        .render();

        assert!(prompt.contains("2026-10-19T12:00:00+00:00"));
        assert!(prompt.contains("boss: dana@acme.com"));
        assert!(prompt.contains("[assistant] Two emails this week."));
        assert!(prompt.contains("- semantic_analysis:"));
        assert!(prompt.contains("\"$ref\""));
        assert!(prompt.ends_with("which of them are urgent?\n"));
    }

    #[test]
    fn test_style_instructions() {
        let prefs = Preferences {
            tone: Tone::Formal,
            verbosity: Verbosity::Brief,
            format: ResponseFormat::Bullets,
        };
        let style = style_instructions(&prefs);
        assert!(style.contains("formal"));
        assert!(style.contains("two or three sentences"));
        assert!(style.contains("bulleted"));
    }
}
