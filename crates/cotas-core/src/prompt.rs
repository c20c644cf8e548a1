use cotas_types::{Context, TranscriptEntry, TurnKind};

/// Notice inserted at the head of the rendered transcript when older
/// entries were dropped to fit the character budget.
pub const COMPACTION_NOTICE: &str = "[earlier steps omitted to fit the context budget]";

const SEARCH_RESULT_LIMIT: usize = 5;

const ACTION_FORMATS: &str = r#"Respond with exactly one JSON object, no prose, in one of these shapes:
{"action": "THINK", "content": "<your reasoning about what to do next>"}
{"action": "SEARCH", "content": "<keywords to look up in the session transcript>"}
{"action": "ACT", "content": "<python code to run>", "rationale": "<one line on what the code checks>"}
{"action": "EVALUATION", "verdict": "<sufficient|insufficient>", "content": "<assessment of the latest result>"}
{"action": "DONE", "content": "<final insight answering the analysis goal>"}"#;

/// The main per-step prompt: goal, dataset metadata, the (budgeted)
/// transcript so far, the latest output and the action format contract.
pub fn build_decision_prompt(
    goal: &str,
    context: &Context,
    last_output: Option<&str>,
    step: u32,
    max_loops: u32,
    history_budget: usize,
) -> String {
    let datasets = if context.datasets.is_empty() {
        "none registered".to_string()
    } else {
        serde_json::to_string_pretty(&context.datasets)
            .unwrap_or_else(|_| "unavailable".to_string())
    };

    let history = render_history(&context.history, history_budget);
    let latest = last_output.unwrap_or("none yet");

    format!(
        "You are an autonomous data analyst working one step at a time.\n\n\
         Analysis goal: {goal}\n\n\
         Available datasets (metadata only, files live in ./datasets/):\n{datasets}\n\n\
         Transcript so far:\n{history}\n\n\
         Latest output:\n{latest}\n\n\
         This is step {step} of at most {max_loops}. Choose the single best next action.\n\n\
         {ACTION_FORMATS}"
    )
}

/// One retry after a completion the parser rejected. Quotes the reason so
/// the model knows what to fix.
pub fn build_corrective_prompt(base_prompt: &str, reason: &str) -> String {
    format!(
        "{base_prompt}\n\n\
         Your previous reply could not be used: {reason}.\n\
         Reply again with ONLY one JSON object in one of the shapes above. \
         No markdown fences, no commentary."
    )
}

/// Asks the model to turn raw execution output into a short insight.
pub fn build_insight_prompt(code: &str, output: &str) -> String {
    format!(
        "The following python code was executed:\n```python\n{code}\n```\n\n\
         It produced this output:\n{output}\n\n\
         State in one or two sentences what this result tells us about the data. \
         Plain text only, no JSON."
    )
}

/// Budget-exhaustion fallback: summarize what was learned so far.
pub fn build_summary_prompt(goal: &str, context: &Context, last_output: Option<&str>) -> String {
    let history = render_history(&context.history, usize::MAX);
    let latest = last_output.unwrap_or("none");
    format!(
        "The analysis loop for this goal ran out of steps:\n{goal}\n\n\
         Transcript:\n{history}\n\n\
         Latest output:\n{latest}\n\n\
         Write the best final insight you can from the evidence above, in plain text. \
         If the evidence is insufficient, say what is known and what remains open."
    )
}

/// Render the transcript newest-last, dropping the oldest entries first
/// when the character budget is exceeded. A notice line marks the cut.
pub fn render_history(history: &[TranscriptEntry], budget: usize) -> String {
    if history.is_empty() {
        return "(empty)".to_string();
    }

    let lines: Vec<String> = history.iter().map(render_entry).collect();
    let total: usize = lines.iter().map(|l| l.chars().count() + 1).sum();

    if total <= budget {
        return lines.join("\n");
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut used = COMPACTION_NOTICE.chars().count() + 1;
    for line in lines.iter().rev() {
        let cost = line.chars().count() + 1;
        if used + cost > budget && !kept.is_empty() {
            break;
        }
        used += cost;
        kept.push(line);
    }
    kept.push(COMPACTION_NOTICE);
    kept.reverse();
    kept.join("\n")
}

fn render_entry(entry: &TranscriptEntry) -> String {
    match entry.step {
        Some(step) => format!("[step {step}][{}] {}", entry.kind.as_str(), entry.payload),
        None => format!("[{}] {}", entry.kind.as_str(), entry.payload),
    }
}

/// Case-insensitive keyword lookup over the transcript, newest first,
/// capped at five hits. Think and search turns are skipped so a query
/// cannot match its own echo.
pub fn search_transcript(history: &[TranscriptEntry], query: &str) -> String {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return "empty query; nothing searched".to_string();
    }

    let matches: Vec<String> = history
        .iter()
        .rev()
        .filter(|entry| {
            !matches!(entry.kind, TurnKind::Search | TurnKind::Think)
                && entry.payload.to_lowercase().contains(&needle)
        })
        .take(SEARCH_RESULT_LIMIT)
        .map(render_entry)
        .collect();

    if matches.is_empty() {
        format!("no transcript entries match `{query}`")
    } else {
        matches.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotas_types::TurnKind;

    fn entry(step: u32, kind: TurnKind, payload: &str) -> TranscriptEntry {
        TranscriptEntry::for_step(step, kind, payload)
    }

    #[test]
    fn history_within_budget_is_untouched() {
        let history = vec![
            entry(1, TurnKind::Think, "first"),
            entry(2, TurnKind::Insight, "second"),
        ];
        let rendered = render_history(&history, 10_000);
        assert!(rendered.contains("first"));
        assert!(rendered.contains("second"));
        assert!(!rendered.contains(COMPACTION_NOTICE));
    }

    #[test]
    fn over_budget_drops_oldest_and_marks_the_cut() {
        let history: Vec<TranscriptEntry> = (0..50)
            .map(|i| entry(i, TurnKind::Insight, &format!("insight number {i:02}")))
            .collect();
        let rendered = render_history(&history, 300);
        assert!(rendered.starts_with(COMPACTION_NOTICE));
        assert!(rendered.contains("insight number 49"));
        assert!(!rendered.contains("insight number 00"));
        assert!(rendered.chars().count() <= 300);
    }

    #[test]
    fn budget_smaller_than_one_entry_still_keeps_the_newest() {
        let history = vec![entry(1, TurnKind::Insight, &"x".repeat(500))];
        let rendered = render_history(&history, 50);
        assert!(rendered.contains(COMPACTION_NOTICE));
        assert!(rendered.contains("xxx"));
    }

    #[test]
    fn decision_prompt_mentions_goal_and_datasets() {
        let mut context = Context::default();
        context.datasets.push(cotas_types::DatasetMeta {
            name: "sales.csv".into(),
            columns: vec![],
            row_count: 42,
            sample_rows: vec![],
        });
        let prompt = build_decision_prompt("find top region", &context, None, 1, 15, 10_000);
        assert!(prompt.contains("find top region"));
        assert!(prompt.contains("sales.csv"));
        assert!(prompt.contains("\"action\": \"DONE\""));
    }

    #[test]
    fn search_returns_newest_matches_first_capped_at_five() {
        let history: Vec<TranscriptEntry> = (0..8)
            .map(|i| entry(i, TurnKind::Insight, &format!("revenue figure {i}")))
            .collect();
        let result = search_transcript(&history, "REVENUE");
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("revenue figure 7"));
        assert!(lines[4].contains("revenue figure 3"));
    }

    #[test]
    fn search_skips_think_and_search_turns() {
        let history = vec![
            entry(1, TurnKind::Search, "query: revenue"),
            entry(2, TurnKind::Think, "revenue should be in sales.csv"),
            entry(3, TurnKind::Insight, "revenue peaked in Q3"),
        ];
        let result = search_transcript(&history, "revenue");
        assert_eq!(result.lines().count(), 1);
        assert!(result.contains("peaked in Q3"));
    }

    #[test]
    fn search_without_matches_says_so() {
        let history = vec![entry(1, TurnKind::Insight, "nothing relevant")];
        let result = search_transcript(&history, "churn");
        assert!(result.contains("no transcript entries match"));
    }
}
