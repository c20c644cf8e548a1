use serde_json::Value;

use cotas_types::Decision;

/// Turn a raw model completion into a [`Decision`]. Never panics and never
/// guesses: anything that is not one well-formed action object degrades to
/// [`Decision::Unparseable`] with a reason the retry prompt can quote.
pub fn parse_decision(raw: &str) -> Decision {
    let stripped = strip_code_fences(raw);
    if stripped.is_empty() {
        return Decision::Unparseable {
            reason: "empty completion".to_string(),
        };
    }

    let value: Value = match serde_json::from_str(&stripped) {
        Ok(v) => v,
        Err(err) => {
            return Decision::Unparseable {
                reason: format!("invalid JSON ({err}): {}", snippet(&stripped)),
            }
        }
    };

    let Some(obj) = value.as_object() else {
        return Decision::Unparseable {
            reason: format!("expected a JSON object, got: {}", snippet(&stripped)),
        };
    };

    let Some(action) = obj.get("action").and_then(Value::as_str) else {
        return Decision::Unparseable {
            reason: "missing string field `action`".to_string(),
        };
    };

    let content = obj.get("content").and_then(Value::as_str);

    match action.to_ascii_uppercase().as_str() {
        "THINK" => match content {
            Some(text) => Decision::Think {
                content: text.to_string(),
            },
            None => missing_content("THINK"),
        },
        "SEARCH" => match content {
            Some(text) => Decision::Search {
                query: text.to_string(),
            },
            None => missing_content("SEARCH"),
        },
        "ACT" => match content {
            Some(code) => Decision::Act {
                code: code.to_string(),
                rationale: obj
                    .get("rationale")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            None => missing_content("ACT"),
        },
        "EVALUATION" => {
            let verdict = obj.get("verdict").and_then(Value::as_str);
            match (verdict, content) {
                (Some(verdict), Some(text)) => Decision::Evaluation {
                    verdict: verdict.to_string(),
                    text: text.to_string(),
                },
                (None, _) => Decision::Unparseable {
                    reason: "EVALUATION action missing string field `verdict`".to_string(),
                },
                (_, None) => missing_content("EVALUATION"),
            }
        }
        "DONE" => match content {
            Some(summary) => Decision::Done {
                summary: summary.to_string(),
            },
            None => missing_content("DONE"),
        },
        other => Decision::Unparseable {
            reason: format!("unknown action `{other}`"),
        },
    }
}

/// Remove a surrounding markdown code fence, tolerating a language tag and
/// prose around the fence. Models wrap JSON this way no matter how firmly
/// the prompt forbids it.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };

    let after_open = &trimmed[open + 3..];
    // skip the language tag on the opening line, if any
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];

    match body.rfind("```") {
        Some(close) => body[..close].trim().to_string(),
        None => body.trim().to_string(),
    }
}

fn missing_content(action: &str) -> Decision {
    Decision::Unparseable {
        reason: format!("{action} action missing string field `content`"),
    }
}

fn snippet(raw: &str) -> String {
    const MAX: usize = 160;
    if raw.chars().count() <= MAX {
        return raw.to_string();
    }
    let head: String = raw.chars().take(MAX).collect();
    format!("{head}...")
}
