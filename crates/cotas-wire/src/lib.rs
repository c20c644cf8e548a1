//! Text-frame encoding for the step-event stream.
//!
//! Each frame is a prefixed block of newline-delimited text. The first
//! line starts with one of the literal tokens below; lines that do not
//! start with a recognized token continue the previous frame's body, so a
//! multi-line payload travels as a single logical frame.

use serde::{Deserialize, Serialize};

use cotas_types::{EventKind, StepEvent};

/// Literal frame tokens, checked in order. `Final Insight:` must come
/// before any shorter prefix it could shadow.
const TOKENS: &[(&str, EventKind)] = &[
    ("Final Insight:", EventKind::Done),
    ("STEP:", EventKind::Step),
    ("THINK:", EventKind::Think),
    ("SEARCH:", EventKind::Search),
    ("ACT:", EventKind::Act),
    ("INSIGHT:", EventKind::Insight),
    ("EVALUATION:", EventKind::Evaluation),
    ("FINAL:", EventKind::Final),
    ("ERROR:", EventKind::Error),
];

pub fn token_for(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Step => "STEP:",
        EventKind::Think => "THINK:",
        EventKind::Search => "SEARCH:",
        EventKind::Act => "ACT:",
        EventKind::Insight => "INSIGHT:",
        EventKind::Evaluation => "EVALUATION:",
        EventKind::Final => "FINAL:",
        EventKind::Done => "Final Insight:",
        EventKind::Error => "ERROR:",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    pub kind: EventKind,
    pub body: String,
}

/// Render one event as a wire frame. The payload's first line lands on
/// the token line; any remaining lines follow as continuation lines.
pub fn encode_frame(event: &StepEvent) -> String {
    let mut lines = event.payload.lines();
    let header = lines.next().unwrap_or_default();
    let mut out = format!("{} {}", token_for(event.kind), header);
    for line in lines {
        out.push('\n');
        out.push_str(line);
    }
    out
}

pub fn encode_frames(events: &[StepEvent]) -> String {
    events
        .iter()
        .map(encode_frame)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a received text block back into frames. Continuation lines
/// (no recognized token) are appended to the previous frame's body;
/// leading continuation lines with no frame to attach to are dropped.
pub fn parse_frames(input: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    for line in input.lines() {
        match match_token(line) {
            Some((kind, rest)) => frames.push(Frame {
                kind,
                body: rest.trim_start().to_string(),
            }),
            None => {
                if let Some(last) = frames.last_mut() {
                    if !last.body.is_empty() {
                        last.body.push('\n');
                    }
                    last.body.push_str(line);
                }
            }
        }
    }
    frames
}

fn match_token(line: &str) -> Option<(EventKind, &str)> {
    TOKENS
        .iter()
        .find_map(|(token, kind)| line.strip_prefix(token).map(|rest| (*kind, rest)))
}
