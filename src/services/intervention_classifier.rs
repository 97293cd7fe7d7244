//! Classification of streamed agent output into intervention requests.
//!
//! Table-driven: the pattern set is data, evaluated in declared order, so
//! classification stays testable and extensible without code change. Four
//! classes are tried in fixed priority: choice, approval, input, question.
//! Best-effort on both sides: a missed pattern means the chunk is ignored,
//! a false positive is answered or times out.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::models::intervention::{InterventionKind, InterventionRequest};

/// Hard cap on the extracted context, including the truncation marker.
pub const MAX_CONTEXT_LEN: usize = 500;

static NUMBERED_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+[.)]\s+(\S.*)$").expect("numbered option pattern"));

static BULLETED_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[-*]\s+(\S.*)$").expect("bulleted option pattern"));

static CHOICE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:choose|pick|select)\s+(?:one|an option|from|between)\b|\bwhich\s+(?:one|option)\b")
        .expect("choice phrase pattern")
});

/// Phrase table for the non-structural classes, tried in declared order.
static CLASS_PATTERNS: Lazy<Vec<(InterventionKind, Regex)>> = Lazy::new(|| {
    let table: &[(InterventionKind, &str)] = &[
        (
            InterventionKind::Approval,
            r"(?i)\b(?:approve|confirm|allow|permit|authorize)\b",
        ),
        (
            InterventionKind::Approval,
            r"(?i)\bwaiting for (?:your )?(?:approval|confirmation|permission)\b",
        ),
        (
            InterventionKind::Approval,
            r"(?i)\bproceed with (?:this|the|these)\b",
        ),
        (InterventionKind::Approval, r"(?i)\bdo you want me to\b"),
        (
            InterventionKind::Approval,
            r"(?i)\b(?:may|shall|can) i (?:proceed|continue)\b",
        ),
        (
            InterventionKind::Input,
            r"(?i)\b(?:enter|provide|specify|type|input)\s+(?:a|an|the|your)\b",
        ),
        (InterventionKind::Input, r"(?i)\bwhat(?: is|'s) your\b"),
    ];
    table
        .iter()
        .map(|(kind, pattern)| (*kind, Regex::new(pattern).expect("classifier pattern")))
        .collect()
});

/// Classify an output chunk. Returns a new pending request on a match.
///
/// Pure function of `(agent_id, chunk)`; errors in the pattern engine are
/// impossible by construction, and unmatched text is simply ignored.
pub fn classify(agent_id: &str, chunk: &str) -> Option<InterventionRequest> {
    let text = chunk.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(request) = classify_choice(agent_id, text) {
        return Some(request);
    }

    let (prompt, context) = split_prompt(text);

    for (kind, pattern) in CLASS_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Some(InterventionRequest::new(
                agent_id,
                *kind,
                prompt,
                Vec::new(),
                context,
            ));
        }
    }

    if prompt.ends_with('?') {
        return Some(InterventionRequest::new(
            agent_id,
            InterventionKind::Question,
            prompt,
            Vec::new(),
            context,
        ));
    }

    None
}

fn classify_choice(agent_id: &str, text: &str) -> Option<InterventionRequest> {
    let numbered = extract_options(text, &NUMBERED_OPTION);
    let bulleted = extract_options(text, &BULLETED_OPTION);

    let structural = numbered.len() >= 2 || bulleted.len() >= 2;
    if !structural && !CHOICE_PHRASE.is_match(text) {
        return None;
    }

    // Numbered wins when both yield at least two.
    let options = if numbered.len() >= 2 {
        numbered
    } else if bulleted.len() >= 2 {
        bulleted
    } else {
        return None;
    };

    // An option block with no prompt line is noise, not a request.
    let prompt_line = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty() && !is_option_line(line))?;
    let (prompt, context) = split_prompt(text);
    debug_assert_eq!(prompt, prompt_line.trim());

    Some(InterventionRequest::new(
        agent_id,
        InterventionKind::Choice,
        prompt,
        options,
        context,
    ))
}

fn is_option_line(line: &str) -> bool {
    NUMBERED_OPTION.is_match(line) || BULLETED_OPTION.is_match(line)
}

fn extract_options(text: &str, pattern: &Regex) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            pattern
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
        })
        .collect()
}

/// Prompt = last non-option, non-empty line (or the whole chunk when no
/// line qualifies); context = everything before it, leading-truncated.
fn split_prompt(text: &str) -> (String, String) {
    let lines: Vec<&str> = text.lines().collect();
    let Some(index) = lines
        .iter()
        .rposition(|line| !line.trim().is_empty() && !is_option_line(line))
    else {
        return (text.to_string(), String::new());
    };

    let prompt = lines[index].trim().to_string();
    let context = truncate_context(lines[..index].join("\n").trim());
    (prompt, context)
}

fn truncate_context(context: &str) -> String {
    let count = context.chars().count();
    if count <= MAX_CONTEXT_LEN {
        return context.to_string();
    }
    let keep = MAX_CONTEXT_LEN - 1;
    let tail: String = context
        .chars()
        .skip(count - keep)
        .collect();
    format!("…{tail}")
}
