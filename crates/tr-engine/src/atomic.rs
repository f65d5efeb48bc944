//! Atomic pattern matching.
//!
//! Every enabled ATO definition compiles to one case-insensitive regex.
//! Matching runs per message, never per chunk, so the SEM windows above stay
//! coherent. Overlapping candidates of the same marker resolve to the
//! leftmost-longest match: the engine seeds each occurrence with the regex
//! crate's leftmost-first match, then probes every longer end position with
//! an anchored variant of the pattern and keeps the longest full match.
//! Matches of one marker never overlap; distinct markers may produce
//! coincident events on one message.

use crate::chunker::Message;
use crate::EngineError;
use chrono::Duration;
use regex::RegexBuilder;
use tr_core::{EventPayload, MarkerDefinition, MarkerEvent};

#[derive(Debug)]
pub struct CompiledPattern {
    pub marker_id: String,
    scan: regex::Regex,
    /// `^(?:pattern)$`, used to extend a seed match to the longest length.
    exact: regex::Regex,
}

/// Compile the patterns of the given ATO definitions, preserving their
/// order. A compile failure here means validation was bypassed; it aborts
/// the run.
pub fn compile(defs: &[&MarkerDefinition]) -> Result<Vec<CompiledPattern>, EngineError> {
    let mut compiled = Vec::with_capacity(defs.len());
    for def in defs {
        let pattern = def.pattern.as_deref().unwrap_or_default();
        let scan = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|_| EngineError::PatternCompile {
                marker_id: def.id.clone(),
            })?;
        let exact = RegexBuilder::new(&format!("^(?:{pattern})$"))
            .case_insensitive(true)
            .build()
            .map_err(|_| EngineError::PatternCompile {
                marker_id: def.id.clone(),
            })?;
        compiled.push(CompiledPattern {
            marker_id: def.id.clone(),
            scan,
            exact,
        });
    }
    Ok(compiled)
}

/// Leftmost-longest, non-overlapping matches of one pattern. The seed from
/// `find_at` is leftmost-first, which for same-start alternations can be
/// shorter than the longest alternative (`a|ab` on `"ab"` seeds `"a"`), so
/// every longer end is probed with the anchored pattern. Messages are single
/// utterances, which keeps the quadratic probe cheap.
fn leftmost_longest(pattern: &CompiledPattern, text: &str) -> Vec<(usize, usize)> {
    let mut matches = Vec::new();
    let mut at = 0;
    while let Some(seed) = pattern.scan.find_at(text, at) {
        let start = seed.start();
        let mut end = seed.end();
        let mut probe = end;
        while probe < text.len() {
            probe += text[probe..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
            if pattern.exact.is_match(&text[start..probe]) {
                end = probe;
            }
        }
        if end == start {
            // Empty match; step one char forward so the scan terminates.
            let Some(step) = text[start..].chars().next().map(char::len_utf8) else {
                break;
            };
            at = start + step;
            continue;
        }
        matches.push((start, end));
        at = end;
    }
    matches
}

/// Scan one message with every compiled pattern. Repeated matches of the
/// same marker within a message each produce an event; their timestamps are
/// offset by one millisecond per repeat so the storage key
/// `(conv, ts, marker_id, idx)` stays unique while `idx` remains the message
/// index.
pub fn scan_message(
    patterns: &[CompiledPattern],
    conv: &str,
    message: &Message,
) -> Vec<MarkerEvent> {
    let mut events = Vec::new();
    for pattern in patterns {
        for (repeat, (start, end)) in leftmost_longest(pattern, &message.text)
            .into_iter()
            .enumerate()
        {
            events.push(MarkerEvent {
                conv: conv.to_string(),
                ts: message.ts + Duration::milliseconds(repeat as i64),
                idx: message.idx,
                marker_id: pattern.marker_id.clone(),
                payload: EventPayload::Atomic {
                    text: message.text[start..end].to_string(),
                },
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tr_core::MarkerClass;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 1)
            .single()
            .expect("valid timestamp")
    }

    fn ato(id: &str, pattern: &str) -> MarkerDefinition {
        MarkerDefinition {
            id: id.to_string(),
            class: MarkerClass::Atomic,
            frame: None,
            examples: Vec::new(),
            tags: Vec::new(),
            pattern: Some(pattern.to_string()),
            composed_of: None,
            detect_class: None,
            activation: None,
            scoring: None,
            window: None,
        }
    }

    fn message(idx: i64, text: &str) -> Message {
        Message {
            idx,
            ts: ts(),
            text: text.to_string(),
        }
    }

    fn surfaces(pattern: &str, text: &str) -> Vec<String> {
        let defs = [ato("ATO_TEST", pattern)];
        let compiled = compile(&defs.iter().collect::<Vec<_>>()).expect("compile");
        scan_message(&compiled, "demo", &message(1, text))
            .into_iter()
            .map(|event| match event.payload {
                EventPayload::Atomic { text } => text,
                other => panic!("unexpected payload: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn matches_are_case_insensitive() {
        let defs = [ato("ATO_JA_ABER", r"ja,\s*aber")];
        let compiled = compile(&defs.iter().collect::<Vec<_>>()).expect("compile");
        let events = scan_message(&compiled, "demo", &message(1, "Ja, aber ich weiß nicht."));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].marker_id, "ATO_JA_ABER");
        assert_eq!(
            events[0].payload,
            EventPayload::Atomic {
                text: "Ja, aber".to_string()
            }
        );
        assert_eq!(events[0].idx, 1);
    }

    #[test]
    fn same_start_alternation_picks_the_longest_branch() {
        // Leftmost-first alone would stop at "a".
        assert_eq!(surfaces("a|ab", "ab"), vec!["ab".to_string()]);
        assert_eq!(
            surfaces("ja|ja, aber", "ja, aber ich"),
            vec!["ja, aber".to_string()]
        );
    }

    #[test]
    fn longest_match_consumes_the_overlap() {
        // After taking "aba" from position 0, the scan resumes past it.
        assert_eq!(
            surfaces("ab|aba", "abaab"),
            vec!["aba".to_string(), "ab".to_string()]
        );
    }

    #[test]
    fn optional_suffixes_extend_to_the_longest_form() {
        assert_eq!(
            surfaces("vielleicht( doch)?", "vielleicht doch nicht"),
            vec!["vielleicht doch".to_string()]
        );
    }

    #[test]
    fn longest_extension_is_char_boundary_safe() {
        assert_eq!(
            surfaces("wei|weiß", "ich weiß nicht"),
            vec!["weiß".to_string()]
        );
    }

    #[test]
    fn repeats_of_one_marker_get_distinct_timestamps() {
        let defs = [ato("ATO_HEDGE", "vielleicht")];
        let compiled = compile(&defs.iter().collect::<Vec<_>>()).expect("compile");
        let events = scan_message(
            &compiled,
            "demo",
            &message(2, "vielleicht, aber nur vielleicht"),
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].idx, events[1].idx);
        assert_eq!(events[0].ts, ts());
        assert_eq!(events[1].ts, ts() + Duration::milliseconds(1));
    }

    #[test]
    fn different_markers_can_coincide_on_one_message() {
        let defs = [ato("ATO_A", "ja"), ato("ATO_B", "aber")];
        let compiled = compile(&defs.iter().collect::<Vec<_>>()).expect("compile");
        let events = scan_message(&compiled, "demo", &message(1, "ja, aber"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].ts, events[1].ts);
    }

    #[test]
    fn malformed_pattern_signals_the_marker() {
        let defs = [ato("ATO_BROKEN", "(unclosed")];
        let err = compile(&defs.iter().collect::<Vec<_>>()).expect_err("must fail");
        match err {
            EngineError::PatternCompile { marker_id } => assert_eq!(marker_id, "ATO_BROKEN"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
