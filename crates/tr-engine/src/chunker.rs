//! Deterministic message and chunk decomposition.
//!
//! A message is one logical utterance. A new message starts at a speaker
//! prefix line (`Name: …`) or after one or more blank lines; the prefix is a
//! separator and never part of the message text. Continuation lines join
//! with a single space. Chunks are character windows over a message with a
//! fixed overlap; they bound streaming granularity and never change match
//! results.

use chrono::{DateTime, Duration, Utc};
use std::str::Lines;

/// One message of a conversation. `idx` is 1-based; `ts` is synthesized as
/// `base_ts + idx` seconds unless the caller supplies real timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub idx: i64,
    pub ts: DateTime<Utc>,
    pub text: String,
}

/// Lazy, finite message sequence over a borrowed transcript. Restart by
/// constructing a new stream over the same input.
pub struct MessageStream<'a> {
    lines: Lines<'a>,
    base_ts: DateTime<Utc>,
    next_idx: i64,
    pending: Option<String>,
    done: bool,
}

impl<'a> MessageStream<'a> {
    pub fn new(text: &'a str, base_ts: DateTime<Utc>) -> Self {
        Self {
            lines: text.lines(),
            base_ts,
            next_idx: 1,
            pending: None,
            done: false,
        }
    }

    fn emit(&mut self, text: String) -> Message {
        let idx = self.next_idx;
        self.next_idx += 1;
        Message {
            idx,
            ts: self.base_ts + Duration::seconds(idx),
            text,
        }
    }

    fn flush(&mut self) -> Option<String> {
        self.pending
            .take()
            .filter(|text| !text.trim().is_empty())
    }

    fn append(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        match &mut self.pending {
            Some(text) if !text.is_empty() => {
                text.push(' ');
                text.push_str(fragment);
            }
            Some(text) => text.push_str(fragment),
            None => self.pending = Some(fragment.to_string()),
        }
    }
}

impl Iterator for MessageStream<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.done {
            return None;
        }
        loop {
            let Some(line) = self.lines.next() else {
                self.done = true;
                return self.flush().map(|text| self.emit(text));
            };

            if line.trim().is_empty() {
                if let Some(text) = self.flush() {
                    return Some(self.emit(text));
                }
            } else if let Some(rest) = strip_speaker_prefix(line) {
                let finished = self.flush();
                self.pending = Some(String::new());
                self.append(rest);
                if let Some(text) = finished {
                    return Some(self.emit(text));
                }
            } else {
                if self.pending.is_none() {
                    self.pending = Some(String::new());
                }
                self.append(line);
            }
        }
    }
}

/// Strip a `Name:` speaker label; returns the remainder of the line when the
/// label qualifies. Labels are short (at most two words, no digits), start
/// with a letter, and contain only name-like characters, which keeps clock
/// times and running prose ahead of a colon inside the message.
fn strip_speaker_prefix(line: &str) -> Option<&str> {
    let (head, rest) = line.split_once(':')?;
    let head = head.trim();
    if head.is_empty() || head.chars().count() > 24 {
        return None;
    }
    if !head.chars().next()?.is_alphabetic() {
        return None;
    }
    if head.split_whitespace().count() > 2 {
        return None;
    }
    if head
        .chars()
        .all(|ch| ch.is_alphabetic() || matches!(ch, ' ' | '.' | '\'' | '-' | '_'))
    {
        Some(rest.trim_start())
    } else {
        None
    }
}

/// A character window over one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: usize,
    pub text: String,
}

/// Split a message into `chunksize`-character windows carrying `overlap`
/// characters forward. Always yields at least one chunk for non-empty text.
pub fn chunk_message(text: &str, chunksize: u32, overlap: u32) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let size = (chunksize as usize).max(1);
    let step = size.saturating_sub(overlap as usize).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        chunks.push(Chunk {
            seq: chunks.len(),
            text: chars[start..end].iter().collect(),
        });
        if end == chars.len() {
            return chunks;
        }
        start += step;
    }
}

/// Number of chunks `chunk_message` would produce, without materializing
/// them.
pub fn chunk_count(text: &str, chunksize: u32, overlap: u32) -> usize {
    let len = text.chars().count();
    if len == 0 {
        return 0;
    }
    let size = (chunksize as usize).max(1);
    if len <= size {
        return 1;
    }
    let step = size.saturating_sub(overlap as usize).max(1);
    1 + (len - size).div_ceil(step)
}
