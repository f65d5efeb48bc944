//! Activation-rule DSL.
//!
//! ```text
//! rule          := count_rule | distinct_rule | sum_rule
//! count_rule    := "ANY" INT "IN" INT "messages"
//! distinct_rule := "AT_LEAST" INT "DISTINCT" ("ATOs"|"SEMs"|"CLUs") "IN" INT "messages"
//! sum_rule      := "SUM(weight)" CMP NUMBER "WITHIN" (DURATION | INT "messages")
//! CMP           := ">=" | ">"
//! DURATION      := INT ("s"|"m"|"h"|"d")
//! ```
//!
//! A sum rule's horizon unit decides its decay domain: message horizons decay
//! per message, duration horizons per second.

use crate::MarkerClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("invalid activation rule {rule_text:?} at {}..{}: {detail}", .span.0, .span.1)]
pub struct RuleParseError {
    pub rule_text: String,
    /// Byte range of the offending token within `rule_text`.
    pub span: (usize, usize),
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Cmp {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

impl Cmp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cmp::Ge => ">=",
            Cmp::Gt => ">",
        }
    }

    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Cmp::Ge => value >= threshold,
            Cmp::Gt => value > threshold,
        }
    }
}

/// Window extent of a sum rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Messages(u32),
    Seconds(i64),
}

/// A parsed activation rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationRule {
    /// `ANY k IN n messages`: at least `hits` contributing events in the
    /// window.
    Any { hits: u32, window: u32 },
    /// `AT_LEAST k DISTINCT <class>s IN n messages`.
    AtLeastDistinct {
        distinct: u32,
        of: MarkerClass,
        window: u32,
    },
    /// `SUM(weight) CMP t WITHIN horizon`: decayed weighted sum crossing.
    Sum {
        cmp: Cmp,
        threshold: f64,
        horizon: Horizon,
    },
}

impl ActivationRule {
    pub fn parse(text: &str) -> Result<ActivationRule, RuleParseError> {
        Parser::new(text).parse()
    }

    /// Short rule name used in MEMA rationales.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ActivationRule::Any { .. } => "any",
            ActivationRule::AtLeastDistinct { .. } => "at_least_distinct",
            ActivationRule::Sum { .. } => "sum",
        }
    }

    /// Message extent of the rule's window, when it is message-based.
    pub fn window_messages(&self) -> Option<u32> {
        match self {
            ActivationRule::Any { window, .. } => Some(*window),
            ActivationRule::AtLeastDistinct { window, .. } => Some(*window),
            ActivationRule::Sum {
                horizon: Horizon::Messages(window),
                ..
            } => Some(*window),
            ActivationRule::Sum { .. } => None,
        }
    }

    /// The class a `DISTINCT` rule counts over, if it names one.
    pub fn distinct_class(&self) -> Option<MarkerClass> {
        match self {
            ActivationRule::AtLeastDistinct { of, .. } => Some(*of),
            _ => None,
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(usize, usize, &'a str)>,
    cursor: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let mut tokens = Vec::new();
        let mut start = None;
        for (offset, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(begin) = start.take() {
                    tokens.push((begin, offset, &text[begin..offset]));
                }
            } else if start.is_none() {
                start = Some(offset);
            }
        }
        if let Some(begin) = start {
            tokens.push((begin, text.len(), &text[begin..]));
        }
        Self {
            text,
            tokens,
            cursor: 0,
        }
    }

    fn parse(mut self) -> Result<ActivationRule, RuleParseError> {
        let (span, head) = self.next("rule keyword")?;
        let rule = if head.eq_ignore_ascii_case("ANY") {
            let hits = self.int("event count")?;
            self.keyword("IN")?;
            let window = self.int("window size")?;
            self.keyword("messages")?;
            ActivationRule::Any { hits, window }
        } else if head.eq_ignore_ascii_case("AT_LEAST") {
            let distinct = self.int("distinct count")?;
            self.keyword("DISTINCT")?;
            let of = self.distinct_class()?;
            self.keyword("IN")?;
            let window = self.int("window size")?;
            self.keyword("messages")?;
            ActivationRule::AtLeastDistinct {
                distinct,
                of,
                window,
            }
        } else if head.eq_ignore_ascii_case("SUM(weight)") {
            let cmp = self.cmp()?;
            let threshold = self.number("threshold")?;
            self.keyword("WITHIN")?;
            let horizon = self.horizon()?;
            ActivationRule::Sum {
                cmp,
                threshold,
                horizon,
            }
        } else {
            return Err(self.error(span, format!("expected ANY, AT_LEAST or SUM(weight), found {head:?}")));
        };

        if let Some(&(start, end, extra)) = self.tokens.get(self.cursor) {
            return Err(self.error((start, end), format!("unexpected trailing token {extra:?}")));
        }
        Ok(rule)
    }

    fn next(&mut self, what: &str) -> Result<((usize, usize), &'a str), RuleParseError> {
        match self.tokens.get(self.cursor) {
            Some(&(start, end, token)) => {
                self.cursor += 1;
                Ok(((start, end), token))
            }
            None => {
                let end = self.text.len();
                Err(self.error((end, end), format!("expected {what}, found end of rule")))
            }
        }
    }

    fn keyword(&mut self, expected: &str) -> Result<(), RuleParseError> {
        let (span, token) = self.next(expected)?;
        if token.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(self.error(span, format!("expected {expected:?}, found {token:?}")))
        }
    }

    fn int(&mut self, what: &str) -> Result<u32, RuleParseError> {
        let (span, token) = self.next(what)?;
        match token.parse::<u32>() {
            Ok(value) if value > 0 => Ok(value),
            Ok(_) => Err(self.error(span, format!("{what} must be positive"))),
            Err(_) => Err(self.error(span, format!("expected integer {what}, found {token:?}"))),
        }
    }

    fn number(&mut self, what: &str) -> Result<f64, RuleParseError> {
        let (span, token) = self.next(what)?;
        match token.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(self.error(span, format!("expected number {what}, found {token:?}"))),
        }
    }

    fn cmp(&mut self) -> Result<Cmp, RuleParseError> {
        let (span, token) = self.next("comparator")?;
        match token {
            ">=" => Ok(Cmp::Ge),
            ">" => Ok(Cmp::Gt),
            other => Err(self.error(span, format!("expected >= or >, found {other:?}"))),
        }
    }

    fn distinct_class(&mut self) -> Result<MarkerClass, RuleParseError> {
        let (span, token) = self.next("marker class")?;
        if token.eq_ignore_ascii_case("ATOs") {
            Ok(MarkerClass::Atomic)
        } else if token.eq_ignore_ascii_case("SEMs") {
            Ok(MarkerClass::Semantic)
        } else if token.eq_ignore_ascii_case("CLUs") {
            Ok(MarkerClass::Cluster)
        } else {
            Err(self.error(span, format!("expected ATOs, SEMs or CLUs, found {token:?}")))
        }
    }

    fn horizon(&mut self) -> Result<Horizon, RuleParseError> {
        let (span, token) = self.next("window horizon")?;
        if token.chars().all(|ch| ch.is_ascii_digit()) {
            let count = token.parse::<u32>().map_err(|_| {
                self.error(span, format!("expected integer horizon, found {token:?}"))
            })?;
            if count == 0 {
                return Err(self.error(span, "window horizon must be positive".to_string()));
            }
            self.keyword("messages")?;
            return Ok(Horizon::Messages(count));
        }

        let unit_start = token
            .char_indices()
            .last()
            .map(|(offset, _)| offset)
            .unwrap_or_default();
        let (digits, unit) = token.split_at(unit_start);
        let value = digits.parse::<i64>().ok().filter(|value| *value > 0);
        let seconds = match (value, unit) {
            (Some(value), "s") => value,
            (Some(value), "m") => value * 60,
            (Some(value), "h") => value * 3_600,
            (Some(value), "d") => value * 86_400,
            _ => {
                return Err(self.error(
                    span,
                    format!("expected duration like 30s/5m/2h/1d or INT messages, found {token:?}"),
                ))
            }
        };
        Ok(Horizon::Seconds(seconds))
    }

    fn error(&self, span: (usize, usize), detail: String) -> RuleParseError {
        RuleParseError {
            rule_text: self.text.to_string(),
            span,
            detail,
        }
    }
}
