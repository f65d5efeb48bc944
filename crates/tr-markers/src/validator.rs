//! Strict catalog validation.
//!
//! Violations accumulate: the full catalog is checked and every failure is
//! returned, never just the first. Strict mode enforces the frame and
//! examples rules on top of the structural ones; both modes enforce
//! everything else.

use crate::ParsedMarker;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tr_core::{ActivationRule, MarkerClass, MarkerDefinition};

pub const MIN_EXAMPLES: usize = 5;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{marker_id} ({source_path}): {rule}: {detail}")]
pub struct ValidationError {
    pub marker_id: String,
    pub source_path: String,
    pub rule: String,
    pub detail: String,
}

/// Validate a parsed marker set against the registered detector names.
pub fn validate(
    set: &BTreeMap<String, ParsedMarker>,
    detectors: &BTreeSet<String>,
    strict: bool,
) -> Vec<ValidationError> {
    let mut violations = Vec::new();
    for marker in set.values() {
        check_marker(marker, set, detectors, strict, &mut violations);
    }
    violations
}

fn check_marker(
    marker: &ParsedMarker,
    set: &BTreeMap<String, ParsedMarker>,
    detectors: &BTreeSet<String>,
    strict: bool,
    violations: &mut Vec<ValidationError>,
) {
    let def = &marker.def;
    let mut push = |rule: &str, detail: String| {
        violations.push(ValidationError {
            marker_id: def.id.clone(),
            source_path: marker.source_path.clone(),
            rule: rule.to_string(),
            detail,
        });
    };

    // 1. Id prefix and shape.
    if !def.id.starts_with(def.class.id_prefix()) {
        push(
            "id prefix",
            format!(
                "id must start with {} for class {}",
                def.class.id_prefix(),
                def.class
            ),
        );
    }
    if !def
        .id
        .chars()
        .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_')
    {
        push(
            "id prefix",
            "id must be uppercase letters, digits and underscores".to_string(),
        );
    }

    // 2. Frame completeness (strict).
    if strict {
        match &def.frame {
            None => push("frame", "frame block is missing".to_string()),
            Some(frame) => {
                let missing = frame.missing_keys();
                if !missing.is_empty() {
                    push("frame", format!("empty frame keys: {}", missing.join(", ")));
                }
            }
        }
    }

    // 3. Examples cardinality (strict).
    if strict {
        if def.examples.len() < MIN_EXAMPLES {
            push(
                "examples",
                format!(
                    "requires at least {MIN_EXAMPLES} examples, found {}",
                    def.examples.len()
                ),
            );
        }
        if def.examples.iter().any(|example| example.trim().is_empty()) {
            push("examples", "examples must be non-empty".to_string());
        }
    }

    // 4. Exactly one structure block, admissible for the class.
    let blocks = def.structure_block_count();
    if blocks != 1 {
        push(
            "structure",
            format!("expected exactly one of pattern/composed_of/detect_class, found {blocks}"),
        );
    }
    match def.class {
        MarkerClass::Atomic => {
            if def.pattern.is_none() && blocks == 1 {
                push("structure", "ATO markers require a pattern block".to_string());
            }
            if def.activation.is_some() {
                push(
                    "activation rule",
                    "ATO markers take no activation rule".to_string(),
                );
            }
        }
        _ => {
            if def.pattern.is_some() {
                push(
                    "structure",
                    format!("{} markers cannot carry a pattern block", def.class),
                );
            }
        }
    }
    if def.class != MarkerClass::Meta && def.window.is_some() {
        push(
            "structure",
            format!("window is only valid for MEMA markers, not {}", def.class),
        );
    }
    if def.class == MarkerClass::Meta && def.detect_class.is_some() && def.activation.is_some() {
        push(
            "structure",
            "activation.rule and detect_class are mutually exclusive".to_string(),
        );
    }

    // 5-7. Composition per class.
    if let Some(composed) = &def.composed_of {
        check_composition(def, composed, set, &mut push);
    }

    // 8. Detector membership.
    if let Some(detector) = &def.detect_class {
        if !detectors.contains(detector) {
            push(
                "detector",
                format!(
                    "unknown detector {detector:?}; registered: {}",
                    detectors
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            );
        }
    }

    // 9. Activation rule parses and fits the class.
    if let Some(rule_text) = def.activation_rule() {
        match ActivationRule::parse(rule_text) {
            Ok(rule) => check_rule_admissibility(def, &rule, &mut push),
            Err(err) => push("activation rule", err.to_string()),
        }
    }

    // 10. Scoring bounds.
    if let Some(scoring) = &def.scoring {
        if !(0.0..=1.0).contains(&scoring.decay) {
            push("scoring", format!("decay must be within [0, 1], found {}", scoring.decay));
        }
        if !(scoring.weight >= 0.0) {
            push("scoring", format!("weight must be >= 0, found {}", scoring.weight));
        }
        if !scoring.base.is_finite() {
            push("scoring", format!("base must be finite, found {}", scoring.base));
        }
    }
}

fn check_composition(
    def: &MarkerDefinition,
    composed: &[String],
    set: &BTreeMap<String, ParsedMarker>,
    push: &mut impl FnMut(&str, String),
) {
    let (rule, expected) = match def.class {
        MarkerClass::Atomic => {
            push(
                "structure",
                "ATO markers cannot compose other markers".to_string(),
            );
            return;
        }
        MarkerClass::Semantic => ("SEM composition", MarkerClass::Atomic),
        MarkerClass::Cluster => ("CLU composition", MarkerClass::Semantic),
        MarkerClass::Meta => ("MEMA composition", MarkerClass::Cluster),
    };

    let distinct: BTreeSet<&str> = composed.iter().map(String::as_str).collect();
    if def.class == MarkerClass::Semantic && distinct.len() < 2 {
        push(rule, "requires >=2 distinct ATOs".to_string());
    }
    if composed.is_empty() {
        push(rule, "composed_of must not be empty".to_string());
    }
    if distinct.len() < composed.len() {
        push(rule, "composed_of entries must be distinct".to_string());
    }

    for id in &distinct {
        if !id.starts_with(expected.id_prefix()) {
            push(
                rule,
                format!("{id} must carry the {} prefix", expected.id_prefix()),
            );
            continue;
        }
        match set.get(*id) {
            None => push(rule, format!("{id} does not resolve to a loaded marker")),
            Some(target) if target.def.class != expected => push(
                rule,
                format!("{id} resolves to class {}, expected {expected}", target.def.class),
            ),
            Some(_) => {}
        }
    }
}

fn check_rule_admissibility(
    def: &MarkerDefinition,
    rule: &ActivationRule,
    push: &mut impl FnMut(&str, String),
) {
    if def.class == MarkerClass::Semantic && matches!(rule, ActivationRule::Sum { .. }) {
        push(
            "activation rule",
            "SUM rules are not valid for SEM markers".to_string(),
        );
    }
    if let Some(of) = rule.distinct_class() {
        if Some(of) != def.class.composes() {
            push(
                "activation rule",
                format!(
                    "DISTINCT rules on {} markers must count {}s",
                    def.class,
                    def.class
                        .composes()
                        .map(|class| class.id_prefix().trim_end_matches('_'))
                        .unwrap_or("nothing")
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{detectors, write_marker};
    use crate::{parse_tree, validate_tree};
    use tempfile::TempDir;

    fn rules_for<'a>(violations: &'a [ValidationError], id: &str) -> Vec<&'a str> {
        violations
            .iter()
            .filter(|violation| violation.marker_id == id)
            .map(|violation| violation.rule.as_str())
            .collect()
    }

    #[test]
    fn wrong_prefix_for_directory_is_flagged() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "semantic", "ATO_MISPLACED", "pattern: \"x\"\n");

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        let rules = rules_for(&violations, "ATO_MISPLACED");
        assert!(rules.contains(&"id prefix"));
        assert!(rules.contains(&"structure"));
    }

    #[test]
    fn lowercase_id_is_flagged() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_bad", "pattern: \"x\"\n");

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        assert!(rules_for(&violations, "ATO_bad").contains(&"id prefix"));
    }

    #[test]
    fn lenient_mode_skips_frame_and_examples_only() {
        let dir = TempDir::new().expect("tempdir");
        let atomic = dir.path().join("atomic");
        std::fs::create_dir_all(&atomic).expect("mkdir");
        std::fs::write(atomic.join("ATO_BARE.yml"), "id: ATO_BARE\npattern: \"x\"\n")
            .expect("write");

        let (parsed, _) = parse_tree(dir.path());
        let strict = validate(&parsed, &detectors(), true);
        let strict_rules = rules_for(&strict, "ATO_BARE");
        assert!(strict_rules.contains(&"frame"));
        assert!(strict_rules.contains(&"examples"));

        let lenient = validate(&parsed, &detectors(), false);
        assert!(lenient.is_empty());
    }

    #[test]
    fn multiple_structure_blocks_are_flagged() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_BOTH",
            "composed_of: [ATO_A, ATO_B]\ndetect_class: recurring_cluster\n",
        );
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        assert!(rules_for(&violations, "SEM_BOTH").contains(&"structure"));
    }

    #[test]
    fn sem_composition_must_resolve_to_loaded_atos() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_DANGLING",
            "composed_of: [ATO_A, ATO_MISSING]\n",
        );
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        let dangling = violations
            .iter()
            .find(|violation| violation.marker_id == "SEM_DANGLING")
            .expect("violation");
        assert_eq!(dangling.rule, "SEM composition");
        assert!(dangling.detail.contains("ATO_MISSING"));
    }

    #[test]
    fn clu_composition_requires_sem_prefix() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_X",
            "composed_of: [ATO_A, ATO_B]\n",
        );
        write_marker(
            dir.path(),
            "cluster",
            "CLU_SKIPS_A_LEVEL",
            "composed_of: [ATO_A, SEM_X]\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        let violation = violations
            .iter()
            .find(|violation| violation.marker_id == "CLU_SKIPS_A_LEVEL")
            .expect("violation");
        assert_eq!(violation.rule, "CLU composition");
        assert!(violation.detail.contains("ATO_A"));
    }

    #[test]
    fn window_is_rejected_outside_mema_markers() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_WINDOWED",
            "composed_of: [ATO_A, ATO_B]\nwindow: 5\n",
        );
        write_marker(
            dir.path(),
            "meta",
            "MEMA_WINDOWED",
            "detect_class: recurring_cluster\nwindow: 5\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        let sem_rules = rules_for(&violations, "SEM_WINDOWED");
        assert!(sem_rules.contains(&"structure"));
        assert!(rules_for(&violations, "MEMA_WINDOWED").is_empty());
    }

    #[test]
    fn mema_detector_and_rule_are_mutually_exclusive() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(
            dir.path(),
            "meta",
            "MEMA_CONFUSED",
            "detect_class: recurring_cluster\nactivation:\n  rule: \"ANY 3 IN 30 messages\"\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        let violation = violations
            .iter()
            .find(|violation| violation.marker_id == "MEMA_CONFUSED")
            .expect("violation");
        assert!(violation.detail.contains("mutually exclusive"));
    }

    #[test]
    fn unknown_detector_is_flagged() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(
            dir.path(),
            "meta",
            "MEMA_NOVEL",
            "detect_class: does_not_exist\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        assert!(rules_for(&violations, "MEMA_NOVEL").contains(&"detector"));
    }

    #[test]
    fn malformed_rule_text_surfaces_the_span() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_BAD_RULE",
            "composed_of: [ATO_A, ATO_B]\nactivation:\n  rule: \"ANY two IN 3 messages\"\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        let violation = violations
            .iter()
            .find(|violation| violation.marker_id == "SEM_BAD_RULE")
            .expect("violation");
        assert_eq!(violation.rule, "activation rule");
        assert!(violation.detail.contains("two"));
    }

    #[test]
    fn sum_rules_are_rejected_on_sem_markers() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_SUMS",
            "composed_of: [ATO_A, ATO_B]\nactivation:\n  rule: \"SUM(weight) >= 2.0 WITHIN 5 messages\"\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        assert!(rules_for(&violations, "SEM_SUMS").contains(&"activation rule"));
    }

    #[test]
    fn distinct_rule_class_must_match_the_level_below() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_X",
            "composed_of: [ATO_A, ATO_B]\n",
        );
        write_marker(
            dir.path(),
            "cluster",
            "CLU_WRONG_LEVEL",
            "composed_of: [SEM_X]\nactivation:\n  rule: \"AT_LEAST 2 DISTINCT CLUs IN 10 messages\"\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        assert!(rules_for(&violations, "CLU_WRONG_LEVEL").contains(&"activation rule"));
    }

    #[test]
    fn scoring_bounds_are_enforced() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_X",
            "composed_of: [ATO_A, ATO_B]\n",
        );
        write_marker(
            dir.path(),
            "cluster",
            "CLU_BAD_SCORING",
            "composed_of: [SEM_X]\nscoring:\n  base: 0.0\n  weight: -1.0\n  decay: 1.5\n  formula: linear\n",
        );

        let (parsed, _) = parse_tree(dir.path());
        let violations = validate(&parsed, &detectors(), true);
        let rules = rules_for(&violations, "CLU_BAD_SCORING");
        assert_eq!(rules.iter().filter(|rule| **rule == "scoring").count(), 2);
    }

    #[test]
    fn validation_is_monotone_under_additions_and_removals() {
        let dir = TempDir::new().expect("tempdir");
        write_marker(dir.path(), "atomic", "ATO_A", "pattern: \"a\"\n");
        write_marker(dir.path(), "atomic", "ATO_B", "pattern: \"b\"\n");
        write_marker(
            dir.path(),
            "semantic",
            "SEM_X",
            "composed_of: [ATO_A, ATO_B]\n",
        );
        assert!(validate_tree(dir.path(), &detectors(), true).ok());

        // Adding a valid marker keeps the set valid.
        write_marker(dir.path(), "atomic", "ATO_C", "pattern: \"c\"\n");
        assert!(validate_tree(dir.path(), &detectors(), true).ok());

        // Removing a referenced ATO invalidates exactly the referrer.
        std::fs::remove_file(dir.path().join("atomic/ATO_B.yml")).expect("remove");
        let report = validate_tree(dir.path(), &detectors(), true);
        assert!(!report.ok());
        assert!(report
            .violations
            .iter()
            .all(|violation| violation.marker_id == "SEM_X"));
    }
}
