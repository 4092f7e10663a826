//! Property-based tests for template normalization and lookup.

use proptest::prelude::*;
use tourgate_core::template::{MatchKind, TemplateEntry, TemplateTable, normalize};

// ─────────────────────────────────────────────────────────────────────────────
// Strategies
// ─────────────────────────────────────────────────────────────────────────────

/// Prompts mixing case, Vietnamese letters, whitespace runs and punctuation.
fn arb_prompt() -> impl Strategy<Value = String> {
    "[a-zA-ZàáạảãâầấđêếôơưÀÁĐÊ \t.,!?…]{0,40}"
}

/// A word that survives normalization unchanged.
fn arb_word() -> impl Strategy<Value = String> {
    "[a-zđơư]{2,8}"
}

/// Distinct normalized keys with a response each.
fn arb_table_entries() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_set(
        prop::collection::vec(arb_word(), 1..4).prop_map(|words| words.join(" ")),
        1..8,
    )
    .prop_map(|keys| {
        keys.into_iter()
            .enumerate()
            .map(|(i, key)| (key, format!("response #{i}")))
            .collect()
    })
}

fn build(entries: &[(String, String)]) -> TemplateTable {
    TemplateTable::from_entries(
        entries
            .iter()
            .map(|(prompt, response)| TemplateEntry {
                prompt: prompt.clone(),
                response: response.clone(),
            })
            .collect(),
    )
    .expect("generated keys are non-empty")
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn normalize_is_idempotent(prompt in arb_prompt()) {
        let once = normalize(&prompt);
        prop_assert_eq!(normalize(&once), once);
    }

    #[test]
    fn normalize_ignores_case_and_spacing(words in prop::collection::vec(arb_word(), 1..5)) {
        let plain = words.join(" ");
        let noisy = format!("  {}  ?!", words.join(" \t ").to_uppercase());
        prop_assert_eq!(normalize(&noisy), normalize(&plain));
    }

    #[test]
    fn lookup_is_deterministic(entries in arb_table_entries(), prompt in arb_prompt()) {
        let table = build(&entries);
        let first = table.lookup(&prompt);
        let second = table.lookup(&prompt);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn every_key_matches_itself_exactly(entries in arb_table_entries()) {
        let table = build(&entries);
        for (key, response) in &entries {
            let hit = table.lookup(key);
            prop_assert!(hit.is_some());
            let hit = hit.unwrap();
            prop_assert_eq!(hit.kind, MatchKind::Exact);
            prop_assert_eq!(hit.response, response.as_str());
        }
    }

    #[test]
    fn exact_match_beats_earlier_fuzzy_candidate(short in arb_word(), tail in arb_word()) {
        // The shorter key is scanned first and is contained in the longer one
        let long = format!("{short} {tail}");
        let table = build(&[
            (short.clone(), "short".to_string()),
            (long.clone(), "long".to_string()),
        ]);
        let hit = table.lookup(&long).unwrap();
        prop_assert_eq!(hit.kind, MatchKind::Exact);
        prop_assert_eq!(hit.response, "long");
    }
}
