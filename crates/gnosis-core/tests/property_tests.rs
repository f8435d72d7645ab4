//! # Property-Based Tests
//!
//! Invariants of versioning, traversal, canonical encoding and salience.

use gnosis_core::{
    EntityId, EntityStore, EntityWrite, GnosisCore, ManualClock, MemoryJournal, MemoryType,
    NodeLabel, Payload, Provenance, SystemClock, canonical_json,
};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;

fn generic(content: Value) -> Payload {
    Payload::node(NodeLabel::Generic, content)
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// Every update appends exactly one version that points back at the previous one.
    #[test]
    fn versions_form_a_back_linked_chain(updates in vec(any::<i64>(), 0..20)) {
        let store = EntityStore::in_memory(Arc::new(SystemClock));
        let now = chrono::Utc::now();
        let first = store
            .append(EntityWrite::create(generic(json!(0)), Provenance::new(now)))
            .expect("create");

        for (i, value) in updates.iter().enumerate() {
            let id = store
                .append(EntityWrite::update(
                    first.id,
                    i as u64 + 1,
                    generic(json!(value)),
                    Provenance::new(now),
                ))
                .expect("update");
            prop_assert_eq!(id.version, i as u64 + 2);
        }

        let history = store.history(first.id).expect("history");
        prop_assert_eq!(history.len(), updates.len() + 1);
        let versions: Vec<u64> = history.iter().map(|e| e.version).collect();
        let expected: Vec<u64> = (1..=updates.len() as u64 + 1).rev().collect();
        prop_assert_eq!(versions, expected);
        for entity in history.iter() {
            prop_assert_eq!(entity.prev_version, entity.version.checked_sub(1).filter(|v| *v > 0));
        }
    }

    /// Traversal paths never repeat a node and never exceed the depth bound,
    /// even on graphs with cycles.
    #[test]
    fn traversal_paths_are_simple_and_bounded(
        edges in vec((0usize..8, 0usize..8), 1..40),
        depth in 1usize..6,
    ) {
        let store = EntityStore::in_memory(Arc::new(SystemClock));
        let now = chrono::Utc::now();
        let nodes: Vec<EntityId> = (0..8)
            .map(|i| {
                store
                    .append(EntityWrite::create(generic(json!(i)), Provenance::new(now)))
                    .expect("node")
                    .id
            })
            .collect();
        for (from, to) in &edges {
            store
                .append(EntityWrite::create(
                    Payload::edge(nodes[*from], nodes[*to], "next"),
                    Provenance::new(now),
                ))
                .expect("edge");
        }

        let graph = store.graph();
        for path in graph.traverse(nodes[0], depth, |_| true) {
            prop_assert!(path.len() >= 2);
            prop_assert!(path.len() <= depth + 1);
            prop_assert_eq!(path[0], nodes[0]);
            let unique: BTreeSet<EntityId> = path.iter().copied().collect();
            prop_assert_eq!(unique.len(), path.len());
        }
    }

    /// Canonical JSON does not depend on the order keys were inserted in.
    #[test]
    fn canonical_json_ignores_insertion_order(
        entries in btree_map("[a-z]{1,6}", any::<i32>(), 0..12),
    ) {
        let mut forward = Map::new();
        for (k, v) in &entries {
            forward.insert(k.clone(), json!(v));
        }
        let mut backward = Map::new();
        for (k, v) in entries.iter().rev() {
            backward.insert(k.clone(), json!(v));
        }

        let rendered = canonical_json(&Value::Object(forward));
        prop_assert_eq!(&rendered, &canonical_json(&Value::Object(backward)));
        prop_assert!(!rendered.contains(' '));
    }

    /// Effective salience stays in [0, 1] and never rises while idle.
    #[test]
    fn salience_decays_monotonically(
        rate in 0.0f64..2.0,
        first in 0.0f64..1000.0,
        extra in 0.0f64..1000.0,
    ) {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let core = GnosisCore::open(
            Arc::new(MemoryJournal::new()),
            gnosis_core::GnosisConfig::default(),
            clock.clone(),
            gnosis_core::messaging::generate_signing_key(),
        )
        .expect("core");
        let id = core
            .memory()
            .store_with(gnosis_core::NewMemory::new(MemoryType::Semantic, json!({})).decay_rate(rate))
            .expect("store");

        clock.advance_secs(first);
        let earlier = core.memory().effective_salience(id).expect("salience");
        clock.advance_secs(extra);
        let later = core.memory().effective_salience(id).expect("salience");

        prop_assert!((0.0..=1.0).contains(&earlier));
        prop_assert!(later <= earlier);
        prop_assert!(later >= 0.0);
    }

    /// Qualia feedback always leaves salience inside [0, 1].
    #[test]
    fn qualia_feedback_is_clamped(
        valence in -1.0f64..=1.0,
        intensity in 0.0f64..=1.0,
        rounds in 1usize..6,
    ) {
        let core = GnosisCore::in_memory().expect("core");
        let id = core
            .memory()
            .store(MemoryType::Emotional, json!({"felt": "awe"}), Some(valence))
            .expect("store");
        for _ in 0..rounds {
            let salience = core.memory().apply_qualia(id, valence, intensity).expect("qualia");
            prop_assert!((0.0..=1.0).contains(&salience));
        }
    }
}
