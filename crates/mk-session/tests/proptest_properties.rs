#![forbid(unsafe_code)]

//! Property tests for the merge pipeline: join cardinality, the anti-join
//! partition, key detection determinism, normaliser idempotence and the
//! validator's overlap metric.

use std::collections::HashSet;

use proptest::prelude::*;

use mk_inspect::{detect_key_columns, validate_before_merge};
use mk_join::{
    JoinKind, KeySpec, Side, Suffixes, anti_join, build_summary_stats, join_tables,
};
use mk_table::Table;
use mk_types::{KeyAtom, Scalar};

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

/// Small key domain so matches and duplicates are common.
fn arb_key() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        6 => (0i64..8).prop_map(Scalar::Int64),
        1 => Just(Scalar::null()),
    ]
}

fn arb_keys(max_len: usize) -> impl Strategy<Value = Vec<Scalar>> {
    proptest::collection::vec(arb_key(), 0..=max_len)
}

/// Keyed table with a payload column named `payload`.
fn keyed_table(keys: Vec<Scalar>, payload: &str) -> Table {
    let values = (0..keys.len() as i64).map(Scalar::Int64).collect();
    Table::from_values([("key".to_owned(), keys), (payload.to_owned(), values)])
        .expect("keyed table")
}

fn arb_table_pair(max_len: usize) -> impl Strategy<Value = (Table, Table)> {
    (arb_keys(max_len), arb_keys(max_len))
        .prop_map(|(a, b)| (keyed_table(a, "va"), keyed_table(b, "vb")))
}

/// Text cells with optional padding and blanks.
fn arb_text_cell() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        4 => "[ ]{0,2}[a-c]{0,3}[ ]{0,2}".prop_map(Scalar::Utf8),
        1 => Just(Scalar::null()),
    ]
}

fn arb_text_table(max_len: usize) -> impl Strategy<Value = Table> {
    (
        proptest::collection::vec(arb_text_cell(), max_len),
        proptest::collection::vec(arb_text_cell(), max_len),
    )
        .prop_map(|(a, b)| {
            Table::from_values([("code".to_owned(), a), ("note".to_owned(), b)])
                .expect("text table")
        })
}

fn key_spec(side: Side) -> KeySpec {
    KeySpec::single(side, "key").expect("key spec")
}

fn atoms(table: &Table) -> Vec<Option<KeyAtom<'_>>> {
    table
        .column("key")
        .expect("key column")
        .values()
        .iter()
        .map(KeyAtom::from_scalar)
        .collect()
}

// ---------------------------------------------------------------------------
// Join properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Inner join row count equals the number of equal-key row pairs.
    #[test]
    fn prop_inner_join_counts_matching_pairs((a, b) in arb_table_pair(12)) {
        let out = join_tables(
            &a,
            &b,
            &key_spec(Side::Left),
            &key_spec(Side::Right),
            JoinKind::Inner,
            &Suffixes::default(),
        )
        .expect("inner join");

        let left = atoms(&a);
        let right = atoms(&b);
        let pairs = left
            .iter()
            .flatten()
            .map(|l| right.iter().flatten().filter(|r| *r == l).count())
            .sum::<usize>();
        prop_assert_eq!(out.len(), pairs);
    }

    /// A left join keeps at least every left row.
    #[test]
    fn prop_left_join_never_loses_left_rows((a, b) in arb_table_pair(12)) {
        let out = join_tables(
            &a,
            &b,
            &key_spec(Side::Left),
            &key_spec(Side::Right),
            JoinKind::Left,
            &Suffixes::default(),
        )
        .expect("left join");
        prop_assert!(out.len() >= a.len());
    }

    /// Anti-join rows plus excluded rows partition the query side.
    #[test]
    fn prop_anti_join_partitions_query_side((a, b) in arb_table_pair(12)) {
        let keys_a = key_spec(Side::Left);
        let keys_b = key_spec(Side::Right);
        let kept = anti_join(&a, &b, &keys_a, &keys_b, JoinKind::AntiANotInB)
            .expect("anti join");
        let stats = build_summary_stats(&a, &b, &keys_a, &keys_b, JoinKind::AntiANotInB, &kept)
            .expect("stats");
        prop_assert_eq!(kept.len() + stats.excluded_rows, a.len());

        let right: HashSet<KeyAtom<'_>> = atoms(&b).into_iter().flatten().collect();
        for atom in atoms(&kept) {
            prop_assert!(atom.is_none_or(|atom| !right.contains(&atom)));
        }
    }

    /// Outer join covers every non-null key of both sides.
    #[test]
    fn prop_outer_join_covers_both_key_sets((a, b) in arb_table_pair(12)) {
        let out = join_tables(
            &a,
            &b,
            &key_spec(Side::Left),
            &key_spec(Side::Right),
            JoinKind::Outer,
            &Suffixes::default(),
        )
        .expect("outer join");
        let merged: HashSet<KeyAtom<'_>> = atoms(&out).into_iter().flatten().collect();
        for atom in atoms(&a).into_iter().chain(atoms(&b)).flatten() {
            prop_assert!(merged.contains(&atom));
        }
    }
}

// ---------------------------------------------------------------------------
// Inspection properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Validator overlap equals the size of the distinct key intersection.
    #[test]
    fn prop_validator_overlap_matches_set_intersection((a, b) in arb_table_pair(12)) {
        let report = validate_before_merge(&a, &b, &key_spec(Side::Left), &key_spec(Side::Right))
            .expect("validate");
        prop_assert!(report.errors.is_empty());

        let left: HashSet<KeyAtom<'_>> = atoms(&a).into_iter().flatten().collect();
        let right: HashSet<KeyAtom<'_>> = atoms(&b).into_iter().flatten().collect();
        prop_assert_eq!(report.info.overlap, Some(left.intersection(&right).count()));
    }

    /// Key detection is deterministic.
    #[test]
    fn prop_key_detection_is_deterministic(table in arb_text_table(10)) {
        let first = detect_key_columns(&table).expect("first");
        let second = detect_key_columns(&table).expect("second");
        prop_assert_eq!(first, second);
    }

    /// Normalising twice changes nothing after the first pass.
    #[test]
    fn prop_normalize_is_idempotent(table in arb_text_table(10)) {
        let once = table.normalize(None).expect("once");
        let twice = once.normalize(None).expect("twice");
        prop_assert!(once.semantic_eq(&twice));
    }
}
