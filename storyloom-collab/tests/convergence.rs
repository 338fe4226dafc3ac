//! Convergence properties of the chapter CRDT under arbitrary concurrent edits
//! and delivery orders.

use proptest::prelude::*;
use storyloom_collab::{Operation, ReplicaId, TextDocument};

#[derive(Debug, Clone)]
enum Edit {
    Insert(usize, char),
    Delete(usize),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (any::<usize>(), prop::char::range('a', 'e')).prop_map(|(at, ch)| Edit::Insert(at, ch)),
        1 => any::<usize>().prop_map(Edit::Delete),
    ]
}

fn run_edits(doc: &mut TextDocument, edits: &[Edit]) -> Vec<Operation> {
    let mut ops = Vec::new();
    for edit in edits {
        let len = doc.len();
        match *edit {
            Edit::Delete(at) if len > 0 => ops.extend(doc.delete(at % len, 1).unwrap()),
            Edit::Insert(at, ch) => ops.extend(doc.insert(at % (len + 1), &ch.to_string()).unwrap()),
            Edit::Insert(..) | Edit::Delete(_) => {}
        }
    }
    ops
}

/// Deterministic Fisher-Yates driven by a proptest-chosen seed.
fn shuffled(mut ops: Vec<Operation>, mut seed: u64) -> Vec<Operation> {
    for i in (1..ops.len()).rev() {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (seed >> 33) as usize % (i + 1);
        ops.swap(i, j);
    }
    ops
}

fn forked(base: &TextDocument, replica: u128) -> TextDocument {
    base.with_replica(ReplicaId::from_u128(replica))
}

proptest! {
    #[test]
    fn replicas_converge_in_any_delivery_order(
        base_text in "[a-z ]{0,12}",
        a_edits in prop::collection::vec(edit_strategy(), 0..20),
        b_edits in prop::collection::vec(edit_strategy(), 0..20),
        c_edits in prop::collection::vec(edit_strategy(), 0..20),
        seed in any::<u64>(),
    ) {
        let base = TextDocument::with_text(ReplicaId::from_u128(100), &base_text).unwrap();
        let mut a = forked(&base, 1);
        let mut b = forked(&base, 2);
        let mut c = forked(&base, 3);

        let a_ops = run_edits(&mut a, &a_edits);
        let b_ops = run_edits(&mut b, &b_edits);
        let c_ops = run_edits(&mut c, &c_edits);

        let mut all: Vec<Operation> = Vec::new();
        all.extend(a_ops.iter().cloned());
        all.extend(b_ops.iter().cloned());
        all.extend(c_ops.iter().cloned());

        for (doc, seed) in [(&mut a, seed), (&mut b, seed.rotate_left(17)), (&mut c, !seed)] {
            let absorbed = doc.absorb(&shuffled(all.clone(), seed));
            prop_assert!(absorbed.unresolved.is_empty());
        }

        prop_assert_eq!(a.text(), b.text());
        prop_assert_eq!(b.text(), c.text());
        prop_assert_eq!(a.vector(), b.vector());
    }

    #[test]
    fn merge_order_does_not_matter(
        a_edits in prop::collection::vec(edit_strategy(), 1..25),
        b_edits in prop::collection::vec(edit_strategy(), 1..25),
    ) {
        let base = TextDocument::with_text(ReplicaId::from_u128(100), "shared").unwrap();
        let mut a = forked(&base, 1);
        let mut b = forked(&base, 2);
        let a_ops = run_edits(&mut a, &a_edits);
        let b_ops = run_edits(&mut b, &b_edits);

        let mut ab = base.with_replica(ReplicaId::from_u128(9));
        ab.absorb(&a_ops);
        ab.absorb(&b_ops);

        let mut ba = base.with_replica(ReplicaId::from_u128(9));
        ba.absorb(&b_ops);
        ba.absorb(&a_ops);

        prop_assert_eq!(ab.text(), ba.text());
    }

    #[test]
    fn redelivery_is_idempotent(
        edits in prop::collection::vec(edit_strategy(), 1..30),
    ) {
        let mut author = TextDocument::new(ReplicaId::from_u128(1));
        let ops = run_edits(&mut author, &edits);

        let mut reader = TextDocument::new(ReplicaId::from_u128(2));
        reader.absorb(&ops);
        let once = reader.text();
        let again = reader.absorb(&ops);

        prop_assert!(again.applied.is_empty());
        prop_assert_eq!(reader.text(), once);
        prop_assert_eq!(reader.text(), author.text());
    }

    #[test]
    fn snapshot_restores_identical_state(
        edits in prop::collection::vec(edit_strategy(), 0..30),
    ) {
        let mut doc = TextDocument::new(ReplicaId::from_u128(1));
        run_edits(&mut doc, &edits);

        let bytes = doc.snapshot().unwrap();
        let restored = TextDocument::from_snapshot(ReplicaId::from_u128(5), &bytes).unwrap();
        prop_assert_eq!(restored.text(), doc.text());
        prop_assert_eq!(restored.vector(), doc.vector());
    }
}

#[test]
fn concurrent_inserts_at_same_point_keep_each_run_contiguous() {
    let base = TextDocument::with_text(ReplicaId::from_u128(100), "Hello").unwrap();
    let mut a = forked(&base, 1);
    let mut b = forked(&base, 2);

    let a_ops = a.insert(5, "!").unwrap();
    let b_ops = b.insert(5, " world").unwrap();
    a.absorb(&b_ops);
    b.absorb(&a_ops);

    // Same origin: the lower replica's run goes first.
    assert_eq!(a.text(), "Hello! world");
    assert_eq!(b.text(), "Hello! world");
}

#[test]
fn concurrent_insert_order_follows_replica_ids() {
    let base = TextDocument::with_text(ReplicaId::from_u128(100), "Hello").unwrap();
    let mut low = forked(&base, 1);
    let mut high = forked(&base, 2);

    let world = low.insert(5, " world").unwrap();
    let bang = high.insert(5, "!").unwrap();
    low.absorb(&bang);
    high.absorb(&world);

    assert_eq!(low.text(), "Hello world!");
    assert_eq!(high.text(), "Hello world!");
}
