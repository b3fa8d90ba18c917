//! Per-item claim arbitration.
//!
//! Every function here takes `&mut WorkBatch`, and the only live batch is
//! reachable through the `SharedState` guard, so each check-and-set runs
//! inside one critical section.

use std::time::Duration;

use tracing::{debug, error};

use crate::types::{ItemIndex, ItemLabel, Offset, WorkBatch, WorkerId};

/// Item handed to a worker by a successful claim.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClaimedItem {
    pub index: ItemIndex,
    pub offset: Offset,
}

/// Atomically move `item` from `Unclaimed` to `Claimed` by `worker`.
///
/// Returns false, with no side effect, if the item is out of range or any
/// label other than `Unclaimed` is present.
pub fn try_claim(batch: &mut WorkBatch, item: ItemIndex, worker: WorkerId) -> bool {
    if batch.retired {
        return false;
    }
    let Some(slot) = batch.items.get_mut(item) else {
        return false;
    };
    if !slot.label.can_advance_to(ItemLabel::Claimed) {
        return false;
    }
    slot.label = ItemLabel::Claimed;
    slot.claimant = Some(worker);
    debug!(batch = batch.seq, item, worker, "item claimed");
    true
}

/// Nearest unclaimed item to the reach origin; ties go to the lowest index.
///
/// Returns the item's position in `batch.items`, which is what `try_claim`
/// looks up.
pub fn nearest_unclaimed(batch: &WorkBatch) -> Option<ItemIndex> {
    let mut best: Option<(ItemIndex, f64)> = None;
    for (position, item) in batch.items.iter().enumerate() {
        if item.label != ItemLabel::Unclaimed {
            continue;
        }
        let distance = item.offset.norm();
        match best {
            // Strict comparison keeps the earlier index on ties.
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((position, distance)),
        }
    }
    best.map(|(index, _)| index)
}

/// Select the nearest unclaimed item and claim it in the same step.
pub fn claim_nearest(batch: &mut WorkBatch, worker: WorkerId) -> Option<ClaimedItem> {
    let index = nearest_unclaimed(batch)?;
    if !try_claim(batch, index, worker) {
        return None;
    }
    Some(ClaimedItem {
        index,
        offset: batch.items[index].offset,
    })
}

/// Move a claimed item to `Completed`. Only the claimant may complete it.
pub fn complete(
    batch: &mut WorkBatch,
    item: ItemIndex,
    worker: WorkerId,
    elapsed: Duration,
) -> bool {
    if batch.retired {
        return false;
    }
    let seq = batch.seq;
    let Some(slot) = batch.items.get_mut(item) else {
        return false;
    };
    if !slot.label.can_advance_to(ItemLabel::Completed) {
        return false;
    }
    match slot.claimant {
        Some(owner) if owner == worker => {
            slot.label = ItemLabel::Completed;
            slot.completed_at = Some(elapsed);
            batch.completed += 1;
            if batch.completed == batch.items.len() {
                batch.all_completed = true;
            }
            true
        }
        owner => {
            if !cfg!(debug_assertions) {
                error!(batch = seq, item, worker, ?owner, "completion by non-owner");
            }
            debug_assert!(
                false,
                "completion by non-owner: batch={seq} item={item} worker={worker}"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    fn batch_of(offsets: &[(f64, f64)]) -> WorkBatch {
        let offsets = offsets.iter().map(|&(x, y)| Offset::new(x, y)).collect();
        WorkBatch::new(1, offsets).expect("batch")
    }

    #[test]
    fn second_claim_on_same_item_fails() {
        let mut batch = batch_of(&[(1.0, 0.0)]);
        assert!(try_claim(&mut batch, 0, 4));
        assert!(!try_claim(&mut batch, 0, 5));
        assert_eq!(batch.items[0].claimant, Some(4));
    }

    #[test]
    fn claim_out_of_range_is_rejected() {
        let mut batch = batch_of(&[(1.0, 0.0)]);
        assert!(!try_claim(&mut batch, 3, 0));
    }

    #[test]
    fn nearest_prefers_lowest_index_on_ties() {
        let batch = batch_of(&[(5.0, 0.0), (0.0, 3.0), (3.0, 0.0), (-3.0, 0.0)]);
        assert_eq!(nearest_unclaimed(&batch), Some(1));
    }

    #[test]
    fn nearest_uses_position_not_stored_index() {
        let mut batch = batch_of(&[(3.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        for item in &mut batch.items {
            item.index = 1;
        }
        let order: Vec<_> = (0..3)
            .map(|_| claim_nearest(&mut batch, 0).expect("item left").index)
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn claim_nearest_walks_outward() {
        let mut batch = batch_of(&[(4.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        let order: Vec<_> = (0..3)
            .map(|_| claim_nearest(&mut batch, 0).expect("item left").index)
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(claim_nearest(&mut batch, 0).is_none());
    }

    #[test]
    fn completion_counts_once() {
        let mut batch = batch_of(&[(1.0, 0.0), (2.0, 0.0)]);
        assert!(try_claim(&mut batch, 0, 1));
        assert!(complete(&mut batch, 0, 1, Duration::from_millis(3)));
        assert!(!complete(&mut batch, 0, 1, Duration::from_millis(4)));
        assert_eq!(batch.completed, 1);
        assert_eq!(batch.items[0].completed_at, Some(Duration::from_millis(3)));
        assert!(!batch.all_completed);
    }

    #[test]
    fn retired_batch_accepts_nothing() {
        let mut batch = batch_of(&[(1.0, 0.0), (2.0, 0.0)]);
        assert!(try_claim(&mut batch, 0, 1));
        batch.retired = true;
        assert!(!try_claim(&mut batch, 1, 1));
        assert!(!complete(&mut batch, 0, 1, Duration::ZERO));
        assert_eq!(batch.completed, 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "completion by non-owner")]
    fn completion_by_non_owner_panics_in_debug() {
        let mut batch = batch_of(&[(1.0, 0.0)]);
        assert!(try_claim(&mut batch, 0, 1));
        let _ = complete(&mut batch, 0, 2, Duration::ZERO);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn completion_by_non_owner_fails_and_keeps_claim() {
        let mut batch = batch_of(&[(1.0, 0.0)]);
        assert!(try_claim(&mut batch, 0, 1));
        assert!(!complete(&mut batch, 0, 2, Duration::ZERO));
        assert_eq!(batch.items[0].label, ItemLabel::Claimed);
        assert!(complete(&mut batch, 0, 1, Duration::ZERO));
    }

    #[test]
    fn racing_claims_have_single_winner_per_item() {
        let items = 40;
        let contenders = 8;
        let offsets = (0..items).map(|i| (i as f64, 0.0)).collect::<Vec<_>>();
        let batch = Arc::new(Mutex::new(batch_of(&offsets)));
        let barrier = Arc::new(Barrier::new(contenders));
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for worker in 0..contenders {
            let batch = Arc::clone(&batch);
            let barrier = Arc::clone(&barrier);
            let wins = Arc::clone(&wins);
            handles.push(thread::spawn(move || {
                barrier.wait();
                // Every contender tries every item.
                for item in 0..items {
                    let mut guard = batch.lock().expect("batch mutex poisoned");
                    if try_claim(&mut guard, item, worker) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("claim thread panicked");
        }

        assert_eq!(wins.load(Ordering::SeqCst), items);
        let guard = batch.lock().expect("batch mutex poisoned");
        assert!(guard.items.iter().all(|item| item.claimant.is_some()));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Claim { item: usize, worker: usize },
        CompleteByOwner { item: usize },
    }

    fn op_strategy(items: usize) -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..items, 0..6usize).prop_map(|(item, worker)| Op::Claim { item, worker }),
            (0..items).prop_map(|item| Op::CompleteByOwner { item }),
        ]
    }

    proptest! {
        #[test]
        fn labels_follow_forward_prefix(ops in prop::collection::vec(op_strategy(6), 0..60)) {
            let mut batch = batch_of(&[(1.0, 0.0); 6]);
            let mut history: HashMap<usize, Vec<ItemLabel>> =
                (0..6).map(|i| (i, vec![ItemLabel::Unclaimed])).collect();
            let mut claims_won = 0usize;

            for op in ops {
                match op {
                    Op::Claim { item, worker } => {
                        if try_claim(&mut batch, item, worker) {
                            claims_won += 1;
                        }
                    }
                    Op::CompleteByOwner { item } => {
                        if let Some(owner) = batch.items[item].claimant {
                            let _ = complete(&mut batch, item, owner, Duration::ZERO);
                        }
                    }
                }
                for slot in &batch.items {
                    let seen = history.get_mut(&slot.index).expect("tracked item");
                    if seen.last() != Some(&slot.label) {
                        seen.push(slot.label);
                    }
                }
            }

            let forward = [ItemLabel::Unclaimed, ItemLabel::Claimed, ItemLabel::Completed];
            for seen in history.values() {
                prop_assert!(seen.len() <= forward.len());
                prop_assert_eq!(&seen[..], &forward[..seen.len()]);
            }
            let claimed = batch
                .items
                .iter()
                .filter(|item| item.label != ItemLabel::Unclaimed)
                .count();
            prop_assert_eq!(claims_won, claimed);
            prop_assert_eq!(batch.completed + batch.missed(), batch.len());
        }
    }
}
