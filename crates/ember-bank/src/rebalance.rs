//! Levelling of work across per-worker queues.
//!
//! With `average = total / n`, [`rebalance`] leaves every queue holding
//! `average` or `average + 1` items. Each paired transfer moves
//! `min(average - short, long - (average + 1))` items from a queue above
//! `average + 1` to one below `average`, which brings at least one of the
//! two into band. Once only one side is out of band, single-item moves
//! against queues sitting at the opposite edge of the band finish the job.

use ember_core::{fatal, Site};

/// Queues the rebalancer can inspect and move items between.
pub trait Rebalance {
    /// Number of queues.
    fn queue_count(&self) -> usize;
    /// Current length of `queue`.
    fn queue_len(&self, queue: usize) -> usize;
    /// Move `n` items from `from` to `to`; returns how many actually moved.
    fn move_items(&mut self, from: usize, to: usize, n: usize) -> usize;
}

impl Rebalance for Vec<usize> {
    fn queue_count(&self) -> usize {
        self.len()
    }

    fn queue_len(&self, queue: usize) -> usize {
        self[queue]
    }

    fn move_items(&mut self, from: usize, to: usize, n: usize) -> usize {
        let n = n.min(self[from]);
        self[from] -= n;
        self[to] += n;
        n
    }
}

/// Outcome of one [`rebalance`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    /// Number of transfers performed.
    pub transfers: usize,
    /// Items moved in total.
    pub moved: usize,
}

/// Level `queues` so each holds `total / n` or `total / n + 1` items.
pub fn rebalance<R: Rebalance + ?Sized>(queues: &mut R) -> RebalanceReport {
    let n = queues.queue_count();
    let mut report = RebalanceReport::default();
    if n < 2 {
        return report;
    }
    let lens = |q: &R| (0..n).map(|i| q.queue_len(i)).collect::<Vec<_>>();
    let total: usize = lens(&*queues).iter().sum();
    let average = total / n;
    // Paired moves bring a queue into band each time; single moves are
    // bounded by the remainder. 3n covers both.
    let guard = 3 * n + 1;

    loop {
        let sizes = lens(&*queues);
        let short = sizes.iter().position(|&s| s < average);
        let long = sizes.iter().position(|&s| s > average + 1);
        let (from, to, count) = match (short, long) {
            (None, None) => break,
            (Some(s), Some(l)) => (l, s, (average - sizes[s]).min(sizes[l] - (average + 1))),
            (Some(s), None) => match sizes.iter().position(|&x| x == average + 1) {
                Some(l) => (l, s, 1),
                None => fatal!(
                    Site::here("rebalance"),
                    "queue {s} below average {average} with no queue above it"
                ),
            },
            (None, Some(l)) => match sizes.iter().position(|&x| x == average) {
                Some(s) => (l, s, 1),
                None => fatal!(
                    Site::here("rebalance"),
                    "queue {l} above average {average} with no queue at it"
                ),
            },
        };
        let moved = queues.move_items(from, to, count);
        if moved != count {
            fatal!(
                Site::here("rebalance"),
                "moved {moved} of {count} items from queue {from} to {to}"
            );
        }
        report.transfers += 1;
        report.moved += moved;
        tracing::trace!(from, to, moved, "rebalance transfer");
        if report.transfers > guard {
            fatal!(
                Site::here("rebalance"),
                "no convergence after {} transfers over {n} queues",
                report.transfers
            );
        }
    }

    let after: usize = lens(&*queues).iter().sum();
    if after != total {
        fatal!(
            Site::here("rebalance"),
            "item count changed from {total} to {after}"
        );
    }
    if report.transfers > 0 {
        tracing::debug!(
            queues = n,
            total,
            transfers = report.transfers,
            moved = report.moved,
            "queues rebalanced"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_the_worked_example() {
        let mut queues = vec![10, 2, 7, 5];
        let report = rebalance(&mut queues);
        assert_eq!(queues.iter().sum::<usize>(), 24);
        assert!(queues.iter().all(|&q| q == 6 || q == 7));
        assert_eq!(queues, vec![6, 6, 6, 6]);
        assert_eq!(report, RebalanceReport { transfers: 3, moved: 5 });
    }

    #[test]
    fn balanced_input_is_untouched() {
        let mut queues = vec![3, 4, 3, 4];
        assert_eq!(rebalance(&mut queues), RebalanceReport::default());
        assert_eq!(queues, vec![3, 4, 3, 4]);
    }

    #[test]
    fn single_and_empty_sets_are_noops() {
        let mut one = vec![9];
        let mut none: Vec<usize> = Vec::new();
        assert_eq!(rebalance(&mut one).transfers, 0);
        assert_eq!(rebalance(&mut none).transfers, 0);
    }

    #[test]
    fn all_work_on_one_queue() {
        let mut queues = vec![0, 0, 0, 13];
        rebalance(&mut queues);
        assert_eq!(queues.iter().sum::<usize>(), 13);
        assert!(queues.iter().all(|&q| q == 3 || q == 4));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn conserves_and_levels(queues in proptest::collection::vec(0usize..200, 1..32)) {
                let mut q = queues.clone();
                let total: usize = queues.iter().sum();
                let average = total / queues.len();
                let report = rebalance(&mut q);
                prop_assert_eq!(q.iter().sum::<usize>(), total);
                prop_assert!(q.iter().all(|&x| x == average || x == average + 1));
                prop_assert!(report.transfers <= 3 * queues.len());
            }
        }
    }
}
