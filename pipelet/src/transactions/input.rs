//! Fork joins and per-source transaction tracking on an input.

use crate::core::{Options, StageId};
use crate::transactions::{ForkTag, TransactionId, TransactionMeta};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug)]
struct Join {
    remaining: usize,
    terminated: BTreeSet<StageId>,
    forks: Vec<ForkTag>,
}

/// Joins forked transactions arriving on one input.
///
/// An input tagged with a fork tag expects every transaction carrying that
/// tag to arrive over `branches` distinct paths. Each path ends its share
/// with a terminal step; all but the last are forwarded with `more` set.
#[derive(Debug, Default)]
pub struct InputTransactions {
    tag: Option<ForkTag>,
    branches: usize,
    joins: HashMap<TransactionId, Join>,
    from_sources: BTreeMap<StageId, BTreeMap<TransactionId, Vec<ForkTag>>>,
}

impl InputTransactions {
    /// Creates an untagged registry with no branches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fork tag this input joins on.
    pub fn set_tag(&mut self, tag: Option<ForkTag>) {
        self.tag = tag;
    }

    /// Returns the fork tag this input joins on.
    #[must_use]
    pub fn tag(&self) -> Option<&ForkTag> {
        self.tag.as_ref()
    }

    /// Adjusts the number of concurrent branches feeding this input.
    pub fn add_branches(&mut self, delta: isize) {
        self.branches = self.branches.saturating_add_signed(delta);
        tracing::trace!(branches = self.branches, delta, "input branches adjusted");
    }

    /// Returns the number of concurrent branches feeding this input.
    #[must_use]
    pub const fn branches(&self) -> usize {
        self.branches
    }

    /// Returns true if a join is waiting on more branches for `id`.
    #[must_use]
    pub fn is_joining(&self, id: TransactionId) -> bool {
        self.joins.contains_key(&id)
    }

    /// Returns options for a delivery from `source`.
    ///
    /// Terminal steps of a transaction forked with this input's tag only
    /// terminate once the last branch terminates; the join's own tag is
    /// stripped from what the stage sees.
    pub fn get_options(&mut self, source: Option<StageId>, options: &Options) -> Options {
        let Some(meta) = options.transaction.as_ref() else {
            return options.clone();
        };

        if let Some(source) = source {
            let open = self.from_sources.entry(source).or_default();
            if meta.more {
                open.insert(meta.id, meta.forks.clone());
            } else {
                open.remove(&meta.id);
            }
            if open.is_empty() {
                self.from_sources.remove(&source);
            }
        }

        let Some(tag) = self.tag.as_ref().filter(|tag| meta.forks.contains(tag)) else {
            return options.clone();
        };
        let forks: Vec<ForkTag> = meta.forks.iter().filter(|f| *f != tag).cloned().collect();

        if meta.more {
            return Options::new().with_transaction(TransactionMeta {
                id: meta.id,
                more: true,
                forks,
            });
        }

        let branches = self.branches.max(1);
        let join = self.joins.entry(meta.id).or_insert_with(|| Join {
            remaining: branches,
            terminated: BTreeSet::new(),
            forks: forks.clone(),
        });
        if let Some(source) = source {
            join.terminated.insert(source);
        }
        join.remaining = join.remaining.saturating_sub(1);
        let more = join.remaining > 0;
        if !more {
            self.joins.remove(&meta.id);
        }
        tracing::trace!(transaction = %meta.id, more, "fork branch terminated");

        Options::new().with_transaction(TransactionMeta { id: meta.id, more, forks })
    }

    /// Returns terminal options for every transaction `source` left open.
    ///
    /// This covers partial transactions delivered by the source and joins
    /// still waiting on the source's branch. The caller delivers each as an
    /// empty terminal add through [`InputTransactions::get_options`].
    pub fn remove_source(&mut self, source: StageId) -> Vec<Options> {
        let mut pending: BTreeMap<TransactionId, Vec<ForkTag>> = self.from_sources.remove(&source).unwrap_or_default();

        if let Some(tag) = &self.tag {
            for (id, join) in &self.joins {
                if !join.terminated.contains(&source) && !pending.contains_key(id) {
                    let mut forks = join.forks.clone();
                    forks.push(tag.clone());
                    pending.insert(*id, forks);
                }
            }
        }

        pending
            .into_iter()
            .map(|(id, forks)| Options::new().with_transaction(TransactionMeta { id, more: false, forks }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forked(id: TransactionId, more: bool, tag: &ForkTag) -> Options {
        Options::new().with_transaction(TransactionMeta::new(id, more).with_fork(tag.clone()))
    }

    #[test]
    fn test_untagged_passes_through() {
        let mut inputs = InputTransactions::new();
        let options = Options::new().with_transaction(TransactionMeta::new(TransactionId::generate(), false));
        assert_eq!(inputs.get_options(Some(StageId::new(1)), &options), options);
    }

    #[test]
    fn test_join_waits_for_all_branches() {
        let tag = ForkTag::new("f");
        let mut inputs = InputTransactions::new();
        inputs.set_tag(Some(tag.clone()));
        inputs.add_branches(2);
        let id = TransactionId::generate();

        let first = inputs.get_options(Some(StageId::new(1)), &forked(id, false, &tag));
        assert!(first.more());
        assert!(first.forks().is_empty());
        assert!(inputs.is_joining(id));

        let second = inputs.get_options(Some(StageId::new(2)), &forked(id, false, &tag));
        assert!(second.is_terminal());
        assert!(!inputs.is_joining(id));
    }

    #[test]
    fn test_other_tag_not_joined() {
        let mut inputs = InputTransactions::new();
        inputs.set_tag(Some(ForkTag::new("mine")));
        inputs.add_branches(2);
        let options = forked(TransactionId::generate(), false, &ForkTag::new("other"));

        assert!(inputs.get_options(None, &options).is_terminal());
    }

    #[test]
    fn test_remove_source_closes_partial_transactions() {
        let mut inputs = InputTransactions::new();
        let source = StageId::new(3);
        let id = TransactionId::generate();
        inputs.get_options(Some(source), &Options::new().with_transaction(TransactionMeta::new(id, true)));

        let closing = inputs.remove_source(source);
        assert_eq!(closing.len(), 1);
        assert_eq!(closing[0].transaction_id(), Some(id));
        assert!(closing[0].is_terminal());
    }

    #[test]
    fn test_remove_source_releases_pending_join() {
        let tag = ForkTag::new("f");
        let mut inputs = InputTransactions::new();
        inputs.set_tag(Some(tag.clone()));
        inputs.add_branches(2);
        let id = TransactionId::generate();
        let (s1, s2) = (StageId::new(1), StageId::new(2));

        assert!(inputs.get_options(Some(s1), &forked(id, false, &tag)).more());

        let closing = inputs.remove_source(s2);
        assert_eq!(closing.len(), 1);
        let last = inputs.get_options(Some(s2), &closing[0]);
        assert!(last.is_terminal());
    }

    #[test]
    fn test_branch_count_saturates() {
        let mut inputs = InputTransactions::new();
        inputs.add_branches(1);
        inputs.add_branches(-3);
        assert_eq!(inputs.branches(), 0);
    }
}
