use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::time::Duration;

use tokio::time::Instant;

use qkv_proto::v1::{SetCondition, TreeEntry};
use qkv_types::{Expire, KvError, TransactionIndex, Version};

use crate::tree::{self, Item};

/// Finished transactions remembered so that late calls get `Completed` or
/// `Interrupted` instead of `NotFound`. Older ones are forgotten.
pub(crate) const FINISHED_RETAINED: usize = 1024;

/// Storage slot. Plain keys and tree entries share one ordered map so that a
/// transaction can stage writes to both uniformly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Slot {
    Kv(Vec<u8>),
    Tree { tree: Vec<u8>, key: Vec<u8> },
}

impl Slot {
    fn key(&self) -> &[u8] {
        match self {
            Slot::Kv(key) | Slot::Tree { key, .. } => key,
        }
    }
}

/// Slot bounds covering the keys of `tree` within the given key bounds.
fn tree_bounds(tree: &[u8], lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> (Bound<Slot>, Bound<Slot>) {
    let slot = |key: &[u8]| Slot::Tree { tree: tree.to_vec(), key: key.to_vec() };
    let lower = match lower {
        Bound::Included(key) => Bound::Included(slot(key)),
        Bound::Excluded(key) => Bound::Excluded(slot(key)),
        Bound::Unbounded => Bound::Included(slot(&[])),
    };
    let upper = match upper {
        Bound::Included(key) => Bound::Included(slot(key)),
        Bound::Excluded(key) => Bound::Excluded(slot(key)),
        // Every slot of `tree` sorts below the first slot of `tree ++ [0]`,
        // and every other tree sorts at or above it.
        Bound::Unbounded => {
            let mut end = tree.to_vec();
            end.push(0);
            Bound::Excluded(Slot::Tree { tree: end, key: Vec::new() })
        }
    };
    (lower, upper)
}

fn tree_items<'a, V>(
    map: &'a BTreeMap<Slot, V>,
    bounds: (Bound<Slot>, Bound<Slot>),
    value: impl Fn(&V) -> Option<Vec<u8>> + 'a,
) -> impl DoubleEndedIterator<Item = Item> + 'a {
    map.range(bounds).map(move |(slot, v)| (slot.key().to_vec(), value(v)))
}

#[derive(Debug, Clone)]
struct Record {
    value: Option<Vec<u8>>,
    version: Version,
    expires_at: Option<Instant>,
}

impl Record {
    /// Expired records keep their version so versions never move backwards;
    /// only the value disappears.
    fn read(&self, now: Instant) -> (Version, Option<Vec<u8>>) {
        match self.expires_at {
            Some(at) if at <= now => (self.version, None),
            _ => (self.version, self.value.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct Staged {
    value: Option<Vec<u8>>,
    version: Version,
    /// Committed version observed when the slot was first staged.
    base: Version,
    /// Set once any CAS touched the slot; commit then requires `base` to
    /// still be the committed version.
    guarded: bool,
}

/// How a transaction left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finished {
    /// Committed or rolled back.
    Completed,
    /// Lease expired or commit-time conflict.
    Interrupted,
}

#[derive(Debug)]
struct Tx {
    deadline: Instant,
    writes: BTreeMap<Slot, Staged>,
}

pub(crate) struct State {
    records: BTreeMap<Slot, Record>,
    /// Active transactions only.
    transactions: HashMap<TransactionIndex, Tx>,
    finished: HashMap<TransactionIndex, Finished>,
    finished_order: VecDeque<TransactionIndex>,
    /// Expired leases are swept at most once per lease period.
    next_sweep: Option<Instant>,
    next_tx: TransactionIndex,
    lease: Duration,
}

fn committed(records: &BTreeMap<Slot, Record>, slot: &Slot, now: Instant) -> (Version, Option<Vec<u8>>) {
    records.get(slot).map(|r| r.read(now)).unwrap_or((0, None))
}

impl State {
    pub(crate) fn new(lease: Duration) -> Self {
        State {
            records: BTreeMap::new(),
            transactions: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            next_sweep: None,
            next_tx: 1,
            lease,
        }
    }

    // -----------------------------------------------------------------------
    // Plain keys
    // -----------------------------------------------------------------------

    pub(crate) fn get(&self, key: &[u8], now: Instant) -> (Version, Option<Vec<u8>>) {
        committed(&self.records, &Slot::Kv(key.to_vec()), now)
    }

    /// Returns `(applied, version)`; on rejection `version` is the current one.
    pub(crate) fn set(
        &mut self,
        key: &[u8],
        value: Option<Vec<u8>>,
        condition: SetCondition,
        expected: Version,
        expire: Expire,
        now: Instant,
    ) -> (bool, Version) {
        let slot = Slot::Kv(key.to_vec());
        let current = self.records.get(&slot);
        let (version, present) = current
            .map(|r| {
                let (v, value) = r.read(now);
                (v, value.is_some())
            })
            .unwrap_or((0, false));

        let allowed = match condition {
            SetCondition::Always => true,
            SetCondition::Exists => present,
            SetCondition::NotExists => !present,
            SetCondition::Version => version == expected,
        };
        if !allowed {
            return (false, version);
        }

        let expires_at = match expire {
            Expire::None => None,
            Expire::Keep => current.and_then(|r| r.expires_at),
            Expire::After(secs) => Some(now + Duration::from_secs(secs as u64)),
        };
        let version = version + 1;
        self.records.insert(slot, Record { value, version, expires_at });
        (true, version)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub(crate) fn create_tx(&mut self, now: Instant) -> TransactionIndex {
        self.sweep(now);
        let index = self.next_tx;
        self.next_tx += 1;
        self.transactions.insert(
            index,
            Tx {
                deadline: now + self.lease,
                writes: BTreeMap::new(),
            },
        );
        index
    }

    /// Retires every active transaction whose lease has run out.
    fn sweep(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.next_sweep = Some(now + self.lease);
        let mut expired: Vec<TransactionIndex> = self
            .transactions
            .iter()
            .filter(|(_, tx)| tx.deadline <= now)
            .map(|(index, _)| *index)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable();
        tracing::debug!(count = expired.len(), "expired transactions swept");
        for index in expired {
            self.retire(index, Finished::Interrupted);
        }
    }

    fn retire(&mut self, index: TransactionIndex, how: Finished) {
        self.transactions.remove(&index);
        self.finished.insert(index, how);
        self.finished_order.push_back(index);
        while self.finished_order.len() > FINISHED_RETAINED {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    fn inactive_error(&self, index: TransactionIndex) -> KvError {
        match self.finished.get(&index) {
            Some(Finished::Completed) => KvError::TransactionCompleted { index },
            Some(Finished::Interrupted) => KvError::TransactionInterrupted { index },
            None => KvError::TransactionNotFound { index },
        }
    }

    fn active_tx(&mut self, index: TransactionIndex, now: Instant) -> Result<&mut Tx, KvError> {
        match self.transactions.get(&index).map(|tx| tx.deadline) {
            None => return Err(self.inactive_error(index)),
            Some(deadline) if deadline <= now => {
                tracing::debug!(index, "transaction lease expired");
                self.retire(index, Finished::Interrupted);
                return Err(KvError::TransactionInterrupted { index });
            }
            Some(_) => {}
        }
        self.transactions
            .get_mut(&index)
            .ok_or(KvError::TransactionNotFound { index })
    }

    /// Staged writes visible to `index`; `None` outside a transaction.
    /// Does not retire an expired transaction, only reports it.
    fn staged(
        &self,
        index: TransactionIndex,
        now: Instant,
    ) -> Result<Option<&BTreeMap<Slot, Staged>>, KvError> {
        if index == 0 {
            return Ok(None);
        }
        match self.transactions.get(&index) {
            Some(tx) if tx.deadline <= now => Err(KvError::TransactionInterrupted { index }),
            Some(tx) => Ok(Some(&tx.writes)),
            None => Err(self.inactive_error(index)),
        }
    }

    pub(crate) fn keep_alive(&mut self, index: TransactionIndex, now: Instant) -> Result<(), KvError> {
        let lease = self.lease;
        let tx = self.active_tx(index, now)?;
        tx.deadline = now + lease;
        Ok(())
    }

    /// Applies staged writes atomically. Returns the number of slots written.
    pub(crate) fn commit(&mut self, index: TransactionIndex, now: Instant) -> Result<usize, KvError> {
        let tx = self.active_tx(index, now)?;
        let writes = std::mem::take(&mut tx.writes);

        let conflict = writes
            .iter()
            .filter(|(_, staged)| staged.guarded)
            .any(|(slot, staged)| committed(&self.records, slot, now).0 != staged.base);
        if conflict {
            self.retire(index, Finished::Interrupted);
            return Err(KvError::TransactionInterrupted { index });
        }

        let applied = writes.len();
        for (slot, staged) in writes {
            let current = committed(&self.records, &slot, now).0;
            let version = current + (staged.version - staged.base);
            self.records.insert(
                slot,
                Record { value: staged.value, version, expires_at: None },
            );
        }
        self.retire(index, Finished::Completed);
        Ok(applied)
    }

    pub(crate) fn rollback(&mut self, index: TransactionIndex, now: Instant) -> Result<(), KvError> {
        self.active_tx(index, now)?;
        self.retire(index, Finished::Completed);
        Ok(())
    }

    fn visible(
        &self,
        index: TransactionIndex,
        slot: &Slot,
        now: Instant,
    ) -> Result<(Version, Option<Vec<u8>>), KvError> {
        if let Some(staged) = self.staged(index, now)?.and_then(|writes| writes.get(slot)) {
            return Ok((staged.version, staged.value.clone()));
        }
        Ok(committed(&self.records, slot, now))
    }

    pub(crate) fn tx_get(
        &self,
        index: TransactionIndex,
        key: &[u8],
        now: Instant,
    ) -> Result<(Version, Option<Vec<u8>>), KvError> {
        if index == 0 {
            return Err(KvError::TransactionNotFound { index });
        }
        self.visible(index, &Slot::Kv(key.to_vec()), now)
    }

    /// Stages a write. `expected` is the CAS condition, if any.
    pub(crate) fn stage(
        &mut self,
        index: TransactionIndex,
        slot: Slot,
        value: Option<Vec<u8>>,
        expected: Option<Version>,
        now: Instant,
    ) -> Result<(bool, Version), KvError> {
        let base = committed(&self.records, &slot, now).0;
        let tx = self.active_tx(index, now)?;
        let (current, base, guarded) = match tx.writes.get(&slot) {
            Some(s) => (s.version, s.base, s.guarded),
            None => (base, base, false),
        };
        if let Some(expected) = expected {
            if expected != current {
                return Ok((false, current));
            }
        }
        let version = current + 1;
        tx.writes.insert(
            slot,
            Staged {
                value,
                version,
                base,
                guarded: guarded || expected.is_some(),
            },
        );
        Ok((true, version))
    }

    // -----------------------------------------------------------------------
    // Trees
    // -----------------------------------------------------------------------

    /// Nearest entry of `tree` strictly after (`forward`) or before `anchor`,
    /// as seen from `index`.
    pub(crate) fn tree_step(
        &self,
        tree: &[u8],
        index: TransactionIndex,
        anchor: &[u8],
        forward: bool,
        now: Instant,
    ) -> Result<Option<Item>, KvError> {
        let writes = self.staged(index, now)?;
        let bounds = if forward {
            tree_bounds(tree, Bound::Excluded(anchor), Bound::Unbounded)
        } else {
            tree_bounds(tree, Bound::Unbounded, Bound::Excluded(anchor))
        };
        let mut committed = tree_items(&self.records, bounds.clone(), move |r: &Record| r.read(now).1);
        let mut staged = writes.map(|w| tree_items(w, bounds, |s: &Staged| s.value.clone()));
        let (c, s) = if forward {
            (committed.next(), staged.as_mut().and_then(|it| it.next()))
        } else {
            (committed.next_back(), staged.as_mut().and_then(|it| it.next_back()))
        };
        Ok(tree::nearest(c, s, forward))
    }

    /// Entries of `tree` in `[first, last)`, at most `limit`, as seen from
    /// `index`. `None` bounds are open.
    pub(crate) fn tree_range(
        &self,
        tree: &[u8],
        index: TransactionIndex,
        first: Option<&[u8]>,
        last: Option<&[u8]>,
        limit: usize,
        now: Instant,
    ) -> Result<Vec<TreeEntry>, KvError> {
        let writes = self.staged(index, now)?;
        if let (Some(lo), Some(hi)) = (first, last) {
            if lo >= hi {
                return Ok(Vec::new());
            }
        }
        let lower = first.map_or(Bound::Unbounded, Bound::Included);
        let upper = last.map_or(Bound::Unbounded, Bound::Excluded);
        let bounds = tree_bounds(tree, lower, upper);
        let committed = tree_items(&self.records, bounds.clone(), move |r: &Record| r.read(now).1);
        let staged = writes
            .map(|w| tree_items(w, bounds, |s: &Staged| s.value.clone()))
            .into_iter()
            .flatten();
        Ok(tree::merge(committed, staged, limit))
    }

    pub(crate) fn tree_get(
        &self,
        tree: &[u8],
        key: &[u8],
        index: TransactionIndex,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, KvError> {
        let slot = Slot::Tree { tree: tree.to_vec(), key: key.to_vec() };
        Ok(self.visible(index, &slot, now)?.1)
    }

    pub(crate) fn tree_set(
        &mut self,
        tree: &[u8],
        key: &[u8],
        value: Option<Vec<u8>>,
        index: TransactionIndex,
        now: Instant,
    ) -> Result<(), KvError> {
        let slot = Slot::Tree { tree: tree.to_vec(), key: key.to_vec() };
        if index != 0 {
            self.stage(index, slot, value, None, now)?;
            return Ok(());
        }
        let version = committed(&self.records, &slot, now).0 + 1;
        self.records.insert(slot, Record { value, version, expires_at: None });
        Ok(())
    }
}
