//! Pending request ledger: fingerprint → callers waiting for that value.
//!
//! An entry is `Waiting` until a coalescing tick claims it, then `Dispatched` until a
//! fetch resolves it. Callers arriving for a dispatched fingerprint join its waiters
//! instead of starting a second fetch. `resolve` removes the entry, so each caller
//! receives exactly one value.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use cellfetch_common::{BalanceQuery, FetchError, Fingerprint, QueryFingerprint};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::oneshot;

pub type Resolution = Result<f64, FetchError>;

/// A caller's handle on one requested value.
#[must_use = "a pending value does nothing unless awaited"]
pub struct PendingValue {
    rx: oneshot::Receiver<Resolution>,
}

impl PendingValue {
    /// A handle that is already resolved (cache hit, invalid request).
    pub fn ready(result: Resolution) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Non-blocking peek; `None` while still pending.
    pub fn try_take(&mut self) -> Option<Resolution> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

impl Future for PendingValue {
    type Output = Resolution;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(dropped())))
    }
}

fn dropped() -> FetchError {
    FetchError::cancelled("request was dropped before it resolved")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Waiting,
    Dispatched,
}

/// Whether a submit created a ledger entry or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    New,
    Joined(EntryState),
}

/// A claimed request, as handed to the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub fingerprint: Fingerprint,
    pub query: BalanceQuery,
}

struct LedgerEntry {
    query: BalanceQuery,
    state: EntryState,
    seq: u64,
    waiters: SmallVec<[oneshot::Sender<Resolution>; 1]>,
}

#[derive(Default)]
struct LedgerInner {
    entries: FxHashMap<Fingerprint, LedgerEntry>,
    next_seq: u64,
}

#[derive(Default)]
pub struct PendingLedger {
    inner: Mutex<LedgerInner>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, query: BalanceQuery) -> (PendingValue, Admission) {
        let fingerprint = query.fingerprint();
        self.submit_with_fingerprint(fingerprint, query)
    }

    pub fn submit_with_fingerprint(
        &self,
        fingerprint: Fingerprint,
        query: BalanceQuery,
    ) -> (PendingValue, Admission) {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let seq = inner.next_seq;
        let admission = match inner.entries.get_mut(&fingerprint) {
            Some(entry) => {
                entry.waiters.push(tx);
                Admission::Joined(entry.state)
            }
            None => {
                inner.next_seq += 1;
                let mut waiters = SmallVec::new();
                waiters.push(tx);
                inner.entries.insert(
                    fingerprint,
                    LedgerEntry {
                        query,
                        state: EntryState::Waiting,
                        seq,
                        waiters,
                    },
                );
                Admission::New
            }
        };
        (PendingValue { rx }, admission)
    }

    /// Take every `Waiting` entry for planning, in submission order. Claimed entries
    /// stay in the ledger as `Dispatched` so later callers can join them.
    pub fn claim_waiting(&self) -> Vec<PendingRequest> {
        let mut inner = self.inner.lock();
        let mut claimed: Vec<(u64, PendingRequest)> = inner
            .entries
            .iter_mut()
            .filter(|(_, e)| e.state == EntryState::Waiting)
            .map(|(fp, e)| {
                e.state = EntryState::Dispatched;
                (
                    e.seq,
                    PendingRequest {
                        fingerprint: fp.clone(),
                        query: e.query.clone(),
                    },
                )
            })
            .collect();
        claimed.sort_by_key(|(seq, _)| *seq);
        claimed.into_iter().map(|(_, r)| r).collect()
    }

    /// Deliver `result` to every caller of `fingerprint` and drop the entry. Returns
    /// the number of callers still listening.
    pub fn resolve(&self, fingerprint: &Fingerprint, result: Resolution) -> usize {
        let entry = self.inner.lock().entries.remove(fingerprint);
        let Some(entry) = entry else {
            return 0;
        };
        entry
            .waiters
            .into_iter()
            .map(|tx| tx.send(result.clone()).is_ok())
            .filter(|delivered| *delivered)
            .count()
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<EntryState> {
        self.inner.lock().entries.get(fingerprint).map(|e| e.state)
    }

    pub fn has_waiting(&self) -> bool {
        self.inner
            .lock()
            .entries
            .values()
            .any(|e| e.state == EntryState::Waiting)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every outstanding caller. Used when the engine shuts down.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<LedgerEntry> = self
            .inner
            .lock()
            .entries
            .drain()
            .map(|(_, e)| e)
            .collect();
        drained
            .into_iter()
            .flat_map(|e| e.waiters)
            .map(|tx| tx.send(Err(FetchError::cancelled(reason))).is_ok())
            .filter(|delivered| *delivered)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellfetch_common::{FetchErrorKind, Period};

    fn q(entity: &str) -> BalanceQuery {
        BalanceQuery::cumulative(entity, Period::new(2025, 1).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn duplicate_submits_share_one_entry() {
        let ledger = PendingLedger::new();
        let (a, adm_a) = ledger.submit(q("1000"));
        let (b, adm_b) = ledger.submit(q("1000"));
        assert_eq!(adm_a, Admission::New);
        assert_eq!(adm_b, Admission::Joined(EntryState::Waiting));
        assert_eq!(ledger.len(), 1);

        assert_eq!(ledger.resolve(&q("1000").fingerprint(), Ok(3.5)), 2);
        assert_eq!(a.await, Ok(3.5));
        assert_eq!(b.await, Ok(3.5));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn claimed_entries_accept_joiners_but_are_not_reclaimed() {
        let ledger = PendingLedger::new();
        let _first = ledger.submit(q("2000"));
        let _second = ledger.submit(q("1000"));
        assert_eq!(ledger.state(&q("1000").fingerprint()), Some(EntryState::Waiting));
        let claimed = ledger.claim_waiting();
        let entities: Vec<_> = claimed.iter().map(|r| r.query.entity().as_str()).collect();
        assert_eq!(entities, ["2000", "1000"]);
        assert!(!ledger.has_waiting());
        assert_eq!(ledger.state(&q("1000").fingerprint()), Some(EntryState::Dispatched));

        let (late, admission) = ledger.submit(q("1000"));
        assert_eq!(admission, Admission::Joined(EntryState::Dispatched));
        assert!(ledger.claim_waiting().is_empty());

        ledger.resolve(&q("1000").fingerprint(), Err(FetchError::timeout("slow")));
        assert_eq!(late.await.unwrap_err().kind, FetchErrorKind::Timeout);
        assert_eq!(ledger.state(&q("1000").fingerprint()), None);
    }

    #[tokio::test]
    async fn resolution_is_delivered_once() {
        let ledger = PendingLedger::new();
        let (mut value, _) = ledger.submit(q("1000"));
        assert!(value.try_take().is_none());
        assert_eq!(ledger.resolve(&q("1000").fingerprint(), Ok(1.0)), 1);
        assert_eq!(ledger.resolve(&q("1000").fingerprint(), Ok(2.0)), 0);
        assert_eq!(value.try_take(), Some(Ok(1.0)));
    }

    #[tokio::test]
    async fn dropped_callers_are_skipped_and_cancel_fails_the_rest() {
        let ledger = PendingLedger::new();
        let (gone, _) = ledger.submit(q("1000"));
        drop(gone);
        let (kept, _) = ledger.submit(q("2000"));
        assert_eq!(ledger.cancel_all("shutdown"), 1);
        assert_eq!(kept.await.unwrap_err().kind, FetchErrorKind::Cancelled);
    }
}
