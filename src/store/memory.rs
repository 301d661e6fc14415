// In-process store
// One mutex serializes every operation the same way Redis serializes scripts.

use super::{
    AtomicStore, HashMerge, JobWrite, MergeOutcome, Reservation, ReservationOutcome, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Expiring<String>>,
    sorted: HashMap<String, Expiring<HashMap<String, i64>>>,
    lists: HashMap<String, Expiring<Vec<String>>>,
    hashes: HashMap<String, Expiring<HashMap<String, String>>>,
}

impl State {
    fn string(&mut self, key: &str) -> Option<&mut Expiring<String>> {
        if self.strings.get(key).is_some_and(|entry| !entry.is_live()) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn hash(&mut self, key: &str) -> Option<&mut Expiring<HashMap<String, String>>> {
        if self.hashes.get(key).is_some_and(|entry| !entry.is_live()) {
            self.hashes.remove(key);
        }
        self.hashes.get_mut(key)
    }

    fn list(&mut self, key: &str) -> Option<&mut Vec<String>> {
        if self.lists.get(key).is_some_and(|entry| !entry.is_live()) {
            self.lists.remove(key);
        }
        self.lists.get_mut(key).map(|entry| &mut entry.value)
    }

    fn sorted(&mut self, key: &str) -> Option<&mut HashMap<String, i64>> {
        if self.sorted.get(key).is_some_and(|entry| !entry.is_live()) {
            self.sorted.remove(key);
        }
        self.sorted.get_mut(key).map(|entry| &mut entry.value)
    }

    fn sorted_or_default(&mut self, key: &str) -> &mut Expiring<HashMap<String, i64>> {
        if self.sorted.get(key).is_some_and(|entry| !entry.is_live()) {
            self.sorted.remove(key);
        }
        self.sorted
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(HashMap::new(), None))
    }

    /// Members ordered by score then member, highest first.
    fn descending(&mut self, key: &str) -> Vec<(String, i64)> {
        let mut members: Vec<(String, i64)> = self
            .sorted(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        members
    }

    fn prune_window(&mut self, key: &str, cutoff_ms: i64) -> u64 {
        match self.sorted(key) {
            Some(set) => {
                set.retain(|_, score| *score > cutoff_ms);
                set.len() as u64
            }
            None => 0,
        }
    }

    fn counter(&mut self, key: &str) -> StoreResult<u64> {
        match self.string(key) {
            Some(entry) => entry
                .value
                .parse()
                .map_err(|_| StoreError::Command(format!("{} is not an integer", key))),
            None => Ok(0),
        }
    }
}

/// Store held entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as if the server were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store state poisoned".to_string()))
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn enqueue_job(&self, write: &JobWrite) -> StoreResult<()> {
        let mut state = self.lock()?;

        state.strings.insert(
            write.job_key.clone(),
            Expiring::new(write.payload.clone(), Some(write.ttl)),
        );
        state
            .sorted_or_default(&write.index_key)
            .value
            .insert(write.member.clone(), write.score);
        if state.list(&write.legacy_key).is_none() {
            state
                .lists
                .insert(write.legacy_key.clone(), Expiring::new(Vec::new(), None));
        }
        if let Some(legacy) = state.lists.get_mut(&write.legacy_key) {
            legacy.value.push(write.member.clone());
            legacy.expires_at = Some(Instant::now() + write.ttl);
        }
        state.hashes.insert(
            write.status_key.clone(),
            Expiring::new(
                write.status_fields.iter().cloned().collect(),
                Some(write.ttl),
            ),
        );
        Ok(())
    }

    async fn pop_max(&self, index_key: &str, legacy_key: &str) -> StoreResult<Option<String>> {
        let mut state = self.lock()?;
        let Some((member, _)) = state.descending(index_key).into_iter().next() else {
            return Ok(None);
        };
        if let Some(set) = state.sorted(index_key) {
            set.remove(&member);
        }
        if let Some(legacy) = state.list(legacy_key) {
            if let Some(pos) = legacy.iter().position(|id| *id == member) {
                legacy.remove(pos);
            }
        }
        Ok(Some(member))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.lock()?;
        Ok(state.string(key).map(|entry| entry.value.clone()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        Ok(state.string(key).is_some() || state.hash(key).is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let removed = state.strings.remove(key).is_some()
            | state.hashes.remove(key).is_some()
            | state.sorted.remove(key).is_some()
            | state.lists.remove(key).is_some();
        Ok(removed)
    }

    async fn rank_desc(&self, index_key: &str, member: &str) -> StoreResult<Option<u64>> {
        let mut state = self.lock()?;
        Ok(state
            .descending(index_key)
            .iter()
            .position(|(m, _)| m == member)
            .map(|rank| rank as u64))
    }

    async fn index_len(&self, index_key: &str) -> StoreResult<u64> {
        let mut state = self.lock()?;
        Ok(state.sorted(index_key).map_or(0, |set| set.len() as u64))
    }

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>> {
        let mut state = self.lock()?;
        Ok(state
            .descending(index_key)
            .into_iter()
            .map(|(member, _)| member)
            .collect())
    }

    async fn remove_from_index(&self, index_key: &str, members: &[String]) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let Some(set) = state.sorted(index_key) else {
            return Ok(0);
        };
        Ok(members.iter().filter(|m| set.remove(*m).is_some()).count() as u64)
    }

    async fn reconcile_legacy(&self, legacy_key: &str, index_key: &str) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let live: HashSet<String> = state
            .sorted(index_key)
            .map(|set| set.keys().cloned().collect())
            .unwrap_or_default();
        let Some(list) = state.list(legacy_key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|id| live.contains(id));
        Ok((before - list.len()) as u64)
    }

    async fn merge_hash(&self, merge: &HashMerge) -> StoreResult<MergeOutcome> {
        let mut state = self.lock()?;
        let Some(record) = state.hash(&merge.key) else {
            return Ok(MergeOutcome::Missing);
        };

        if let Some(current) = record.value.get(&merge.guard_field) {
            if merge.final_values.iter().any(|v| v == current) {
                return Ok(MergeOutcome::Final);
            }
        }

        for (field, value) in &merge.fields {
            record.value.insert(field.clone(), value.clone());
        }
        record.expires_at = Some(Instant::now() + merge.ttl);
        Ok(MergeOutcome::Applied)
    }

    async fn read_hash(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut state = self.lock()?;
        Ok(state
            .hash(key)
            .map(|record| record.value.clone())
            .unwrap_or_default())
    }

    async fn reserve(&self, reservation: &Reservation) -> StoreResult<ReservationOutcome> {
        let mut state = self.lock()?;

        let requests = state.prune_window(
            &reservation.window_key,
            reservation.now_ms - reservation.window_ms,
        );
        if requests >= reservation.rpm_limit {
            return Ok(ReservationOutcome::RequestLimit { requests });
        }

        let used = state.counter(&reservation.tokens_key)?;
        if used + reservation.tokens > reservation.tpm_limit {
            return Ok(ReservationOutcome::TokenLimit { tokens: used });
        }

        let window = state.sorted_or_default(&reservation.window_key);
        window
            .value
            .insert(reservation.request_id.clone(), reservation.now_ms);
        window.expires_at = Some(Instant::now() + reservation.safety_ttl);

        let total = used + reservation.tokens;
        match state.string(&reservation.tokens_key) {
            // Expiry is only set when the counter is created
            Some(entry) => entry.value = total.to_string(),
            None => {
                state.strings.insert(
                    reservation.tokens_key.clone(),
                    Expiring::new(total.to_string(), Some(reservation.safety_ttl)),
                );
            }
        }

        Ok(ReservationOutcome::Admitted {
            requests: requests + 1,
            tokens: total,
        })
    }

    async fn usage(
        &self,
        window_key: &str,
        tokens_key: &str,
        window_start_ms: i64,
    ) -> StoreResult<(u64, u64)> {
        let mut state = self.lock()?;
        let requests = state.prune_window(window_key, window_start_ms);
        let tokens = state.counter(tokens_key)?;
        Ok((requests, tokens))
    }

    /// Single process: dispatchers are woken through the in-process signal instead.
    async fn publish(&self, _channel: &str) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use crate::store::KeySpace;
    use std::sync::Arc;

    fn shared() -> (Arc<dyn AtomicStore>, KeySpace) {
        (Arc::new(MemoryStore::new()), KeySpace::new("test"))
    }

    #[tokio::test]
    async fn test_shared_status_merge() {
        let (store, keys) = shared();
        conformance::status_merge_keeps_created_at_and_refuses_final(store, keys).await;
    }

    #[tokio::test]
    async fn test_shared_pop_order_and_orphans() {
        let (store, keys) = shared();
        conformance::pop_serves_oldest_first_and_skips_orphans(store, keys).await;
    }

    #[tokio::test]
    async fn test_shared_legacy_reconcile() {
        let (store, keys) = shared();
        conformance::cleanup_reconciles_legacy_list(store, keys).await;
    }

    #[tokio::test]
    async fn test_shared_usage_pruning() {
        let (store, keys) = shared();
        conformance::usage_prunes_the_request_window(store, keys).await;
    }

    fn reservation(now_ms: i64, request_id: &str, tokens: u64) -> Reservation {
        Reservation {
            window_key: "w".to_string(),
            tokens_key: "t".to_string(),
            now_ms,
            window_ms: 60_000,
            rpm_limit: 2,
            tpm_limit: 1_000,
            tokens,
            request_id: request_id.to_string(),
            safety_ttl: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn test_pop_max_breaks_score_ties_by_member() {
        let store = MemoryStore::new();
        for member in ["a", "c", "b"] {
            store
                .enqueue_job(&JobWrite {
                    job_key: format!("job:{}", member),
                    payload: "{}".to_string(),
                    index_key: "idx".to_string(),
                    legacy_key: "legacy".to_string(),
                    member: member.to_string(),
                    score: 7,
                    status_key: format!("status:{}", member),
                    status_fields: vec![],
                    ttl: Duration::from_secs(60),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.pop_max("idx", "legacy").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.pop_max("idx", "legacy").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop_max("idx", "legacy").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop_max("idx", "legacy").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_window_entries_age_out() {
        let store = MemoryStore::new();
        let t0 = 1_000_000;

        assert!(matches!(
            store.reserve(&reservation(t0, "r1", 1)).await.unwrap(),
            ReservationOutcome::Admitted { requests: 1, .. }
        ));
        assert!(matches!(
            store.reserve(&reservation(t0 + 1, "r2", 1)).await.unwrap(),
            ReservationOutcome::Admitted { requests: 2, .. }
        ));
        assert_eq!(
            store.reserve(&reservation(t0 + 2, "r3", 1)).await.unwrap(),
            ReservationOutcome::RequestLimit { requests: 2 }
        );

        // A minute later the first entry has left the window
        assert!(matches!(
            store.reserve(&reservation(t0 + 60_000, "r4", 1)).await.unwrap(),
            ReservationOutcome::Admitted { requests: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_offline_store_refuses_operations() {
        let store = MemoryStore::new();
        store.set_offline(true);

        assert!(matches!(
            store.ping().await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_merge_refuses_final_records() {
        let store = MemoryStore::new();
        store
            .enqueue_job(&JobWrite {
                job_key: "job:1".to_string(),
                payload: "{}".to_string(),
                index_key: "idx".to_string(),
                legacy_key: "legacy".to_string(),
                member: "1".to_string(),
                score: 1,
                status_key: "status:1".to_string(),
                status_fields: vec![("status".to_string(), "\"failed\"".to_string())],
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();

        let merge = HashMerge {
            key: "status:1".to_string(),
            fields: vec![("status".to_string(), "\"processing\"".to_string())],
            ttl: Duration::from_secs(60),
            guard_field: "status".to_string(),
            final_values: vec!["\"completed\"".to_string(), "\"failed\"".to_string()],
        };
        assert_eq!(store.merge_hash(&merge).await.unwrap(), MergeOutcome::Final);

        let missing = HashMerge {
            key: "status:2".to_string(),
            ..merge
        };
        assert_eq!(store.merge_hash(&missing).await.unwrap(), MergeOutcome::Missing);
    }
}
