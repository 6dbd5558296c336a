use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    data_loss, failed_precondition, internal_error, storage_transaction_failed, FirestoreResult,
};

pub const MUTATION_QUEUES: &str = "mutationQueues";
pub const MUTATIONS: &str = "mutations";
pub const DOCUMENT_MUTATIONS: &str = "documentMutations";
pub const REMOTE_DOCUMENTS: &str = "remoteDocuments";
pub const REMOTE_DOCUMENT_GLOBAL: &str = "remoteDocumentGlobal";
pub const TARGETS: &str = "targets";
pub const TARGETS_BY_CANONICAL_ID: &str = "targetsByCanonicalId";
pub const TARGET_DOCUMENTS: &str = "targetDocuments";
pub const DOCUMENT_TARGETS: &str = "documentTargets";
pub const TARGET_GLOBAL: &str = "targetGlobal";
pub const COLLECTION_PARENTS: &str = "collectionParents";
pub const CLIENT_METADATA: &str = "clientMetadata";
pub const PRIMARY_CLIENT: &str = "owner";

/// Separates the parts of composite keys. Sorts before every printable
/// character, so prefixes order before their extensions.
pub const KEY_SEPARATOR: char = '\u{0}';

type Table = BTreeMap<String, JsonValue>;
type Tables = BTreeMap<String, Table>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and only while this client holds the primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(self) -> bool {
        self == TransactionMode::ReadOnly
    }
}

static OPEN_STORES: Lazy<Mutex<HashMap<String, Weak<KvStore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transactional key-value store backing persistence.
///
/// Each logical table is an ordered map from string keys to JSON records.
/// Transactions run one at a time; their writes are staged and only become
/// visible when the transaction body returns `Ok`.
///
/// Stores are shared by name within the process, so clients opened with the
/// same persistence key see the same data, the way tabs of one origin share
/// a database.
pub struct KvStore {
    name: String,
    tables: async_lock::Mutex<Tables>,
    /// Synchronously written markers for clients that shut down without
    /// releasing their state.
    zombied_clients: Mutex<BTreeSet<String>>,
    failures_to_inject: AtomicUsize,
}

impl KvStore {
    /// Opens (or joins) the store called `name`.
    pub fn open(name: &str) -> Arc<KvStore> {
        let mut stores = lock(&OPEN_STORES);
        if let Some(existing) = stores.get(name).and_then(Weak::upgrade) {
            return existing;
        }
        let store = Arc::new(KvStore {
            name: name.to_string(),
            tables: async_lock::Mutex::new(Tables::new()),
            zombied_clients: Mutex::new(BTreeSet::new()),
            failures_to_inject: AtomicUsize::new(0),
        });
        stores.insert(name.to_string(), Arc::downgrade(&store));
        store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `body` in a transaction. Writes are discarded if it fails.
    pub async fn run<T, F>(&self, mode: TransactionMode, body: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut KvTransaction<'_>) -> FirestoreResult<T>,
    {
        if self.take_injected_failure() {
            return Err(storage_transaction_failed(format!(
                "Transaction on {} aborted",
                self.name
            )));
        }
        let mut tables = self.tables.lock().await;
        let mut txn = KvTransaction::new(&tables, mode);
        let result = body(&mut txn)?;
        let writes = txn.into_writes();
        for (table, entries) in writes {
            let table = tables.entry(table).or_default();
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        table.insert(key, value);
                    }
                    None => {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Makes the next `count` transactions fail with a transient storage
    /// error.
    pub fn inject_failures(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    pub fn set_zombied(&self, client_id: &str, zombied: bool) {
        let mut clients = lock(&self.zombied_clients);
        if zombied {
            clients.insert(client_id.to_string());
        } else {
            clients.remove(client_id);
        }
    }

    pub fn is_zombied(&self, client_id: &str) -> bool {
        lock(&self.zombied_clients).contains(client_id)
    }
}

/// Staged view of the store for the duration of one transaction.
pub struct KvTransaction<'a> {
    base: &'a Tables,
    writes: BTreeMap<String, BTreeMap<String, Option<JsonValue>>>,
    mode: TransactionMode,
}

impl<'a> KvTransaction<'a> {
    fn new(base: &'a Tables, mode: TransactionMode) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
            mode,
        }
    }

    fn into_writes(self) -> BTreeMap<String, BTreeMap<String, Option<JsonValue>>> {
        self.writes
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> FirestoreResult<Option<T>> {
        let staged = self.writes.get(table).and_then(|entries| entries.get(key));
        let raw = match staged {
            Some(value) => value.as_ref(),
            None => self.base.get(table).and_then(|entries| entries.get(key)),
        };
        raw.map(|value| decode_record(table, key, value)).transpose()
    }

    pub fn contains(&self, table: &str, key: &str) -> bool {
        match self.writes.get(table).and_then(|entries| entries.get(key)) {
            Some(value) => value.is_some(),
            None => self
                .base
                .get(table)
                .is_some_and(|entries| entries.contains_key(key)),
        }
    }

    pub fn put<T: Serialize>(&mut self, table: &str, key: impl Into<String>, value: &T) -> FirestoreResult<()> {
        self.check_writable()?;
        let value = serde_json::to_value(value)
            .map_err(|err| internal_error(format!("Failed to encode {table} record: {err}")))?;
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key.into(), Some(value));
        Ok(())
    }

    pub fn delete(&mut self, table: &str, key: impl Into<String>) -> FirestoreResult<()> {
        self.check_writable()?;
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key.into(), None);
        Ok(())
    }

    /// Records with keys in `[lower, upper)`-style bounds, in key order.
    pub fn scan<T: DeserializeOwned>(
        &self,
        table: &str,
        lower: Bound<String>,
        upper: Bound<String>,
    ) -> FirestoreResult<Vec<(String, T)>> {
        let range = (lower, upper);
        let mut merged: BTreeMap<String, Option<&JsonValue>> = self
            .base
            .get(table)
            .map(|entries| {
                entries
                    .range(range.clone())
                    .map(|(key, value)| (key.clone(), Some(value)))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(staged) = self.writes.get(table) {
            for (key, value) in staged.range(range) {
                merged.insert(key.clone(), value.as_ref());
            }
        }
        merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .map(|(key, value)| {
                let record = decode_record(table, &key, value)?;
                Ok((key, record))
            })
            .collect()
    }

    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        table: &str,
        prefix: &str,
    ) -> FirestoreResult<Vec<(String, T)>> {
        let upper = match prefix_successor(prefix) {
            Some(successor) => Bound::Excluded(successor),
            None => Bound::Unbounded,
        };
        self.scan(table, Bound::Included(prefix.to_string()), upper)
    }

    pub fn scan_all<T: DeserializeOwned>(&self, table: &str) -> FirestoreResult<Vec<(String, T)>> {
        self.scan(table, Bound::Unbounded, Bound::Unbounded)
    }

    pub fn keys_with_prefix(&self, table: &str, prefix: &str) -> FirestoreResult<Vec<String>> {
        Ok(self
            .scan_prefix::<JsonValue>(table, prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    pub fn delete_prefix(&mut self, table: &str, prefix: &str) -> FirestoreResult<usize> {
        let keys = self.keys_with_prefix(table, prefix)?;
        let count = keys.len();
        for key in keys {
            self.delete(table, key)?;
        }
        Ok(count)
    }

    fn check_writable(&self) -> FirestoreResult<()> {
        if self.mode.is_read_only() {
            return Err(failed_precondition("Write attempted in a read-only transaction"));
        }
        Ok(())
    }
}

fn decode_record<T: DeserializeOwned>(table: &str, key: &str, value: &JsonValue) -> FirestoreResult<T> {
    T::deserialize(value)
        .map_err(|err| data_loss(format!("Corrupt {table} record {key:?}: {err}")))
}

/// Smallest string greater than every string starting with `prefix`.
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Joins key parts with [`KEY_SEPARATOR`].
pub fn composite_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for (index, part) in parts.into_iter().enumerate() {
        if index > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part.as_ref());
    }
    key
}

/// Fixed-width encoding so numeric ids sort numerically.
pub fn id_key(id: i64) -> String {
    format!("{id:020}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: i64,
    }

    fn unique_name(label: &str) -> String {
        format!("kv-test-{label}-{}", rand::random::<u64>())
    }

    #[tokio::test]
    async fn failed_transactions_discard_writes() {
        let store = KvStore::open(&unique_name("discard"));
        let result: FirestoreResult<()> = store
            .run(TransactionMode::ReadWrite, |txn| {
                txn.put(TARGETS, "a", &Row { n: 1 })?;
                Err(internal_error("boom"))
            })
            .await;
        assert!(result.is_err());

        let row: Option<Row> = store
            .run(TransactionMode::ReadOnly, |txn| txn.get(TARGETS, "a"))
            .await
            .unwrap();
        assert_eq!(row, None);
    }

    #[tokio::test]
    async fn scans_merge_staged_writes() {
        let store = KvStore::open(&unique_name("scan"));
        store
            .run(TransactionMode::ReadWrite, |txn| {
                txn.put(TARGETS, composite_key(["a", "1"]), &Row { n: 1 })?;
                txn.put(TARGETS, composite_key(["a", "2"]), &Row { n: 2 })?;
                txn.put(TARGETS, composite_key(["b", "1"]), &Row { n: 3 })
            })
            .await
            .unwrap();

        let rows = store
            .run(TransactionMode::ReadWrite, |txn| {
                txn.delete(TARGETS, composite_key(["a", "1"]))?;
                txn.put(TARGETS, composite_key(["a", "3"]), &Row { n: 4 })?;
                txn.scan_prefix::<Row>(TARGETS, &composite_key(["a", ""]))
            })
            .await
            .unwrap();
        let values: Vec<i64> = rows.into_iter().map(|(_, row)| row.n).collect();
        assert_eq!(values, vec![2, 4]);
    }

    #[tokio::test]
    async fn read_only_transactions_reject_writes() {
        let store = KvStore::open(&unique_name("readonly"));
        let result = store
            .run(TransactionMode::ReadOnly, |txn| txn.put(TARGETS, "a", &Row { n: 1 }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = KvStore::open(&unique_name("inject"));
        store.inject_failures(1);
        let first = store.run(TransactionMode::ReadOnly, |_| Ok(())).await;
        assert!(first.unwrap_err().is_storage_transaction_failure());
        assert!(store.run(TransactionMode::ReadOnly, |_| Ok(())).await.is_ok());
    }

    #[test]
    fn stores_are_shared_by_name() {
        let name = unique_name("shared");
        let first = KvStore::open(&name);
        let second = KvStore::open(&name);
        assert!(Arc::ptr_eq(&first, &second));
        first.set_zombied("client", true);
        assert!(second.is_zombied("client"));
    }
}
