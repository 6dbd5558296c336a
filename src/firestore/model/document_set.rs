use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Orders documents by key only.
pub fn key_order_comparator() -> DocumentComparator {
    Arc::new(|left: &Document, right: &Document| left.key().cmp(right.key()))
}

#[derive(Clone)]
struct SortedEntry {
    document: Document,
    comparator: DocumentComparator,
}

impl PartialEq for SortedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortedEntry {}

impl PartialOrd for SortedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.comparator)(&self.document, &other.document)
            .then_with(|| self.document.key().cmp(other.document.key()))
    }
}

/// Documents kept both by key and in query order. Ties in the query
/// comparator are broken by key so the order is total.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: BTreeSet<SortedEntry>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: BTreeSet::new(),
        }
    }

    pub fn empty_by_key() -> Self {
        Self::new(key_order_comparator())
    }

    pub fn comparator(&self) -> DocumentComparator {
        Arc::clone(&self.comparator)
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.iter().next().map(|entry| &entry.document)
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.iter().next_back().map(|entry| &entry.document)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Document sorting immediately before `key`, if any.
    pub fn prev_doc(&self, key: &DocumentKey) -> Option<&Document> {
        let entry = self.entry_for(key)?;
        self.sorted
            .range(..entry)
            .next_back()
            .map(|entry| &entry.document)
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let entry = self.entry_for(key)?;
        Some(self.sorted.range(..entry).count())
    }

    /// Inserts or replaces a document.
    pub fn add(&mut self, document: Document) {
        self.delete(&document.key().clone());
        self.sorted.insert(SortedEntry {
            document: document.clone(),
            comparator: Arc::clone(&self.comparator),
        });
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.by_key.remove(key) {
            self.sorted.remove(&SortedEntry {
                document: existing,
                comparator: Arc::clone(&self.comparator),
            });
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Document> + '_ {
        self.sorted.iter().map(|entry| &entry.document)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> + '_ {
        self.by_key.keys()
    }

    pub fn to_vec(&self) -> Vec<Document> {
        self.iter().cloned().collect()
    }

    fn entry_for(&self, key: &DocumentKey) -> Option<SortedEntry> {
        self.by_key.get(key).map(|document| SortedEntry {
            document: document.clone(),
            comparator: Arc::clone(&self.comparator),
        })
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(l, r)| l == r)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}
