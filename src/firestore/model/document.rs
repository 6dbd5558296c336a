use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

/// A document known to exist, with its data at `version`.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: MapValue,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    pub fn new(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self {
            key,
            version,
            data,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn with_local_mutations(mut self) -> Self {
        self.has_local_mutations = true;
        self
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn into_data(self) -> MapValue {
        self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }
}

/// A document known not to exist at `version`.
#[derive(Clone, Debug, PartialEq)]
pub struct NoDocument {
    key: DocumentKey,
    version: SnapshotVersion,
    has_committed_mutations: bool,
}

impl NoDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            version,
            has_committed_mutations: false,
        }
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// A document whose existence is unknown; produced when a patch was
/// acknowledged for a document the client never read.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownDocument {
    key: DocumentKey,
    version: SnapshotVersion,
}

impl UnknownDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self { key, version }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
    Unknown(UnknownDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => doc.key(),
            MaybeDocument::NoDocument(doc) => doc.key(),
            MaybeDocument::Unknown(doc) => doc.key(),
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(doc) => doc.version(),
            MaybeDocument::Unknown(doc) => doc.version(),
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_pending_writes(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::Unknown(_) => true,
        }
    }

    pub fn has_committed_mutations(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_committed_mutations(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::Unknown(_) => true,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }

    pub fn is_no_document(&self) -> bool {
        matches!(self, MaybeDocument::NoDocument(_))
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

impl From<Document> for MaybeDocument {
    fn from(value: Document) -> Self {
        MaybeDocument::Document(value)
    }
}

impl From<NoDocument> for MaybeDocument {
    fn from(value: NoDocument) -> Self {
        MaybeDocument::NoDocument(value)
    }
}

impl From<UnknownDocument> for MaybeDocument {
    fn from(value: UnknownDocument) -> Self {
        MaybeDocument::Unknown(value)
    }
}
