//! Offline-first client cache for Cloud Firestore.
//!
//! [`firestore::FirestoreClient`] keeps a local copy of the documents behind
//! every active query, applies writes optimistically and reconciles both
//! with the backend over the listen and write streams. Several clients may
//! share one cache; one of them holds the primary lease and talks to the
//! backend on behalf of the others.

pub mod firestore;
pub mod platform;
pub mod util;
