use std::fmt::{Display, Formatter};

/// The user whose writes and cached data a client currently owns. Mutation
/// queues are partitioned by `uid`; `None` stands for the unauthenticated user.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition persisted per-user state.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_default()
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => write!(f, "User(anonymous)"),
        }
    }
}
