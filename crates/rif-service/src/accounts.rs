use {
    rif::{AccountDirectory, Identifier},
    std::{collections::HashSet, sync::Mutex},
};

/// Accounts keyed by their identifier, kept in memory.
///
/// Stands in for the user store of the surrounding application. Identifiers
/// are bound once their registration passed the authoritative check.
#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    bound: Mutex<HashSet<Identifier>>,
}

impl InMemoryAccounts {
    pub fn new(identifiers: impl IntoIterator<Item = Identifier>) -> Self {
        Self {
            bound: Mutex::new(identifiers.into_iter().collect()),
        }
    }

    /// Binds the identifier to a new account. Returns `false` if it already
    /// was bound, for example by a concurrent registration.
    pub fn bind(&self, identifier: Identifier) -> bool {
        self.bound.lock().unwrap().insert(identifier)
    }

    pub fn len(&self) -> usize {
        self.bound.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl AccountDirectory for InMemoryAccounts {
    async fn is_registered(&self, identifier: &Identifier) -> bool {
        self.bound.lock().unwrap().contains(identifier)
    }
}
