//! Persistence sink for decrypted messages.

/// Somewhere to put each decrypted message. `persist` returns a per-message id
/// that increases with every call.
pub trait Storage: Send {
    fn persist(&mut self, plaintext: &[u8]) -> Result<u64, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
}

/// Keeps messages in memory. Used by tests and by hosts without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    messages: Vec<(u64, Vec<u8>)>,
    next_id: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> impl Iterator<Item = &[u8]> {
        self.messages.iter().map(|(_, m)| m.as_slice())
    }

    pub fn get(&self, id: u64) -> Option<&[u8]> {
        self.messages
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, m)| m.as_slice())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn persist(&mut self, plaintext: &[u8]) -> Result<u64, StorageError> {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push((id, plaintext.to_vec()));
        Ok(id)
    }
}
