use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::PersistencePort;

/// Process-local flow store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Option<String>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `document`.
    pub fn with_contents(document: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(Some(document.into())),
            saves: AtomicUsize::new(0),
        }
    }

    /// The current document, if any.
    pub fn contents(&self) -> Option<String> {
        self.document.lock().ok().and_then(|d| d.clone())
    }

    /// How many times `save` has been called.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl PersistencePort for MemoryStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let document = self
                .document
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            Ok(document.clone())
        })
    }

    fn save(&self, document: &str) -> BoxFuture<'_, Result<()>> {
        let document = document.to_string();
        Box::pin(async move {
            let mut slot = self
                .document
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            *slot = Some(document);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_none());

        store.save("doc").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("doc"));
        assert_eq!(store.contents().as_deref(), Some("doc"));
        assert_eq!(store.save_count(), 1);
    }
}
