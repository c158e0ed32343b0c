//! Client identity shared by every queue connection of the process.

use std::sync::OnceLock;

use tracing::info;
use uuid::Uuid;

/// Identifies this client to the queue server across connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_hash: String,
}

impl Session {
    fn generate() -> Self {
        Self {
            session_hash: Uuid::new_v4().to_string(),
        }
    }
}

/// Lazily creates the session on first use and hands out the same one afterwards
#[derive(Debug, Default)]
pub struct SessionProvider {
    session: OnceLock<Session>,
}

impl SessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_session(&self) -> &Session {
        self.session.get_or_init(|| {
            let session = Session::generate();
            info!(session_hash = %session.session_hash, "Created queue session");
            session
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_session_is_stable() {
        let provider = SessionProvider::new();
        let first = provider.get_session().clone();
        for _ in 0..10 {
            assert_eq!(provider.get_session(), &first);
        }
        assert!(Uuid::parse_str(&first.session_hash).is_ok());
    }

    #[test]
    fn test_concurrent_first_use_creates_one_session() {
        let provider = Arc::new(SessionProvider::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                std::thread::spawn(move || provider.get_session().session_hash.clone())
            })
            .collect();

        let hashes: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(hashes.iter().all(|hash| hash == &hashes[0]));
    }

    #[test]
    fn test_separate_providers_differ() {
        let a = SessionProvider::new();
        let b = SessionProvider::new();
        assert_ne!(a.get_session(), b.get_session());
    }
}
