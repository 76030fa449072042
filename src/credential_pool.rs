use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::{ConfigError, ConfigResult};
use crate::error::{ProxyError, ProxyResult};

/// Opaque backend session token. Renders masked in logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn masked(&self) -> String {
        let visible: String = self.0.chars().take(6).collect();
        format!("{}…({} chars)", visible, self.0.chars().count())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.masked())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

#[derive(Debug)]
struct PoolState {
    credentials: Vec<Credential>,
    cursor: usize,
}

/// Round-robin pool of backend credentials shared by all in-flight requests.
///
/// `next` and `ban` are serialized by one mutex; callers never hold it
/// across backend I/O.
#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Build the pool from raw values. Entries are trimmed; blanks and
    /// duplicates are dropped. Rotation starts at a random offset.
    pub fn new<I, S>(values: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let credentials: Vec<Credential> = values
            .into_iter()
            .filter_map(|value| {
                let value = value.as_ref().trim();
                (!value.is_empty() && seen.insert(value.to_string())).then(|| Credential::new(value))
            })
            .collect();

        if credentials.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "arena_cookies".to_string(),
            });
        }

        let cursor = rand::rng().random_range(0..credentials.len());
        Ok(Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor,
            }),
        })
    }

    /// Return the credential under the cursor and advance it.
    pub fn next(&self) -> ProxyResult<Credential> {
        let mut state = self.state.lock();
        if state.credentials.is_empty() {
            return Err(ProxyError::PoolExhausted);
        }
        let credential = state.credentials[state.cursor].clone();
        state.cursor = (state.cursor + 1) % state.credentials.len();
        Ok(credential)
    }

    /// Permanently remove a credential. Removing one that is already gone
    /// is a no-op; removing the last one reports `PoolExhausted`.
    pub fn ban(&self, credential: &Credential) -> ProxyResult<()> {
        let mut state = self.state.lock();
        let Some(position) = state.credentials.iter().position(|c| c == credential) else {
            return Ok(());
        };
        state.credentials.remove(position);

        if state.credentials.is_empty() {
            state.cursor = 0;
            log::error!("Banned credential {}; no credentials left", credential);
            return Err(ProxyError::PoolExhausted);
        }

        // Keep the cursor on the member that followed the removed one.
        if position < state.cursor {
            state.cursor -= 1;
        }
        state.cursor %= state.credentials.len();
        log::warn!(
            "Banned credential {}; {} remaining",
            credential,
            state.credentials.len()
        );
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.state.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn snapshot(&self) -> Vec<Credential> {
        self.state.lock().credentials.clone()
    }
}
