//! Protected media cache
//!
//! Attachments served by the auth-gated file endpoint are fetched once with
//! the bearer credential and replaced by a local `blob:` handle, so the
//! credential never ends up in a rendered URL. Direct links pass through.

use crate::api::normalize_base;
use crate::error::Result;
use crate::events::MediaRef;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const BLOB_SCHEME_PREFIX: &str = "blob:support-chat/";

/// Raw media returned by a fetcher
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Authenticated retrieval of stored media
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, bearer: Option<&str>) -> Result<FetchedMedia>;
}

/// Locally addressable copy of fetched media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub url: String,
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

type Slot = Arc<OnceCell<Arc<BlobHandle>>>;

#[derive(Default)]
struct CacheState {
    /// Resource url -> handle slot; a failed fetch leaves the slot empty
    slots: HashMap<String, Slot>,
    /// blob url -> resource url
    blobs: HashMap<String, String>,
    /// conversation id -> resource urls resolved for it
    by_conversation: HashMap<String, HashSet<String>>,
}

pub struct AttachmentStore {
    fetcher: Arc<dyn MediaFetcher>,
    file_base: Url,
    placeholder: String,
    bearer: Mutex<Option<String>>,
    state: Mutex<CacheState>,
}

impl AttachmentStore {
    /// `api_base_url` is the REST root; protected media lives under `file/`
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        api_base_url: &str,
        placeholder: impl Into<String>,
    ) -> Result<Self> {
        let file_base = normalize_base(api_base_url)?.join("file/")?;
        Ok(Self {
            fetcher,
            file_base,
            placeholder: placeholder.into(),
            bearer: Mutex::new(None),
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn set_bearer(&self, token: Option<String>) {
        *self.bearer.lock() = token;
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Protected resource url for a reference, `None` for direct links and
    /// for keys that are not a single plain path segment
    fn protected_url(&self, reference: &MediaRef) -> Option<Url> {
        match reference {
            MediaRef::Key(key) => self.key_url(key),
            MediaRef::Url(url) => {
                let parsed = Url::parse(url).ok()?;
                self.is_protected(&parsed).then_some(parsed)
            }
        }
    }

    fn key_url(&self, key: &str) -> Option<Url> {
        if !is_plain_key(key) {
            return None;
        }
        let mut url = self.file_base.clone();
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .push(key);
        Some(url)
    }

    /// Same origin as the file endpoint, and still under it once normalized
    fn is_protected(&self, url: &Url) -> bool {
        url.origin() == self.file_base.origin()
            && url.path().starts_with(self.file_base.path())
            && url.path().len() > self.file_base.path().len()
    }

    /// Turn a reference into something displayable.
    ///
    /// Never fails: a media fetch error yields the placeholder, which is not
    /// cached so a later call tries again.
    pub async fn resolve(&self, reference: &MediaRef) -> String {
        self.resolve_tracked(reference).await.0
    }

    /// Like [`resolve`](Self::resolve), remembering the handle as belonging
    /// to a conversation view for [`revoke_conversation`](Self::revoke_conversation)
    pub async fn resolve_in(&self, conversation_id: &str, reference: &MediaRef) -> String {
        let (url, resource) = self.resolve_tracked(reference).await;
        if let Some(resource) = resource {
            self.state
                .lock()
                .by_conversation
                .entry(conversation_id.to_string())
                .or_default()
                .insert(resource);
        }
        url
    }

    async fn resolve_tracked(&self, reference: &MediaRef) -> (String, Option<String>) {
        let Some(resource) = self.protected_url(reference) else {
            return match reference {
                MediaRef::Url(url) => (url.clone(), None),
                MediaRef::Key(key) => {
                    warn!(%key, "Unusable media key, using placeholder");
                    (self.placeholder.clone(), None)
                }
            };
        };

        let key = resource.to_string();
        let slot = self
            .state
            .lock()
            .slots
            .entry(key.clone())
            .or_default()
            .clone();
        let bearer = self.bearer.lock().clone();

        let fetched = slot
            .get_or_try_init(|| async {
                let media = self.fetcher.fetch(&resource, bearer.as_deref()).await?;
                let handle = BlobHandle {
                    url: format!("{BLOB_SCHEME_PREFIX}{}", Uuid::new_v4()),
                    bytes: media.bytes,
                    content_type: media.content_type,
                };
                debug!(resource = %key, blob = %handle.url, size = handle.bytes.len(), "Cached protected media");
                self.state
                    .lock()
                    .blobs
                    .insert(handle.url.clone(), key.clone());
                Ok::<_, crate::error::ChatError>(Arc::new(handle))
            })
            .await;

        match fetched {
            Ok(handle) => (handle.url.clone(), Some(key)),
            Err(e) => {
                warn!(resource = %key, "Media fetch failed, using placeholder: {}", e);
                (self.placeholder.clone(), None)
            }
        }
    }

    /// Bytes behind a blob url handed out by [`resolve`](Self::resolve)
    pub fn blob(&self, blob_url: &str) -> Option<BlobHandle> {
        let state = self.state.lock();
        let resource = state.blobs.get(blob_url)?;
        state
            .slots
            .get(resource)
            .and_then(|slot| slot.get())
            .map(|handle| handle.as_ref().clone())
    }

    /// Number of cached handles
    pub fn len(&self) -> usize {
        self.state.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the handles resolved for a conversation view. Returns how many went.
    pub fn revoke_conversation(&self, conversation_id: &str) -> usize {
        let mut state = self.state.lock();
        let Some(resources) = state.by_conversation.remove(conversation_id) else {
            return 0;
        };

        let mut revoked = 0;
        for resource in &resources {
            if let Some(slot) = state.slots.remove(resource) {
                if let Some(handle) = slot.get() {
                    state.blobs.remove(&handle.url);
                    revoked += 1;
                }
            }
        }
        for others in state.by_conversation.values_mut() {
            others.retain(|r| !resources.contains(r));
        }

        info!(conversation_id, revoked, "Revoked media handles");
        revoked
    }

    /// Drop every cached handle
    pub fn revoke_all(&self) -> usize {
        let mut state = self.state.lock();
        let revoked = state.blobs.len();
        *state = CacheState::default();
        info!(revoked, "Revoked all media handles");
        revoked
    }
}

/// A storage key names one object under the file endpoint
fn is_plain_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(['/', '\\', ':', '?', '#'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        fail: bool,
        last_bearer: Mutex<Option<String>>,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaFetcher for CountingFetcher {
        async fn fetch(&self, url: &Url, bearer: Option<&str>) -> Result<FetchedMedia> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(url.to_string());
            *self.last_bearer.lock() = bearer.map(str::to_string);
            if self.fail {
                return Err(ChatError::Http {
                    status: 401,
                    message: "unauthorized".to_string(),
                });
            }
            Ok(FetchedMedia {
                bytes: Bytes::from_static(b"png"),
                content_type: Some("image/png".to_string()),
            })
        }
    }

    fn cache(fetcher: Arc<CountingFetcher>) -> AttachmentStore {
        AttachmentStore::new(fetcher, "http://localhost:5000/api/", "/assets/placeholder.png")
            .unwrap()
    }

    #[tokio::test]
    async fn test_direct_url_passes_through() {
        let fetcher = Arc::new(CountingFetcher::default());
        let store = cache(fetcher.clone());
        let url = "https://cdn.example/a.png".to_string();

        assert_eq!(store.resolve(&MediaRef::Url(url.clone())).await, url);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_protected_key_fetched_once() {
        let fetcher = Arc::new(CountingFetcher::default());
        let store = cache(fetcher.clone());
        store.set_bearer(Some("token-1".to_string()));
        let key = MediaRef::Key("k-1".to_string());

        let first = store.resolve(&key).await;
        let second = store.resolve(&key).await;
        let by_url = store
            .resolve(&MediaRef::Url("http://localhost:5000/api/file/k-1".to_string()))
            .await;

        assert!(first.starts_with(BLOB_SCHEME_PREFIX));
        assert_eq!(first, second);
        assert_eq!(first, by_url);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.last_bearer.lock().as_deref(), Some("token-1"));
        assert_eq!(store.blob(&first).unwrap().bytes.as_ref(), b"png");
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_placeholder() {
        let fetcher = Arc::new(CountingFetcher {
            fail: true,
            ..Default::default()
        });
        let store = cache(fetcher.clone());
        let key = MediaRef::Key("k-1".to_string());

        assert_eq!(store.resolve(&key).await, "/assets/placeholder.png");
        assert_eq!(store.resolve(&key).await, "/assets/placeholder.png");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_conversation_drops_its_handles() {
        let fetcher = Arc::new(CountingFetcher::default());
        let store = cache(fetcher.clone());

        let a = store.resolve_in("u1", &MediaRef::Key("k-1".to_string())).await;
        store.resolve_in("u2", &MediaRef::Key("k-2".to_string())).await;
        assert_eq!(store.len(), 2);

        assert_eq!(store.revoke_conversation("u1"), 1);
        assert!(store.blob(&a).is_none());
        assert_eq!(store.len(), 1);

        // Re-resolving after revoke fetches again
        store.resolve_in("u1", &MediaRef::Key("k-1".to_string())).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        assert_eq!(store.revoke_all(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_key_stays_under_file_endpoint() {
        let fetcher = Arc::new(CountingFetcher::default());
        let store = cache(fetcher.clone());
        store.set_bearer(Some("secret-token".to_string()));

        for key in [
            "https://attacker.example/steal",
            "//evil.example/x",
            "../../admin/secret",
            "..",
            "",
            "a/b.png",
        ] {
            let resolved = store.resolve(&MediaRef::Key(key.to_string())).await;
            assert_eq!(resolved, "/assets/placeholder.png", "{key:?}");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

        store.resolve(&MediaRef::Key("photo 1.png".to_string())).await;
        assert_eq!(
            fetcher.urls.lock().as_slice(),
            ["http://localhost:5000/api/file/photo%201.png"]
        );
    }

    #[tokio::test]
    async fn test_foreign_url_is_not_fetched_with_bearer() {
        let fetcher = Arc::new(CountingFetcher::default());
        let store = cache(fetcher.clone());
        store.set_bearer(Some("secret-token".to_string()));

        let escaping = "http://localhost:5000/api/file/../../admin/secret".to_string();
        let lookalike = "http://localhost:5000.evil.example/api/file/k-1".to_string();
        let bare = "http://localhost:5000/api/file/".to_string();
        for url in [escaping, lookalike, bare] {
            assert_eq!(store.resolve(&MediaRef::Url(url.clone())).await, url);
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
