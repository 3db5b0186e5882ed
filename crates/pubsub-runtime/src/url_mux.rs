//! URL-based driver discovery.
//!
//! A [`UrlMux`] maps URL schemes to openers that build a [`Topic`] or
//! [`Subscription`] from a URL. Provider modules register their openers once;
//! applications then open handles from configuration strings such as
//! `mem://orders` without naming the provider in code.
//!
//! # Examples
//!
//! ```rust
//! use pubsub_runtime::providers::memory::MemoryUrlOpener;
//! use pubsub_runtime::UrlMux;
//! use std::sync::Arc;
//!
//! let mux = UrlMux::new();
//! let opener = Arc::new(MemoryUrlOpener::default());
//! mux.register_topic("mem", opener.clone());
//! mux.register_subscription("mem", opener);
//!
//! assert_eq!(mux.topic_schemes(), vec!["mem".to_string()]);
//! ```

use crate::error::PubSubError;
use crate::subscription::Subscription;
use crate::topic::Topic;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::debug;
use url::Url;

/// Opens topics from URLs.
///
/// Implementations must not depend on mutating the URL and must be safe to
/// call concurrently.
#[async_trait]
pub trait TopicUrlOpener: Send + Sync {
    /// Open the topic described by `url`.
    async fn open_topic_url(&self, url: &Url) -> Result<Topic, PubSubError>;
}

/// Opens subscriptions from URLs.
///
/// Implementations must not depend on mutating the URL and must be safe to
/// call concurrently.
#[async_trait]
pub trait SubscriptionUrlOpener: Send + Sync {
    /// Open the subscription described by `url`.
    async fn open_subscription_url(&self, url: &Url) -> Result<Subscription, PubSubError>;
}

// ============================================================================
// SchemeMap
// ============================================================================

/// Append-only map from URL scheme to opener.
pub struct SchemeMap<O: ?Sized> {
    kind: &'static str,
    openers: RwLock<HashMap<String, Arc<O>>>,
}

impl<O: ?Sized> SchemeMap<O> {
    /// Create an empty map for openers of `kind` ("Topic", "Subscription").
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            openers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `opener` for `scheme`.
    ///
    /// # Panics
    ///
    /// Panics if an opener is already registered for `scheme`.
    pub fn register(&self, scheme: &str, opener: Arc<O>) {
        let scheme = scheme.to_ascii_lowercase();
        let mut openers = self.openers.write().unwrap_or_else(PoisonError::into_inner);
        if openers.contains_key(&scheme) {
            panic!(
                "pubsub: {} scheme {:?} is already registered",
                self.kind, scheme
            );
        }
        debug!(kind = self.kind, scheme = %scheme, "Registered URL opener");
        openers.insert(scheme, opener);
    }

    /// Look up the opener for an already-parsed URL.
    pub fn lookup(&self, url: &Url) -> Result<Arc<O>, PubSubError> {
        self.openers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url.scheme())
            .cloned()
            .ok_or_else(|| PubSubError::NoProvider {
                kind: self.kind,
                scheme: url.scheme().to_string(),
            })
    }

    /// Parse `url` and look up the opener for its scheme.
    pub fn resolve(&self, url: &str) -> Result<(Arc<O>, Url), PubSubError> {
        let parsed = Url::parse(url).map_err(|err| PubSubError::InvalidUrl {
            url: url.to_string(),
            reason: match err {
                url::ParseError::RelativeUrlWithoutBase => "no scheme in URL".to_string(),
                other => other.to_string(),
            },
        })?;
        let opener = self.lookup(&parsed)?;
        Ok((opener, parsed))
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .openers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        schemes
    }
}

// ============================================================================
// UrlMux
// ============================================================================

/// URL opener multiplexer.
///
/// Matches the scheme of each URL against the registered schemes and calls
/// the matching opener. Safe for concurrent registration and lookup.
pub struct UrlMux {
    topics: SchemeMap<dyn TopicUrlOpener>,
    subscriptions: SchemeMap<dyn SubscriptionUrlOpener>,
}

impl UrlMux {
    /// Create a multiplexer with no registered schemes.
    pub fn new() -> Self {
        Self {
            topics: SchemeMap::new("Topic"),
            subscriptions: SchemeMap::new("Subscription"),
        }
    }

    /// Register a topic opener.
    ///
    /// # Panics
    ///
    /// Panics if a topic opener is already registered for `scheme`.
    pub fn register_topic(&self, scheme: &str, opener: Arc<dyn TopicUrlOpener>) {
        self.topics.register(scheme, opener);
    }

    /// Register a subscription opener.
    ///
    /// # Panics
    ///
    /// Panics if a subscription opener is already registered for `scheme`.
    pub fn register_subscription(&self, scheme: &str, opener: Arc<dyn SubscriptionUrlOpener>) {
        self.subscriptions.register(scheme, opener);
    }

    /// Parse `url` and open the topic it names.
    pub async fn open_topic(&self, url: &str) -> Result<Topic, PubSubError> {
        let (opener, url) = self.topics.resolve(url)?;
        opener.open_topic_url(&url).await
    }

    /// Parse `url` and open the subscription it names.
    pub async fn open_subscription(&self, url: &str) -> Result<Subscription, PubSubError> {
        let (opener, url) = self.subscriptions.resolve(url)?;
        opener.open_subscription_url(&url).await
    }

    /// Dispatch an already-parsed URL to its topic opener.
    pub async fn open_topic_url(&self, url: &Url) -> Result<Topic, PubSubError> {
        self.topics.lookup(url)?.open_topic_url(url).await
    }

    /// Dispatch an already-parsed URL to its subscription opener.
    pub async fn open_subscription_url(&self, url: &Url) -> Result<Subscription, PubSubError> {
        self.subscriptions
            .lookup(url)?
            .open_subscription_url(url)
            .await
    }

    /// Schemes with a registered topic opener.
    pub fn topic_schemes(&self) -> Vec<String> {
        self.topics.schemes()
    }

    /// Schemes with a registered subscription opener.
    pub fn subscription_schemes(&self) -> Vec<String> {
        self.subscriptions.schemes()
    }
}

impl Default for UrlMux {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Process-wide Default
// ============================================================================

/// The multiplexer used by [`open_topic`] and [`open_subscription`].
///
/// Starts with the in-memory provider registered under `mem`. Other provider
/// modules register their openers here.
pub fn default_url_mux() -> &'static UrlMux {
    static DEFAULT: OnceLock<UrlMux> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        let mux = UrlMux::new();
        crate::providers::memory::register(&mux);
        mux
    })
}

/// Open a topic through the default multiplexer.
pub async fn open_topic(url: &str) -> Result<Topic, PubSubError> {
    default_url_mux().open_topic(url).await
}

/// Open a subscription through the default multiplexer.
pub async fn open_subscription(url: &str) -> Result<Subscription, PubSubError> {
    default_url_mux().open_subscription(url).await
}

#[cfg(test)]
#[path = "url_mux_tests.rs"]
mod tests;
