//! Shared state handed to every connection task.

use std::sync::Arc;

use threadsync_core::Environment;

use crate::{
    collaborators::{
        Argon2Hasher, BoardDirectory, CaptchaPolicy, CaptchaVerifier, ImageStore, MemoryImages,
        PasswordHasher, PlainParser, PostParser,
    },
    config::PostingConfig,
    registry::SyncRegistry,
    storage::Storage,
};

/// Everything a request handler needs besides the per-connection [`Client`].
///
/// Cheap to clone: the store, registry and collaborators are shared handles.
///
/// [`Client`]: crate::Client
pub struct ServerContext<S: Storage, E> {
    /// Log store
    pub storage: S,
    /// Time and randomness
    pub env: E,
    /// Who follows which feed
    pub registry: SyncRegistry,
    /// Board configuration
    pub boards: Arc<dyn BoardDirectory>,
    /// Thread creation challenge check
    pub captcha: Arc<dyn CaptchaVerifier>,
    /// Post field parsing
    pub parser: Arc<dyn PostParser>,
    /// Post password hashing
    pub hasher: Arc<dyn PasswordHasher>,
    /// Processed images
    pub images: Arc<dyn ImageStore>,
    /// Posting limits
    pub posting: PostingConfig,
}

impl<S: Storage, E: Clone> Clone for ServerContext<S, E> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            env: self.env.clone(),
            registry: self.registry.clone(),
            boards: Arc::clone(&self.boards),
            captcha: Arc::clone(&self.captcha),
            parser: Arc::clone(&self.parser),
            hasher: Arc::clone(&self.hasher),
            images: Arc::clone(&self.images),
            posting: self.posting.clone(),
        }
    }
}

impl<S: Storage, E: Environment> ServerContext<S, E> {
    /// Context with default collaborators: captcha disabled, plain field
    /// parsing, Argon2 password hashing and an empty in-memory image store.
    pub fn new(storage: S, env: E, boards: impl BoardDirectory + 'static) -> Self {
        Self {
            storage,
            env,
            registry: SyncRegistry::new(),
            boards: Arc::new(boards),
            captcha: Arc::new(CaptchaPolicy::Disabled),
            parser: Arc::new(PlainParser),
            hasher: Arc::new(Argon2Hasher::default()),
            images: Arc::new(MemoryImages::new()),
            posting: PostingConfig::default(),
        }
    }

    /// Replace the captcha verifier.
    #[must_use]
    pub fn with_captcha(mut self, captcha: impl CaptchaVerifier + 'static) -> Self {
        self.captcha = Arc::new(captcha);
        self
    }

    /// Replace the field parser.
    #[must_use]
    pub fn with_parser(mut self, parser: impl PostParser + 'static) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    /// Replace the password hasher.
    #[must_use]
    pub fn with_hasher(mut self, hasher: impl PasswordHasher + 'static) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Replace the image store.
    #[must_use]
    pub fn with_images(mut self, images: Arc<dyn ImageStore>) -> Self {
        self.images = images;
        self
    }

    /// Replace the posting limits.
    #[must_use]
    pub fn with_posting(mut self, posting: PostingConfig) -> Self {
        self.posting = posting;
        self
    }
}
