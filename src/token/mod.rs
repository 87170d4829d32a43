//! Per-profile IAM auth-token cache
//!
//! Tokens are bearer credentials with a 15-minute service-side lifetime, so
//! the cache is deliberately simple: one mutex over both maps, released
//! across SDK calls. Concurrent mints for the same key may race; the last
//! writer wins, which is harmless because every minted token is valid.

mod credentials;

pub use credentials::{CredentialsLoader, SdkCredentialsLoader, SigV4TokenBuilder, TokenBuilder};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aws_credential_types::provider::SharedCredentialsProvider;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::Profile;
use crate::error::{ProxyError, Result};

/// One minted token and the instant the cache stops considering it usable.
///
/// `expires_at` is assigned from the configured TTL at insertion time, not
/// read out of the token itself, so the cache's freshness window can drift
/// from the service's acceptance window. Callers pick `refresh_before`
/// accordingly; `refresh_before >= token_ttl` forces a mint on every call.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TokenKey {
    profile_name: String,
    host: String,
    port: u16,
    region: String,
    db_user: String,
    aws_profile: Option<String>,
}

impl TokenKey {
    fn for_profile(p: &Profile) -> Self {
        Self {
            profile_name: p.name.clone(),
            host: p.rds_host.clone(),
            port: p.rds_port,
            region: p.rds_region.clone(),
            db_user: p.rds_db_user.clone(),
            aws_profile: p.aws_profile.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProviderKey {
    region: String,
    aws_profile: Option<String>,
}

impl ProviderKey {
    fn for_profile(p: &Profile) -> Self {
        Self {
            region: p.rds_region.clone(),
            aws_profile: p.aws_profile.clone(),
        }
    }
}

#[derive(Default)]
struct CacheState {
    tokens: HashMap<TokenKey, CachedToken>,
    providers: HashMap<ProviderKey, SharedCredentialsProvider>,
}

/// Process-wide token cache shared by every profile.
pub struct TokenCache {
    state: Mutex<CacheState>,
    refresh_before: Duration,
    token_ttl: Duration,
    loader: Arc<dyn CredentialsLoader>,
    builder: Arc<dyn TokenBuilder>,
}

impl TokenCache {
    /// Cache backed by the real AWS SDK.
    pub fn new(refresh_before: Duration, token_ttl: Duration) -> Self {
        Self::with_dependencies(
            refresh_before,
            token_ttl,
            Arc::new(SdkCredentialsLoader),
            Arc::new(SigV4TokenBuilder),
        )
    }

    /// Cache with injected SDK touchpoints.
    pub fn with_dependencies(
        refresh_before: Duration,
        token_ttl: Duration,
        loader: Arc<dyn CredentialsLoader>,
        builder: Arc<dyn TokenBuilder>,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            refresh_before,
            token_ttl,
            loader,
            builder,
        }
    }

    /// Return a fresh-enough token for the profile, minting one if needed.
    pub async fn get(&self, profile: &Profile) -> Result<CachedToken> {
        let key = TokenKey::for_profile(profile);

        {
            let state = self.state.lock();
            if let Some(entry) = state.tokens.get(&key) {
                if self.is_fresh(entry) {
                    return Ok(entry.clone());
                }
            }
        }

        let provider = self.provider_for(profile).await?;

        let value = self
            .builder
            .build(
                &profile.backend_addr(),
                &profile.rds_region,
                &profile.rds_db_user,
                &provider,
            )
            .await
            .map_err(|e| ProxyError::Token(format!("build auth token: {}", inner_message(e))))?;

        let fresh = CachedToken {
            value,
            expires_at: Utc::now() + self.token_ttl,
        };

        self.state.lock().tokens.insert(key, fresh.clone());
        Ok(fresh)
    }

    fn is_fresh(&self, entry: &CachedToken) -> bool {
        (entry.expires_at - Utc::now())
            .to_std()
            .map(|left| left > self.refresh_before)
            .unwrap_or(false)
    }

    async fn provider_for(&self, profile: &Profile) -> Result<SharedCredentialsProvider> {
        let key = ProviderKey::for_profile(profile);

        if let Some(provider) = self.state.lock().providers.get(&key) {
            return Ok(provider.clone());
        }

        let provider = self
            .loader
            .load(&profile.rds_region, profile.aws_profile.as_deref())
            .await
            .map_err(|e| ProxyError::Token(format!("load aws config: {}", inner_message(e))))?;

        self.state.lock().providers.insert(key, provider.clone());
        Ok(provider)
    }
}

/// Strip the Token variant's own prefix before re-wrapping with the stage
/// that failed, so errors read "build auth token: presign: ..." instead of
/// nesting the variant label twice.
fn inner_message(err: ProxyError) -> String {
    match err {
        ProxyError::Token(msg) => msg,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aws_credential_types::Credentials;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingLoader {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CredentialsLoader for CountingLoader {
        async fn load(&self, _: &str, _: Option<&str>) -> Result<SharedCredentialsProvider> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SharedCredentialsProvider::new(Credentials::new(
                "AKIA_TEST", "secret", None, None, "test",
            )))
        }
    }

    struct CountingBuilder {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenBuilder for CountingBuilder {
        async fn build(
            &self,
            endpoint: &str,
            _: &str,
            db_user: &str,
            _: &SharedCredentialsProvider,
        ) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("{}/{}#{}", endpoint, db_user, call))
        }
    }

    fn test_profile() -> Profile {
        Profile {
            name: "p1".into(),
            rds_host: "db.example".into(),
            rds_port: 3306,
            rds_region: "eu-west-1".into(),
            rds_db_user: "db_user_1".into(),
            aws_profile: Some("dev".into()),
            ..Profile::default()
        }
    }

    fn test_cache(
        refresh_before: Duration,
        token_ttl: Duration,
    ) -> (Arc<TokenCache>, Arc<CountingLoader>, Arc<CountingBuilder>) {
        let loader = Arc::new(CountingLoader {
            calls: AtomicU32::new(0),
        });
        let builder = Arc::new(CountingBuilder {
            calls: AtomicU32::new(0),
        });
        let cache = Arc::new(TokenCache::with_dependencies(
            refresh_before,
            token_ttl,
            loader.clone(),
            builder.clone(),
        ));
        (cache, loader, builder)
    }

    #[tokio::test]
    async fn test_cached_token_reused_before_refresh_window() {
        let (cache, _, builder) =
            test_cache(Duration::from_secs(5 * 60), Duration::from_secs(15 * 60));
        let profile = test_profile();

        let first = cache.get(&profile).await.unwrap();
        let second = cache.get(&profile).await.unwrap();

        assert_eq!(first.value, second.value);
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_before_at_or_above_ttl_mints_every_call() {
        // refresh_before > token_ttl leaves no freshness window at all.
        let (cache, _, builder) =
            test_cache(Duration::from_secs(20 * 60), Duration::from_secs(15 * 60));
        let profile = test_profile();

        let first = cache.get(&profile).await.unwrap();
        let second = cache.get(&profile).await.unwrap();

        assert_ne!(first.value, second.value);
        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_memoized_per_region_and_aws_profile() {
        // Token refresh forced every call; the provider must still load once.
        let (cache, loader, _) =
            test_cache(Duration::from_secs(20 * 60), Duration::from_secs(15 * 60));
        let profile = test_profile();

        cache.get(&profile).await.unwrap();
        cache.get(&profile).await.unwrap();

        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_regions_load_distinct_providers() {
        let (cache, loader, _) =
            test_cache(Duration::from_secs(20 * 60), Duration::from_secs(15 * 60));
        let mut a = test_profile();
        let mut b = test_profile();
        b.name = "p2".into();
        b.rds_region = "us-east-1".into();

        cache.get(&a).await.unwrap();
        cache.get(&b).await.unwrap();
        // Same (region, aws_profile) as `a`, no third load.
        a.name = "p3".into();
        cache.get(&a).await.unwrap();

        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiry_set_from_ttl() {
        let ttl = Duration::from_secs(15 * 60);
        let (cache, _, _) = test_cache(Duration::from_secs(5 * 60), ttl);
        let before = Utc::now();

        let token = cache.get(&test_profile()).await.unwrap();

        let lifetime = (token.expires_at - before).to_std().unwrap();
        assert!(lifetime <= ttl + Duration::from_secs(5));
        assert!(lifetime >= ttl - Duration::from_secs(5));
    }
}
