//! Injectable SDK touchpoints for the token cache
//!
//! The cache talks to AWS through two seams: resolving a credentials
//! provider for a (region, named profile) pair, and presigning an RDS IAM
//! auth token with it. Production uses the real SDK; tests inject
//! deterministic fakes.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
};
use aws_sigv4::sign::v4;

use crate::error::{ProxyError, Result};

/// RDS IAM auth tokens are valid for 15 minutes; the service does not allow
/// longer presign windows.
const TOKEN_PRESIGN_LIFETIME: Duration = Duration::from_secs(900);

/// Resolves a credentials provider for a region and optional named profile.
#[async_trait]
pub trait CredentialsLoader: Send + Sync {
    async fn load(&self, region: &str, profile: Option<&str>) -> Result<SharedCredentialsProvider>;
}

/// Mints an RDS IAM auth token for one backend endpoint and database user.
#[async_trait]
pub trait TokenBuilder: Send + Sync {
    async fn build(
        &self,
        endpoint: &str,
        region: &str,
        db_user: &str,
        provider: &SharedCredentialsProvider,
    ) -> Result<String>;
}

/// Default loader backed by the AWS shared-config chain
/// (environment, shared config/credentials files, IMDS, SSO, ...).
pub struct SdkCredentialsLoader;

#[async_trait]
impl CredentialsLoader for SdkCredentialsLoader {
    async fn load(&self, region: &str, profile: Option<&str>) -> Result<SharedCredentialsProvider> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let sdk_config = loader.load().await;

        sdk_config
            .credentials_provider()
            .ok_or_else(|| ProxyError::Token("no credentials provider resolved".into()))
    }
}

/// Default builder: a SigV4 query-presigned request against the `rds-db`
/// service, which is exactly what the backend expects as a password.
pub struct SigV4TokenBuilder;

#[async_trait]
impl TokenBuilder for SigV4TokenBuilder {
    async fn build(
        &self,
        endpoint: &str,
        region: &str,
        db_user: &str,
        provider: &SharedCredentialsProvider,
    ) -> Result<String> {
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| ProxyError::Token(format!("resolve credentials: {}", e)))?;
        let identity = credentials.into();

        let mut settings = SigningSettings::default();
        settings.expires_in = Some(TOKEN_PRESIGN_LIFETIME);
        settings.signature_location = SignatureLocation::QueryParams;

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(region)
            .name("rds-db")
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| ProxyError::Token(format!("signing params: {}", e)))?;

        let unsigned = format!("https://{}/?Action=connect&DBUser={}", endpoint, db_user);
        let request = SignableRequest::new(
            "GET",
            &unsigned,
            std::iter::empty(),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| ProxyError::Token(format!("signable request: {}", e)))?;

        let (instructions, _signature) = sign(request, &params.into())
            .map_err(|e| ProxyError::Token(format!("presign: {}", e)))?
            .into_parts();

        let mut signed = url::Url::parse(&unsigned)
            .map_err(|e| ProxyError::Token(format!("parse signed url: {}", e)))?;
        for (name, value) in instructions.params() {
            signed.query_pairs_mut().append_pair(name, value);
        }

        // The token is the signed URL without its scheme.
        let token = signed.to_string();
        Ok(token
            .strip_prefix("https://")
            .unwrap_or(token.as_str())
            .to_string())
    }
}
