//! Release registry client
//!
//! Lists the Sourcegraph versions that have been released. Only public
//! releases are eligible upgrade targets.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A release as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    pub version: String,
    #[serde(default)]
    pub public: bool,
}

/// Source of released versions
#[async_trait]
pub trait ReleaseRegistry: Send + Sync {
    async fn list_releases(&self) -> Result<Vec<Release>>;
}

/// Versions of all public releases
pub async fn public_versions<R: ReleaseRegistry + ?Sized>(registry: &R) -> Result<Vec<String>> {
    Ok(registry
        .list_releases()
        .await?
        .into_iter()
        .filter(|r| r.public)
        .map(|r| r.version)
        .collect())
}

/// HTTP client for the release registry
pub struct HttpReleaseRegistry {
    client: reqwest::Client,
    url: String,
}

impl HttpReleaseRegistry {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/releases/sourcegraph", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ReleaseRegistry for HttpReleaseRegistry {
    async fn list_releases(&self) -> Result<Vec<Release>> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(OperatorError::Http(format!(
                "release registry returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRegistry(Vec<Release>);

    #[async_trait]
    impl ReleaseRegistry for StaticRegistry {
        async fn list_releases(&self) -> Result<Vec<Release>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_release_deserialize() {
        let releases: Vec<Release> = serde_json::from_str(
            r#"[{"version": "5.3.0", "public": true}, {"version": "5.4.0-rc.1"}]"#,
        )
        .unwrap();
        assert!(releases[0].public);
        assert!(!releases[1].public);
    }

    #[test]
    fn test_url_is_normalized() {
        let registry = HttpReleaseRegistry::new("https://releases.example.com/").unwrap();
        assert_eq!(
            registry.url,
            "https://releases.example.com/v1/releases/sourcegraph"
        );
    }

    #[tokio::test]
    async fn test_only_public_versions() {
        let registry = StaticRegistry(vec![
            Release {
                version: "5.3.0".to_string(),
                public: true,
            },
            Release {
                version: "5.4.0".to_string(),
                public: false,
            },
        ]);
        assert_eq!(public_versions(&registry).await.unwrap(), vec!["5.3.0"]);
    }
}
