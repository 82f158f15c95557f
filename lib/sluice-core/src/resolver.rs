//! Version resolution.
//!
//! Resolving never fails over to "update": when nothing strictly newer is known, when versions are malformed, or when
//! candidates tie with the current version, the current version is returned unchanged.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use semver::{Version, VersionReq};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::{debug, trace};

/// Version resolution error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ResolverError {
    /// The artifact reference could not be interpreted.
    #[snafu(display("invalid artifact reference '{}': {}", artifact, reason))]
    InvalidReference {
        /// Artifact reference.
        artifact: String,

        /// What is wrong with it.
        reason: String,
    },

    /// The artifact registry could not be reached.
    #[snafu(display("failed to query artifact registry for '{}': {}", artifact, source))]
    Request {
        /// Artifact reference.
        artifact: String,

        /// Underlying HTTP error.
        source: reqwest::Error,
    },

    /// The artifact registry returned an unexpected status.
    #[snafu(display("artifact registry returned {} for '{}'", status, artifact))]
    UnexpectedStatus {
        /// Artifact reference.
        artifact: String,

        /// HTTP status.
        status: StatusCode,
    },

    /// The artifact registry demanded authentication that could not be satisfied anonymously.
    #[snafu(display("artifact registry requires authentication for '{}': {}", artifact, reason))]
    Unauthorized {
        /// Artifact reference.
        artifact: String,

        /// Detail.
        reason: String,
    },
}

/// Determines whether a newer version of an artifact exists.
#[async_trait]
pub trait VersionResolver: Send + Sync {
    /// Returns the newest acceptable version of `artifact`, or `current_version` if there is none.
    ///
    /// Must not have side effects.
    async fn latest_version(
        &self, artifact: &str, current_version: &str, requirement: Option<&VersionReq>,
    ) -> Result<String, ResolverError>;
}

/// Parses a version tag leniently.
///
/// A leading `v` is accepted, and `major` or `major.minor` versions are padded with zeros, so `v1.2` parses as `1.2.0`.
/// Tags that are not versions at all, such as `latest` or `alpine`, return `None`.
pub fn parse_version(tag: &str) -> Option<Version> {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    if let Ok(version) = Version::parse(tag) {
        return Some(version);
    }

    let split_at = tag.find(['-', '+']).unwrap_or(tag.len());
    let (core, rest) = tag.split_at(split_at);
    let components = core.split('.').count();
    if core.is_empty() || components > 2 || !core.split('.').all(|c| !c.is_empty() && c.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }

    let padded = match components {
        1 => format!("{}.0.0{}", core, rest),
        _ => format!("{}.0{}", core, rest),
    };
    Version::parse(&padded).ok()
}

/// Chooses the candidate version from a list of available tags.
///
/// The candidate is the highest tag that parses as a version, satisfies `requirement`, is not a pre-release (unless
/// `allow_prerelease` is set), and is strictly newer than `current`. When several tags denote the same version, the
/// first one listed wins. If there is no such tag, or `current` itself is not a version, `current` is returned.
pub fn select_candidate(current: &str, tags: &[String], requirement: Option<&VersionReq>, allow_prerelease: bool) -> String {
    let Some(current_version) = parse_version(current) else {
        debug!(current, "Current version is not a semantic version. Treating as up to date.");
        return current.to_string();
    };

    let mut best: Option<(Version, &str)> = None;
    for tag in tags {
        let Some(version) = parse_version(tag) else {
            trace!(tag = %tag, "Ignoring non-version tag.");
            continue;
        };
        if !allow_prerelease && !version.pre.is_empty() {
            continue;
        }
        if requirement.is_some_and(|req| !req.matches(&version)) {
            continue;
        }
        if version <= current_version {
            continue;
        }
        if best.as_ref().map_or(true, |(best_version, _)| version > *best_version) {
            best = Some((version, tag.as_str()));
        }
    }

    best.map(|(_, tag)| tag.to_string()).unwrap_or_else(|| current.to_string())
}

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// A parsed OCI artifact reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageReference {
    /// Registry host, with port if any.
    pub registry: String,

    /// Repository path within the registry.
    pub repository: String,
}

impl ImageReference {
    /// Parses an artifact reference without a tag.
    ///
    /// The first path segment is a registry host if it contains a `.` or `:`, or is `localhost`; otherwise Docker Hub is
    /// assumed. Docker Hub names without a namespace live under `library/`.
    ///
    /// # Errors
    ///
    /// If the reference is empty or carries a tag or digest, an error is returned.
    pub fn parse(artifact: &str) -> Result<Self, ResolverError> {
        let invalid = |reason: &str| ResolverError::InvalidReference {
            artifact: artifact.to_string(),
            reason: reason.to_string(),
        };

        if artifact.is_empty() {
            return Err(invalid("empty reference"));
        }
        if artifact.contains('@') {
            return Err(invalid("digests are not supported"));
        }

        let (registry, repository) = match artifact.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), artifact.to_string()),
        };

        if repository.contains(':') {
            return Err(invalid("tags belong in the current version, not the artifact"));
        }

        let registry = if registry == "docker.io" || registry == "index.docker.io" {
            DOCKER_HUB_REGISTRY.to_string()
        } else {
            registry
        };
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self { registry, repository })
    }

    fn base_url(&self) -> String {
        let scheme = if self.registry.starts_with("localhost") || self.registry.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, self.registry)
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Default, Eq, PartialEq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let params = header.strip_prefix("Bearer ").or_else(|| header.strip_prefix("bearer "))?;

        let mut challenge = Self::default();
        for param in split_challenge_params(params) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }

        (!challenge.realm.is_empty()).then_some(challenge)
    }
}

/// Splits challenge parameters on commas that are not inside quotes.
fn split_challenge_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

/// Extracts the target of a `Link: <...>; rel="next"` header.
fn next_page(link: &str) -> Option<&str> {
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        params
            .contains("rel=\"next\"")
            .then(|| target.trim().trim_start_matches('<').trim_end_matches('>'))
    })
}

const MAX_TAG_PAGES: usize = 50;

/// Resolves versions by listing tags through the OCI distribution API.
///
/// Registries that answer with a bearer challenge are retried once with an anonymously obtained token.
pub struct RegistryResolver {
    client: reqwest::Client,
    allow_prerelease: bool,
}

impl RegistryResolver {
    /// Creates a new `RegistryResolver`.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be built, an error is returned.
    pub fn new(timeout: Duration, allow_prerelease: bool) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            allow_prerelease,
        })
    }

    async fn list_tags(&self, artifact: &str, reference: &ImageReference) -> Result<Vec<String>, ResolverError> {
        let base = reference.base_url();
        let mut url = format!("{}/v2/{}/tags/list", base, reference.repository);
        let mut token: Option<String> = None;
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let mut response = self.get(&url, token.as_deref(), artifact).await?;

            if response.status() == StatusCode::UNAUTHORIZED && token.is_none() {
                let challenge = response
                    .headers()
                    .get(header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(BearerChallenge::parse)
                    .ok_or_else(|| ResolverError::Unauthorized {
                        artifact: artifact.to_string(),
                        reason: "no bearer challenge offered".to_string(),
                    })?;
                token = Some(self.fetch_token(artifact, reference, &challenge).await?);
                response = self.get(&url, token.as_deref(), artifact).await?;
            }

            match response.status() {
                StatusCode::OK => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Unauthorized {
                        artifact,
                        reason: format!("registry returned {}", response.status()),
                    }
                    .fail()
                }
                status => return UnexpectedStatus { artifact, status }.fail(),
            }

            let next = response
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_page)
                .map(|target| {
                    if target.starts_with("http") {
                        target.to_string()
                    } else {
                        format!("{}{}", base, target)
                    }
                });

            let page: TagList = response.json().await.context(Request { artifact })?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(tags)
    }

    async fn get(&self, url: &str, token: Option<&str>, artifact: &str) -> Result<reqwest::Response, ResolverError> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.context(Request { artifact })
    }

    async fn fetch_token(
        &self, artifact: &str, reference: &ImageReference, challenge: &BearerChallenge,
    ) -> Result<String, ResolverError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let response = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .context(Request { artifact })?;
        if !response.status().is_success() {
            return Unauthorized {
                artifact,
                reason: format!("token endpoint returned {}", response.status()),
            }
            .fail();
        }

        let body: TokenResponse = response.json().await.context(Request { artifact })?;
        body.token.or(body.access_token).ok_or_else(|| ResolverError::Unauthorized {
            artifact: artifact.to_string(),
            reason: "token endpoint returned no token".to_string(),
        })
    }
}

#[async_trait]
impl VersionResolver for RegistryResolver {
    async fn latest_version(
        &self, artifact: &str, current_version: &str, requirement: Option<&VersionReq>,
    ) -> Result<String, ResolverError> {
        let reference = ImageReference::parse(artifact)?;
        let tags = self.list_tags(artifact, &reference).await?;
        let candidate = select_candidate(current_version, &tags, requirement, self.allow_prerelease);

        debug!(artifact, tags = tags.len(), current_version, candidate = %candidate, "Resolved latest version.");
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn lenient_parsing() {
        assert_eq!(parse_version("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("16"), Some(Version::new(16, 0, 0)));
        assert_eq!(parse_version("7.4"), Some(Version::new(7, 4, 0)));
        assert_eq!(parse_version("1.2-rc.1").map(|v| v.pre.to_string()), Some("rc.1".to_string()));
        assert_eq!(parse_version("latest"), None);
        assert_eq!(parse_version("16-alpine").map(|v| v.major), Some(16));
        assert_eq!(parse_version("1..2"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn picks_highest_newer_tag() {
        let available = tags(&["1.0.0", "1.2.0", "latest", "1.10.0", "1.9.9"]);
        assert_eq!(select_candidate("1.0.0", &available, None, false), "1.10.0");
    }

    #[test]
    fn returns_current_when_nothing_newer() {
        let available = tags(&["0.9.0", "1.0.0", "v1.0.0"]);
        assert_eq!(select_candidate("1.0.0", &available, None, false), "1.0.0");
        assert_eq!(select_candidate("1.0.0", &[], None, false), "1.0.0");
    }

    #[test]
    fn malformed_current_is_not_updated() {
        let available = tags(&["1.0.0", "2.0.0"]);
        assert_eq!(select_candidate("latest", &available, None, false), "latest");
    }

    #[test]
    fn prereleases_are_opt_in() {
        let available = tags(&["1.1.0-rc.1", "1.0.1"]);
        assert_eq!(select_candidate("1.0.0", &available, None, false), "1.0.1");
        assert_eq!(select_candidate("1.0.0", &available, None, true), "1.1.0-rc.1");
    }

    #[test]
    fn requirement_filters_candidates() {
        let available = tags(&["16.4", "16.6", "17.0", "17.2"]);
        let req = VersionReq::parse("^16").unwrap();
        assert_eq!(select_candidate("16.4", &available, Some(&req), false), "16.6");
        assert_eq!(select_candidate("16.4", &available, None, false), "17.2");
    }

    #[test]
    fn keeps_tag_spelling() {
        let available = tags(&["v2.0", "2.0.0"]);
        assert_eq!(select_candidate("v1.9", &available, None, false), "v2.0");
    }

    #[test]
    fn image_references() {
        let cases = [
            ("nginx", DOCKER_HUB_REGISTRY, "library/nginx"),
            ("docker.io/library/postgres", DOCKER_HUB_REGISTRY, "library/postgres"),
            ("docker.io/redis", DOCKER_HUB_REGISTRY, "library/redis"),
            ("bitnami/redis", DOCKER_HUB_REGISTRY, "bitnami/redis"),
            ("ghcr.io/sluice-rs/api", "ghcr.io", "sluice-rs/api"),
            ("localhost:5000/app", "localhost:5000", "app"),
        ];
        for (artifact, registry, repository) in cases {
            assert_eq!(
                ImageReference::parse(artifact).unwrap(),
                ImageReference {
                    registry: registry.to_string(),
                    repository: repository.to_string()
                },
                "{}",
                artifact
            );
        }

        assert!(ImageReference::parse("nginx:1.25").is_err());
        assert!(ImageReference::parse("nginx@sha256:abc").is_err());
        assert_eq!(
            ImageReference::parse("localhost:5000/app").unwrap().base_url(),
            "http://localhost:5000"
        );
    }

    #[test]
    fn bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        assert_eq!(
            BearerChallenge::parse(header),
            Some(BearerChallenge {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull".to_string()),
            })
        );
        assert_eq!(BearerChallenge::parse("Basic realm=\"x\""), None);

        let with_comma = r#"Bearer realm="https://ghcr.io/token",scope="repository:a/b:pull,push""#;
        assert_eq!(
            BearerChallenge::parse(with_comma).unwrap().scope.as_deref(),
            Some("repository:a/b:pull,push")
        );
    }

    #[test]
    fn link_pagination() {
        assert_eq!(
            next_page(r#"</v2/library/nginx/tags/list?last=1.25&n=100>; rel="next""#),
            Some("/v2/library/nginx/tags/list?last=1.25&n=100")
        );
        assert_eq!(next_page(r#"</v2/x>; rel="prev""#), None);
    }
}
