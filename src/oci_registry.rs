use crate::config::{Registry, Timeouts};
use crate::error::{EngineError, Result};
use crate::image_reference::ImageReference;
use crate::secret_string::SecretString;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

static DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
static MAX_TAG_PAGES: usize = 50;

pub fn create_client(timeouts: &Timeouts) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    Client::builder()
        .timeout(timeouts.registry())
        .user_agent(concat!("kube-tagwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// How to authenticate against one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCredentials {
    Anonymous,
    Bearer(SecretString),
    Basic {
        username: String,
        password: SecretString,
    },
}

impl From<&Registry> for RegistryCredentials {
    fn from(registry: &Registry) -> Self {
        if !registry.token.is_empty() {
            return RegistryCredentials::Bearer(registry.token.clone());
        }
        match (&registry.username, &registry.password) {
            (Some(username), Some(password)) => RegistryCredentials::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => RegistryCredentials::Anonymous,
        }
    }
}

impl RegistryCredentials {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            RegistryCredentials::Anonymous => request,
            RegistryCredentials::Bearer(token) => {
                request.header(AUTHORIZATION, token.bearer_header())
            }
            RegistryCredentials::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose_secret()))
            }
        }
    }
}

/// Lists the tags a registry holds for an image repository.
#[async_trait]
pub trait TagLister: Send + Sync {
    async fn list_tags(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Vec<String>>;
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Parameters of a `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parses `Bearer realm="...",service="...",scope="..."`. Quoted values may contain commas.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let (mut realm, mut service, mut scope) = (None, None, None);
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let after = after.trim_start();
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => after.split_at(after.find(',').unwrap_or(after.len())),
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    Some(BearerChallenge {
        realm: realm.filter(|r| !r.is_empty())?,
        service,
        scope,
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Talks the OCI distribution API (`/v2/<name>/tags/list`), following `Link` pagination.
pub struct OciRegistryClient {
    client: Client,
}

impl OciRegistryClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Exchanges a bearer challenge for a pull token. Only username and password are sent
    /// to the token endpoint; a static token has already been rejected by the registry.
    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<SecretString> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image.path()));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        debug!("Requesting registry token from {}", challenge.realm);
        let mut request = self.client.get(&challenge.realm).query(&query);
        if matches!(credentials, RegistryCredentials::Basic { .. }) {
            request = credentials.apply(request);
        }
        let response = request
            .send()
            .await
            .map_err(|e| registry_error(image, format!("token request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(registry_error(
                image,
                format!("token endpoint returned error status {}", response.status()),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| registry_error(image, format!("invalid token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .map(SecretString::new)
            .ok_or_else(|| registry_error(image, "token endpoint returned no token".to_string()))
    }
}

#[async_trait]
impl TagLister for OciRegistryClient {
    async fn list_tags(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Vec<String>> {
        let host = api_host(image.registry());
        let mut url = format!("https://{}/v2/{}/tags/list", host, image.path());
        let mut tags = Vec::new();
        let mut auth = credentials.clone();
        let mut exchanged = false;
        let mut pages = 0;

        while pages < MAX_TAG_PAGES {
            debug!("Fetching tag list from URL {}", url);
            let request = self.client.get(&url).header(ACCEPT, "application/json");
            let response = auth
                .apply(request)
                .send()
                .await
                .map_err(|e| registry_error(image, e.to_string()))?;

            if response.status() == StatusCode::UNAUTHORIZED && !exchanged {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_bearer_challenge);
                if let Some(challenge) = challenge {
                    auth = RegistryCredentials::Bearer(
                        self.fetch_token(&challenge, image, credentials).await?,
                    );
                    exchanged = true;
                    continue;
                }
            }
            pages += 1;

            if !response.status().is_success() {
                return Err(registry_error(
                    image,
                    format!("returned error status {} while listing tags", response.status()),
                ));
            }

            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| next_page_url(value, host));
            let page: TagList = response
                .json()
                .await
                .map_err(|e| registry_error(image, format!("invalid tag list body: {}", e)))?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = next,
                None => break,
            }
        }

        info!("Registry {} lists {} tags for {}", host, tags.len(), image.repository);
        Ok(tags)
    }
}

fn registry_error(image: &ImageReference, message: String) -> EngineError {
    EngineError::Registry {
        registry: image.registry().to_string(),
        message,
    }
}

fn api_host(registry: &str) -> &str {
    if registry == "docker.io" {
        DOCKER_HUB_API_HOST
    } else {
        registry
    }
}

/// Extracts the `rel="next"` target from a `Link` header, resolving relative paths.
fn next_page_url(link: &str, host: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        if target.starts_with("http://") || target.starts_with("https://") {
            Some(target.to_string())
        } else {
            Some(format!("https://{}{}", host, target))
        }
    })
}
