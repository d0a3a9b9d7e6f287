//! Identity lookups against the execution platform.

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_ENDPOINT: &str = "https://api.roboto.ai";
pub const API_KEY_ENV: &str = "ROBOTO_API_KEY";
pub const ENDPOINT_ENV: &str = "ROBOTO_SERVICE_ENDPOINT";
/// Overrides the host credentials file location.
pub const CONFIG_FILE_ENV: &str = "ROBOTO_CONFIG_FILE";
pub const DEFAULT_PROFILE: &str = "default";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(
        "It appears you are not a member of a Roboto organization. Please create an organization \
         by logging into the web application (https://app.roboto.ai/) or try specifying the --org-id argument."
    )]
    NoOrganizations,

    #[error("No credentials found: set ROBOTO_API_KEY or create {path}")]
    CredentialsNotFound { path: String },

    #[error("Profile '{profile}' not found in {path}")]
    ProfileNotFound { profile: String, path: String },

    #[error("Profile '{profile}' in {path} has no api_key")]
    MissingApiKey { profile: String, path: String },

    #[error("Failed to read {path}: {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    ConfigParse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("Request to {url} returned {status}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },
}

/// One organization the caller belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrgRecord {
    pub org_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// The platform operations local invocation needs.
pub trait PlatformClient {
    fn endpoint(&self) -> &str;
    fn member_orgs(&self) -> Result<Vec<OrgRecord>, PlatformError>;
}

/// `--org-id` wins; otherwise the caller's first membership.
#[instrument(skip(client))]
pub fn resolve_org_id(
    explicit: Option<&str>,
    client: &dyn PlatformClient,
) -> Result<String, PlatformError> {
    if let Some(org_id) = explicit {
        return Ok(org_id.to_string());
    }

    let mut orgs = client.member_orgs()?;
    if orgs.is_empty() {
        return Err(PlatformError::NoOrganizations);
    }
    if orgs.len() > 1 {
        warn!(
            "Caller belongs to {} organizations, using {}. Pass --org-id to pick another.",
            orgs.len(),
            orgs[0].org_id
        );
    }
    let org = orgs.swap_remove(0);
    info!("Resolved organization {}", org.org_id);
    Ok(org.org_id)
}

/// Host path of the credentials file mounted into the container.
pub fn credentials_file() -> Option<PathBuf> {
    match env::var_os(CONFIG_FILE_ENV) {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => dirs::home_dir().map(|home| home.join(".roboto").join("config.json")),
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub endpoint: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Credentials {
    /// Resolve from the process environment, falling back to the profile file.
    pub fn resolve(
        profile: Option<&str>,
        config_file: Option<&Path>,
    ) -> Result<Self, PlatformError> {
        Self::from_sources(
            profile,
            env::var(API_KEY_ENV).ok(),
            env::var(ENDPOINT_ENV).ok(),
            config_file,
        )
    }

    /// An explicit profile always reads the file; otherwise an API key in the
    /// environment takes precedence. The endpoint variable overrides either.
    pub fn from_sources(
        profile: Option<&str>,
        env_api_key: Option<String>,
        env_endpoint: Option<String>,
        config_file: Option<&Path>,
    ) -> Result<Self, PlatformError> {
        let env_endpoint = env_endpoint.filter(|e| !e.is_empty());

        if profile.is_none() {
            if let Some(api_key) = env_api_key.filter(|k| !k.is_empty()) {
                debug!("Using credentials from {}", API_KEY_ENV);
                return Ok(Self {
                    api_key,
                    endpoint: env_endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
                });
            }
        }

        let path = config_file.ok_or_else(|| PlatformError::CredentialsNotFound {
            path: "~/.roboto/config.json".to_string(),
        })?;
        let mut credentials = Self::from_profile_file(path, profile)?;
        if let Some(endpoint) = env_endpoint {
            credentials.endpoint = endpoint;
        }
        Ok(credentials)
    }

    fn from_profile_file(path: &Path, profile: Option<&str>) -> Result<Self, PlatformError> {
        let path_str = path.display().to_string();
        if !path.is_file() {
            return Err(PlatformError::CredentialsNotFound { path: path_str });
        }
        let content = fs::read_to_string(path).map_err(|source| PlatformError::ConfigRead {
            path: path_str.clone(),
            source,
        })?;
        let file: ConfigFile =
            serde_json::from_str(&content).map_err(|source| PlatformError::ConfigParse {
                path: path_str.clone(),
                source,
            })?;

        let (name, entry) = match file {
            ConfigFile::Profiles {
                profiles,
                default_profile,
            } => {
                let name = profile
                    .map(str::to_string)
                    .or(default_profile)
                    .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
                let entry = profiles
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| PlatformError::ProfileNotFound {
                        profile: name.clone(),
                        path: path_str.clone(),
                    })?;
                (name, entry)
            }
            ConfigFile::Flat(entry) => {
                let name = profile.unwrap_or(DEFAULT_PROFILE).to_string();
                if name != DEFAULT_PROFILE {
                    return Err(PlatformError::ProfileNotFound {
                        profile: name,
                        path: path_str,
                    });
                }
                (name, entry)
            }
        };

        let entry: ProfileEntry =
            serde_json::from_value(entry).map_err(|source| PlatformError::ConfigParse {
                path: path_str.clone(),
                source,
            })?;
        let api_key = entry
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or(PlatformError::MissingApiKey {
                profile: name.clone(),
                path: path_str,
            })?;

        debug!("Using credentials from profile '{}'", name);
        Ok(Self {
            api_key,
            endpoint: entry
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    Profiles {
        profiles: serde_json::Map<String, Value>,
        #[serde(default)]
        default_profile: Option<String>,
    },
    Flat(Value),
}

#[derive(Deserialize)]
struct ProfileEntry {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Deserialize)]
struct Page<T> {
    data: Vec<T>,
}

/// HTTP client authenticated with a profile's API key.
#[derive(Debug)]
pub struct ProfileClient {
    credentials: Credentials,
    http: Client,
}

impl ProfileClient {
    pub fn new(credentials: Credentials) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| PlatformError::Http {
                url: credentials.endpoint.clone(),
                source,
            })?;
        Ok(Self { credentials, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.credentials.endpoint.trim_end_matches('/'), path)
    }
}

impl PlatformClient for ProfileClient {
    fn endpoint(&self) -> &str {
        &self.credentials.endpoint
    }

    fn member_orgs(&self) -> Result<Vec<OrgRecord>, PlatformError> {
        let url = self.url("/v1/orgs/caller-orgs");
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.credentials.api_key)
            .send()
            .map_err(|source| PlatformError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(PlatformError::HttpStatus {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let page: Page<OrgRecord> = response
            .json()
            .map_err(|source| PlatformError::Http { url, source })?;
        Ok(page.data)
    }
}
