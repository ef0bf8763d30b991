//! Typed session configuration, resolved once before a session starts.
//!
//! Sources in increasing precedence: an optional TOML secrets file, the
//! process environment, then explicit overrides (CLI flags). The result is
//! validated up front so a missing credential halts startup instead of
//! failing the first turn.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{TurnError, TurnResult};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_BUCKET: &str = "gpt4o-funtest";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_STORE_ENDPOINT: &str = "https://s3.amazonaws.com";
pub const DEFAULT_PUBLIC_URL_TEMPLATE: &str = "https://{bucket}.s3.amazonaws.com/{key}";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionProvider {
    OpenAi,
    Dryrun,
}

impl CompletionProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "dryrun" => Some(Self::Dryrun),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// S3 (or compatible) with SigV4-presigned uploads.
    S3,
    /// Upload proxy that takes a plain `PUT` with an optional bearer token.
    Gateway,
    Inline,
    Local,
}

impl StoreKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "s3" | "aws" => Some(Self::S3),
            "gateway" | "http" => Some(Self::Gateway),
            "inline" | "base64" => Some(Self::Inline),
            "local" | "file" => Some(Self::Local),
            _ => None,
        }
    }
}

/// How upload keys are derived from the uploaded file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    /// `{session_id}/{millis}-{file_name}`
    Namespaced,
    /// `{file_name}`; a later upload with the same name overwrites the object.
    Flat,
}

impl KeyScheme {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "namespaced" | "session" => Some(Self::Namespaced),
            "flat" | "filename" => Some(Self::Flat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsFile {
    pub timeout_secs: Option<u64>,
    pub completion: CompletionSection,
    pub store: StoreSection,
    pub aws: AwsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionSection {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub kind: Option<String>,
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub token: Option<String>,
    pub public_url_template: Option<String>,
    pub path_style: Option<bool>,
    pub dir: Option<PathBuf>,
    pub key_scheme: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AwsSection {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
}

impl SecretsFile {
    pub fn load(path: &Path) -> TurnResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            TurnError::Config(format!("failed reading {}: {err}", path.display()))
        })?;
        Self::parse(&raw)
            .map_err(|err| TurnError::Config(format!("{}: {err}", path.display())))
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Values supplied on the command line; `None` leaves lower sources in charge.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub store: Option<String>,
    pub bucket: Option<String>,
    pub store_dir: Option<PathBuf>,
    pub key_scheme: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: CompletionProvider,
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: Option<String>,
    pub store: StoreKind,
    pub store_endpoint: String,
    pub bucket: String,
    pub region: String,
    pub path_style: bool,
    pub aws: Option<AwsCredentials>,
    pub store_token: Option<String>,
    pub public_url_template: String,
    pub store_dir: Option<PathBuf>,
    pub key_scheme: KeyScheme,
    pub timeout: Duration,
}

impl AppConfig {
    /// Resolves and validates configuration from the secrets file (if any),
    /// the process environment and `overrides`.
    pub fn load(secrets_path: Option<&Path>, overrides: &ConfigOverrides) -> TurnResult<Self> {
        let file = match secrets_path {
            Some(path) => SecretsFile::load(path)?,
            None => SecretsFile::default(),
        };
        Self::from_sources(file, |key| env::var(key).ok(), overrides)
    }

    pub fn from_sources<F>(
        file: SecretsFile,
        lookup: F,
        overrides: &ConfigOverrides,
    ) -> TurnResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |keys: &[&str]| first_non_empty(&lookup, keys);

        let provider_raw = non_empty(overrides.provider.clone())
            .or_else(|| env_value(&["MATHDESK_PROVIDER"]))
            .or_else(|| non_empty(file.completion.provider.clone()))
            .unwrap_or_else(|| "openai".to_string());
        let provider = CompletionProvider::parse(&provider_raw).ok_or_else(|| {
            TurnError::Config(format!("unknown completion provider '{provider_raw}'"))
        })?;

        let store_raw = non_empty(overrides.store.clone())
            .or_else(|| env_value(&["MATHDESK_STORE"]))
            .or_else(|| non_empty(file.store.kind.clone()))
            .unwrap_or_else(|| "s3".to_string());
        let store = StoreKind::parse(&store_raw)
            .ok_or_else(|| TurnError::Config(format!("unknown image store '{store_raw}'")))?;

        let scheme_raw = non_empty(overrides.key_scheme.clone())
            .or_else(|| env_value(&["MATHDESK_STORE_KEY_SCHEME"]))
            .or_else(|| non_empty(file.store.key_scheme.clone()))
            .unwrap_or_else(|| "namespaced".to_string());
        let key_scheme = KeyScheme::parse(&scheme_raw)
            .ok_or_else(|| TurnError::Config(format!("unknown key scheme '{scheme_raw}'")))?;

        let api_base = env_value(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
            .or_else(|| non_empty(file.completion.api_base.clone()))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let env_timeout = parse_env::<u64>(
            env_value(&["MATHDESK_TIMEOUT_SECS"]),
            "MATHDESK_TIMEOUT_SECS",
        )?;
        let timeout_secs = overrides
            .timeout_secs
            .or(env_timeout)
            .or(file.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let env_path_style = parse_env::<bool>(
            env_value(&["MATHDESK_STORE_PATH_STYLE"]),
            "MATHDESK_STORE_PATH_STYLE",
        )?;

        let access_key_id = env_value(&["AWS_ACCESS_KEY_ID"])
            .or_else(|| non_empty(file.aws.access_key_id.clone()));
        let secret_access_key = env_value(&["AWS_SECRET_ACCESS_KEY"])
            .or_else(|| non_empty(file.aws.secret_access_key.clone()));
        let aws = match (access_key_id, secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(AwsCredentials {
                access_key_id,
                secret_access_key,
            }),
            _ => None,
        };

        let config = Self {
            provider,
            api_key: non_empty(overrides.api_key.clone())
                .or_else(|| env_value(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]))
                .or_else(|| non_empty(file.completion.api_key.clone())),
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            model: non_empty(overrides.model.clone())
                .or_else(|| env_value(&["MATHDESK_MODEL"]))
                .or_else(|| non_empty(file.completion.model.clone())),
            store,
            store_endpoint: env_value(&["MATHDESK_STORE_ENDPOINT"])
                .or_else(|| non_empty(file.store.endpoint.clone()))
                .unwrap_or_else(|| DEFAULT_STORE_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            bucket: non_empty(overrides.bucket.clone())
                .or_else(|| env_value(&["MATHDESK_STORE_BUCKET"]))
                .or_else(|| non_empty(file.store.bucket.clone()))
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            region: env_value(&["AWS_REGION", "AWS_DEFAULT_REGION"])
                .or_else(|| non_empty(file.aws.region.clone()))
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            path_style: env_path_style.or(file.store.path_style).unwrap_or(false),
            aws,
            store_token: env_value(&["MATHDESK_STORE_TOKEN"])
                .or_else(|| non_empty(file.store.token.clone())),
            public_url_template: env_value(&["MATHDESK_STORE_PUBLIC_URL"])
                .or_else(|| non_empty(file.store.public_url_template.clone()))
                .unwrap_or_else(|| DEFAULT_PUBLIC_URL_TEMPLATE.to_string()),
            store_dir: overrides
                .store_dir
                .clone()
                .or_else(|| env_value(&["MATHDESK_STORE_DIR"]).map(PathBuf::from))
                .or(file.store.dir),
            key_scheme,
            timeout: Duration::from_secs(timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TurnResult<()> {
        if self.provider == CompletionProvider::OpenAi && self.api_key.is_none() {
            return Err(TurnError::Config(
                "missing OpenAI API key (set OPENAI_API_KEY or [completion] api_key)".to_string(),
            ));
        }
        let remote_store = matches!(self.store, StoreKind::S3 | StoreKind::Gateway);
        if remote_store && self.bucket.trim().is_empty() {
            return Err(TurnError::Config(
                "missing image store bucket ([store] bucket)".to_string(),
            ));
        }
        if remote_store && !self.public_url_template.contains("{key}") {
            return Err(TurnError::Config(
                "public URL template must contain '{key}'".to_string(),
            ));
        }
        if self.store == StoreKind::S3 && self.aws.is_none() {
            return Err(TurnError::Config(
                "missing AWS credentials (set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY or \
                 [aws] access_key_id and secret_access_key)"
                    .to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TurnError::Config("timeout must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(raw: Option<String>, key: &str) -> TurnResult<Option<T>> {
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|_| TurnError::Config(format!("invalid {key} '{value}'")))
    })
    .transpose()
}

fn first_non_empty<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter().find_map(|key| non_empty(lookup(key)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
