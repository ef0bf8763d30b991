use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mathdesk_contracts::messages::ImageReference;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use url::Url;

use crate::config::{AppConfig, KeyScheme, StoreKind};
use crate::error::{truncate_text, StoreError, TurnError, TurnResult};

/// Lifetime of the presigned upload URL; it is used immediately.
const PRESIGN_TTL: Duration = Duration::from_secs(300);

/// Accepts image bytes and hands back a stable reference to them.
pub trait ImageStore: Send + Sync {
    fn name(&self) -> &str;
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ImageReference>;
}

/// S3 bucket written through SigV4-presigned `PUT` URLs.
///
/// The returned reference comes from the public URL template, so the bucket
/// (or a CDN in front of it) must serve the object to the completion service.
pub struct S3ObjectStore {
    bucket: Bucket,
    credentials: Credentials,
    public_url_template: String,
    http: HttpClient,
}

impl S3ObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        region: &str,
        path_style: bool,
        credentials: Credentials,
        public_url_template: impl Into<String>,
        http: HttpClient,
    ) -> TurnResult<Self> {
        let endpoint: Url = endpoint.parse().map_err(|err| {
            TurnError::Config(format!("invalid store endpoint '{endpoint}': {err}"))
        })?;
        let style = if path_style {
            UrlStyle::Path
        } else {
            UrlStyle::VirtualHost
        };
        let bucket = Bucket::new(endpoint, style, bucket.to_string(), region.to_string())
            .map_err(|err| TurnError::Config(format!("invalid bucket '{bucket}': {err}")))?;
        Ok(Self {
            bucket,
            credentials,
            public_url_template: public_url_template.into(),
            http,
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        fill_public_url(&self.public_url_template, self.bucket.name(), key)
    }

    fn presigned_put_url(&self, key: &str) -> Url {
        self.bucket
            .put_object(Some(&self.credentials), key)
            .sign(PRESIGN_TTL)
    }
}

impl ImageStore for S3ObjectStore {
    fn name(&self) -> &str {
        "s3"
    }

    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ImageReference> {
        let request = self
            .http
            .put(self.presigned_put_url(key))
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec());
        send_upload(self.name(), request)?;
        Ok(ImageReference::Url(self.public_url(key)))
    }
}

/// Upload proxy reached with a plain `PUT {endpoint}/{bucket}/{key}` and an
/// optional bearer token. Requests are not signed.
pub struct GatewayObjectStore {
    endpoint: String,
    bucket: String,
    token: Option<String>,
    public_url_template: String,
    http: HttpClient,
}

impl GatewayObjectStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<String>,
        public_url_template: impl Into<String>,
        http: HttpClient,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token,
            public_url_template: public_url_template.into(),
            http,
        }
    }

    fn upload_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    pub fn public_url(&self, key: &str) -> String {
        fill_public_url(&self.public_url_template, &self.bucket, key)
    }
}

impl ImageStore for GatewayObjectStore {
    fn name(&self) -> &str {
        "gateway"
    }

    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<ImageReference> {
        let mut request = self
            .http
            .put(self.upload_url(key))
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec());
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        send_upload(self.name(), request)?;
        Ok(ImageReference::Url(self.public_url(key)))
    }
}

fn send_upload(store: &str, request: RequestBuilder) -> Result<(), StoreError> {
    let response = request.send().map_err(|source| StoreError::Transport {
        store: store.to_string(),
        source,
    })?;
    ensure_stored(store, response)
}

fn ensure_stored(store: &str, response: HttpResponse) -> Result<(), StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().unwrap_or_default();
    Err(StoreError::Rejected {
        store: store.to_string(),
        status: status.as_u16(),
        body: truncate_text(body.trim(), 512),
    })
}

fn fill_public_url(template: &str, bucket: &str, key: &str) -> String {
    template.replace("{bucket}", bucket).replace("{key}", key)
}

/// Keeps the image in the session itself as a base64 `data:` URL.
pub struct InlineImageStore;

impl ImageStore for InlineImageStore {
    fn name(&self) -> &str {
        "inline"
    }

    fn put(&self, _key: &str, bytes: &[u8], content_type: &str) -> Result<ImageReference> {
        Ok(ImageReference::Inline(format!(
            "data:{content_type};base64,{}",
            BASE64.encode(bytes)
        )))
    }
}

/// Writes uploads below a directory and returns `file://` URLs. Only useful
/// with completion services that can read local files (the dry-run one).
pub struct LocalImageStore {
    dir: PathBuf,
}

impl LocalImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.dir.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, bytes).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl ImageStore for LocalImageStore {
    fn name(&self) -> &str {
        "local"
    }

    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<ImageReference> {
        let path = self.write(key, bytes)?;
        let absolute = fs::canonicalize(&path).unwrap_or(path);
        Ok(ImageReference::Url(format!(
            "file://{}",
            absolute.to_string_lossy()
        )))
    }
}

pub fn image_store_from_config(
    config: &AppConfig,
    session_dir: &Path,
    http: HttpClient,
) -> TurnResult<Box<dyn ImageStore>> {
    if matches!(config.store, StoreKind::S3 | StoreKind::Gateway) && config.bucket.trim().is_empty()
    {
        return Err(TurnError::Config("missing image store bucket".to_string()));
    }
    let store: Box<dyn ImageStore> = match config.store {
        StoreKind::S3 => {
            let aws = config
                .aws
                .as_ref()
                .ok_or_else(|| TurnError::Config("missing AWS credentials".to_string()))?;
            Box::new(S3ObjectStore::new(
                &config.store_endpoint,
                &config.bucket,
                &config.region,
                config.path_style,
                Credentials::new(aws.access_key_id.clone(), aws.secret_access_key.clone()),
                config.public_url_template.clone(),
                http,
            )?)
        }
        StoreKind::Gateway => Box::new(GatewayObjectStore::new(
            config.store_endpoint.clone(),
            config.bucket.clone(),
            config.store_token.clone(),
            config.public_url_template.clone(),
            http,
        )),
        StoreKind::Inline => Box::new(InlineImageStore),
        StoreKind::Local => Box::new(LocalImageStore::new(
            config
                .store_dir
                .clone()
                .unwrap_or_else(|| session_dir.join("uploads")),
        )),
    };
    Ok(store)
}

/// Derives the object key for an upload from its original file name.
pub fn storage_key(scheme: KeyScheme, session_id: &str, file_name: &str, millis: i64) -> String {
    let name = sanitize_file_name(file_name);
    match scheme {
        KeyScheme::Flat => name,
        KeyScheme::Namespaced => format!("{}/{millis}-{name}", sanitize_file_name(session_id)),
    }
}

fn sanitize_file_name(raw: &str) -> String {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload.png".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use base64::Engine as _;
    use httpmock::prelude::*;
    use mathdesk_contracts::messages::ImageReference;
    use reqwest::blocking::Client as HttpClient;
    use rusty_s3::Credentials;

    use super::{
        storage_key, GatewayObjectStore, ImageStore, InlineImageStore, LocalImageStore,
        S3ObjectStore, BASE64,
    };
    use crate::config::{KeyScheme, DEFAULT_PUBLIC_URL_TEMPLATE};
    use crate::error::StoreError;

    fn s3_store(endpoint: &str) -> anyhow::Result<S3ObjectStore> {
        Ok(S3ObjectStore::new(
            endpoint,
            "gpt4o-funtest",
            "us-east-1",
            true,
            Credentials::new("AKIATEST", "secret"),
            DEFAULT_PUBLIC_URL_TEMPLATE,
            HttpClient::new(),
        )?)
    }

    #[test]
    fn flat_keys_are_the_file_name() {
        assert_eq!(
            storage_key(KeyScheme::Flat, "s-1", "problem 3.png", 42),
            "problem_3.png"
        );
    }

    #[test]
    fn namespaced_keys_prefix_session_and_time() {
        assert_eq!(
            storage_key(KeyScheme::Namespaced, "s-1", "photos/page.JPG", 1700),
            "s-1/1700-page.JPG"
        );
    }

    #[test]
    fn keys_never_escape_the_bucket() {
        assert_eq!(
            storage_key(KeyScheme::Flat, "s-1", "../../etc/passwd", 0),
            "passwd"
        );
        assert_eq!(storage_key(KeyScheme::Flat, "s-1", "..", 0), "upload.png");
        assert_eq!(storage_key(KeyScheme::Flat, "s-1", "", 0), "upload.png");
    }

    #[test]
    fn s3_upload_is_presigned_and_returns_public_url() -> anyhow::Result<()> {
        let server = MockServer::start();
        let upload = server.mock(|when, then| {
            when.method(PUT)
                .path("/gpt4o-funtest/problem.png")
                .query_param("X-Amz-Algorithm", "AWS4-HMAC-SHA256")
                .query_param_exists("X-Amz-Credential")
                .query_param_exists("X-Amz-Signature")
                .header("content-type", "image/png")
                .body("png-bytes");
            then.status(200);
        });

        let store = s3_store(&server.base_url())?;
        let reference = store.put("problem.png", b"png-bytes", "image/png")?;
        upload.assert();
        assert_eq!(
            reference,
            ImageReference::Url("https://gpt4o-funtest.s3.amazonaws.com/problem.png".to_string())
        );
        Ok(())
    }

    #[test]
    fn s3_presigned_url_carries_access_key() -> anyhow::Result<()> {
        let store = s3_store("https://s3.amazonaws.com")?;
        let url = store.presigned_put_url("a.png");
        let credential = url
            .query_pairs()
            .find(|(name, _)| name == "X-Amz-Credential")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        assert!(credential.starts_with("AKIATEST/"), "credential: {credential}");
        assert!(credential.contains("/us-east-1/s3/aws4_request"));
        Ok(())
    }

    #[test]
    fn s3_rejection_surfaces_status_and_body() -> anyhow::Result<()> {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/gpt4o-funtest/a.png");
            then.status(403).body("<Error><Code>AccessDenied</Code></Error>");
        });

        let err = s3_store(&server.base_url())?
            .put("a.png", b"x", "image/png")
            .unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::Rejected { store, status, body }) => {
                assert_eq!(store, "s3");
                assert_eq!(*status, 403);
                assert!(body.contains("AccessDenied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn unreachable_store_is_a_transport_error() -> anyhow::Result<()> {
        let err = s3_store("http://127.0.0.1:9")?
            .put("a.png", b"x", "image/png")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Transport { .. })
        ));
        Ok(())
    }

    #[test]
    fn gateway_sends_bearer_token() -> anyhow::Result<()> {
        let server = MockServer::start();
        let upload = server.mock(|when, then| {
            when.method(PUT)
                .path("/homework/s-1/1-a.png")
                .header("authorization", "Bearer tok");
            then.status(201);
        });

        let store = GatewayObjectStore::new(
            server.base_url(),
            "homework",
            Some("tok".to_string()),
            "https://cdn.example/{bucket}/{key}",
            HttpClient::new(),
        );
        let reference = store.put("s-1/1-a.png", b"x", "image/png")?;
        upload.assert();
        assert_eq!(reference.as_str(), "https://cdn.example/homework/s-1/1-a.png");
        Ok(())
    }

    #[test]
    fn inline_store_returns_data_url() -> anyhow::Result<()> {
        let reference = InlineImageStore.put("ignored", b"\x89PNG", "image/png")?;
        let ImageReference::Inline(data) = reference else {
            panic!("expected inline reference");
        };
        let encoded = data
            .strip_prefix("data:image/png;base64,")
            .unwrap_or_default();
        assert_eq!(BASE64.decode(encoded)?, b"\x89PNG");
        Ok(())
    }

    #[test]
    fn local_store_writes_file_and_returns_file_url() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = LocalImageStore::new(temp.path().join("uploads"));
        let reference = store.put("s-1/1-a.png", b"bytes", "image/png")?;
        let url = reference.as_str().to_string();
        assert!(url.starts_with("file://"), "unexpected url: {url}");
        assert!(url.ends_with("s-1/1-a.png"));
        assert_eq!(fs::read(store.dir().join("s-1/1-a.png"))?, b"bytes");
        Ok(())
    }

    #[test]
    fn local_store_io_failure_names_the_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("uploads");
        fs::write(&blocker, b"not a directory")?;

        let err = LocalImageStore::new(&blocker)
            .put("s-1/a.png", b"bytes", "image/png")
            .unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::Io { path, .. }) => assert!(path.starts_with(&blocker)),
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }
}
