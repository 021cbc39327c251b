//! OCI distribution-spec client over HTTP/1.1.
//!
//! Speaks the `/v2/` API: ping, tag resolution, manifest and blob fetch,
//! and the two-phase blob upload protocol. Bearer-token auth and a
//! caller-configurable retry policy are handled internally; request
//! bodies are replayable so retries never buffer uploads.

mod auth;

pub use auth::BasicAuth;
use auth::{TokenCache, parse_challenge};

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;

use crate::manifest::media_types;
use crate::{
    ContentClient, Descriptor, Digest, Error, ProgressEvent, ProgressHandler, PushSource, Result,
    emit,
};

/// Registry response header carrying the canonical content digest.
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Default cap for buffered (JSON) response bodies.
const DEFAULT_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

/// Retry behavior for transport failures and retryable statuses.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Sleep between attempts.
    pub retry_interval: Duration,
    /// Whether a status code warrants another attempt.
    pub should_retry: fn(u16) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_millis(500),
            should_retry: |status| status >= 500,
        }
    }
}

/// Construction options for [`RegistryClient`].
#[derive(Debug, Default)]
pub struct RegistryConfig {
    /// Use plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Non-default port.
    pub port: Option<u16>,
    /// Basic credentials used for token realms and direct auth.
    pub auth: Option<BasicAuth>,
    /// Retry policy; defaults to 3 retries on 5xx.
    pub retry: Option<RetryPolicy>,
    /// Cap for buffered JSON bodies; defaults to 4 MiB.
    pub buffer_limit: Option<usize>,
}

/// A client for one registry host.
///
/// Timeouts are the caller's concern: wrap calls in
/// `tokio::time::timeout` to impose a deadline. Dropping a returned
/// future aborts the underlying connection.
#[derive(Debug)]
pub struct RegistryClient {
    base: String,
    client: reqwest::Client,
    auth: Option<BasicAuth>,
    retry: RetryPolicy,
    buffer_limit: usize,
    tokens: TokenCache,
}

impl RegistryClient {
    /// Creates a client for `host`, honoring `HTTP_PROXY` when set.
    pub fn new(host: &str, config: RegistryConfig) -> Result<Self> {
        let scheme = if config.insecure { "http" } else { "https" };
        let base = match config.port {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };

        let mut builder = reqwest::Client::builder().http1_only();
        if let Ok(proxy) = std::env::var("HTTP_PROXY") {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            base,
            client: builder.build()?,
            auth: config.auth,
            retry: config.retry.unwrap_or_default(),
            buffer_limit: config.buffer_limit.unwrap_or(DEFAULT_BUFFER_LIMIT),
            tokens: TokenCache::default(),
        })
    }

    /// `GET /v2/` — verifies the host speaks the distribution API.
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/v2/", self.base);
        let response = self
            .send("registry:catalog:*", || async {
                Ok(self.client.get(&url))
            })
            .await?;
        expect_status(&response, &[StatusCode::OK])?;
        Ok(())
    }

    /// Sends a request, attaching credentials and handling the bearer
    /// challenge dance and the retry policy.
    ///
    /// `build` is invoked once per attempt so bodies are always fresh.
    async fn send<F, Fut>(&self, scope: &str, build: F) -> Result<Response>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<RequestBuilder>>,
    {
        let mut attempts = 0u32;
        let mut auth_retried = false;
        loop {
            let mut request = build().await?;
            if let Some(token) = self.tokens.get(scope).await {
                request = request.bearer_auth(token);
            } else if let Some(ref basic) = self.auth {
                request = request.basic_auth(&basic.username, Some(&basic.password));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) if attempts < self.retry.max_retries => {
                    tracing::debug!(error = %err, attempt = attempts, "retrying request");
                    attempts += 1;
                    tokio::time::sleep(self.retry.retry_interval).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let status = response.status();
            if (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN)
                && !auth_retried
            {
                let challenge = response
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_challenge);
                if let Some(challenge) = challenge {
                    self.tokens
                        .refresh(&self.client, self.auth.as_ref(), &challenge, scope)
                        .await?;
                    auth_retried = true;
                    continue;
                }
            }

            if (self.retry.should_retry)(status.as_u16()) && attempts < self.retry.max_retries {
                tracing::debug!(%status, attempt = attempts, "retrying on status");
                attempts += 1;
                tokio::time::sleep(self.retry.retry_interval).await;
                continue;
            }
            return Ok(response);
        }
    }

    fn content_url(&self, name: &str, descriptor: &Descriptor) -> String {
        let kind = if media_types::is_manifest_path(&descriptor.media_type) {
            "manifests"
        } else {
            "blobs"
        };
        format!("{}/v2/{name}/{kind}/{}", self.base, descriptor.digest)
    }

    /// Reads a response body into memory, enforcing the buffer limit.
    async fn read_limited(&self, mut response: Response) -> Result<Vec<u8>> {
        if let Some(len) = response.content_length() {
            if len as usize > self.buffer_limit {
                return Err(Error::Internal(format!(
                    "response of {len} bytes exceeds the {} byte buffer limit",
                    self.buffer_limit
                )));
            }
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.buffer_limit {
                return Err(Error::Internal(format!(
                    "response exceeds the {} byte buffer limit",
                    self.buffer_limit
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

impl ContentClient for RegistryClient {
    async fn resolve(&self, name: &str, reference: &str) -> Result<Descriptor> {
        let url = format!("{}/v2/{name}/manifests/{reference}", self.base);
        let scope = pull_scope(name);
        let response = self
            .send(&scope, || async {
                Ok(self
                    .client
                    .head(&url)
                    .header(reqwest::header::ACCEPT, media_types::MANIFEST_ACCEPT))
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{name}:{reference}")));
        }
        expect_status(&response, &[StatusCode::OK])?;

        let digest = header_str(&response, DOCKER_CONTENT_DIGEST)
            .ok_or_else(|| Error::Internal("missing Docker-Content-Digest header".into()))
            .and_then(|raw| Digest::parse(&raw))?;
        let media_type = header_str(&response, CONTENT_TYPE.as_str())
            .ok_or_else(|| Error::Internal("missing Content-Type header".into()))?;
        let size = header_str(&response, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Internal("missing Content-Length header".into()))?;

        tracing::debug!(%digest, %media_type, size, "resolved {name}:{reference}");
        Ok(Descriptor::new(media_type, digest, size))
    }

    async fn fetch_data(&self, name: &str, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let url = self.content_url(name, descriptor);
        let scope = pull_scope(name);
        let response = self
            .send(&scope, || async {
                Ok(self
                    .client
                    .get(&url)
                    .header(reqwest::header::ACCEPT, descriptor.media_type.as_str()))
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(descriptor.digest.to_string()));
        }
        expect_status(&response, &[StatusCode::OK])?;

        let body = self.read_limited(response).await?;
        let actual = Digest::compute(&body);
        if actual != descriptor.digest {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(body)
    }

    async fn fetch_blob(
        &self,
        name: &str,
        descriptor: &Descriptor,
        dest: &Path,
        progress: Option<&ProgressHandler>,
    ) -> Result<(u64, Digest)> {
        let url = format!("{}/v2/{name}/blobs/{}", self.base, descriptor.digest);
        let scope = pull_scope(name);
        let mut response = self
            .send(&scope, || async {
                Ok(self
                    .client
                    .get(&url)
                    .header(reqwest::header::ACCEPT, descriptor.media_type.as_str()))
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(descriptor.digest.to_string()));
        }
        expect_status(&response, &[StatusCode::OK])?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let result: Result<()> = async {
            while let Some(chunk) = response.chunk().await? {
                hasher.update(&chunk);
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
                emit(progress, &[ProgressEvent::AddSize(chunk.len() as u64)]);
            }
            file.flush().await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(err);
        }

        let actual = Digest::from_hex(&hex::encode(hasher.finalize()))?;
        if actual != descriptor.digest {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok((size, actual))
    }

    async fn push(
        &self,
        name: &str,
        reference: &str,
        descriptor: &Descriptor,
        source: PushSource,
        progress: Option<&ProgressHandler>,
    ) -> Result<()> {
        let scope = push_scope(name);
        if media_types::is_manifest_path(&descriptor.media_type) {
            self.push_manifest(name, reference, descriptor, source, progress, &scope)
                .await
        } else {
            self.push_blob(name, descriptor, source, progress, &scope)
                .await
        }
    }
}

impl RegistryClient {
    async fn push_manifest(
        &self,
        name: &str,
        reference: &str,
        descriptor: &Descriptor,
        source: PushSource,
        progress: Option<&ProgressHandler>,
        scope: &str,
    ) -> Result<()> {
        let target = manifest_target(reference);
        let url = format!("{}/v2/{name}/manifests/{target}", self.base);

        let head = self
            .send(scope, || async {
                Ok(self
                    .client
                    .head(&url)
                    .header(reqwest::header::ACCEPT, descriptor.media_type.as_str()))
            })
            .await?;
        if head.status() == StatusCode::OK {
            // Only a digest match proves the content is already there; a
            // tag can point anywhere.
            let existing = header_str(&head, DOCKER_CONTENT_DIGEST)
                .and_then(|raw| Digest::parse(&raw).ok());
            if existing.as_ref() == Some(&descriptor.digest) {
                push_done(descriptor, progress);
                return Err(Error::Exists(descriptor.digest.to_string()));
            }
        }

        let response = self
            .send(scope, || async {
                Ok(self
                    .client
                    .put(&url)
                    .header(CONTENT_TYPE, descriptor.media_type.as_str())
                    .body(source.body().await?))
            })
            .await?;
        expect_status(&response, &[StatusCode::CREATED, StatusCode::OK])?;
        verify_pushed_digest(&response, descriptor)?;
        push_done(descriptor, progress);
        Ok(())
    }

    async fn push_blob(
        &self,
        name: &str,
        descriptor: &Descriptor,
        source: PushSource,
        progress: Option<&ProgressHandler>,
        scope: &str,
    ) -> Result<()> {
        let head_url = format!("{}/v2/{name}/blobs/{}", self.base, descriptor.digest);
        let head = self
            .send(scope, || async { Ok(self.client.head(&head_url)) })
            .await?;
        if head.status() == StatusCode::OK {
            push_done(descriptor, progress);
            return Err(Error::Exists(descriptor.digest.to_string()));
        }

        let start_url = format!("{}/v2/{name}/blobs/uploads/", self.base);
        let started = self
            .send(scope, || async { Ok(self.client.post(&start_url)) })
            .await?;
        expect_status(&started, &[StatusCode::ACCEPTED])?;
        let location = header_str(&started, LOCATION.as_str())
            .ok_or_else(|| Error::Internal("upload start returned no Location".into()))?;
        let upload_url = upload_location(&self.base, &location, &descriptor.digest);

        let response = self
            .send(scope, || async {
                Ok(self
                    .client
                    .put(&upload_url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, descriptor.size)
                    .body(source.body().await?))
            })
            .await?;
        expect_status(&response, &[StatusCode::CREATED, StatusCode::NO_CONTENT])?;
        verify_pushed_digest(&response, descriptor)?;
        push_done(descriptor, progress);
        Ok(())
    }
}

/// Emits the completed-work events for one pushed descriptor.
fn push_done(descriptor: &Descriptor, progress: Option<&ProgressHandler>) {
    emit(
        progress,
        &[
            ProgressEvent::AddItems(1),
            ProgressEvent::AddSize(descriptor.size.max(0) as u64),
        ],
    );
}

/// The manifest path segment for a reference: its pinned digest when
/// present, the tag otherwise.
fn manifest_target(reference: &str) -> &str {
    if let Some((_, digest)) = reference.rsplit_once('@') {
        digest
    } else if let Some((_, tag)) = reference.rsplit_once(':') {
        tag
    } else {
        reference
    }
}

/// Resolves the upload `Location` and appends the digest query.
fn upload_location(base: &str, location: &str, digest: &Digest) -> String {
    let absolute = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_owned()
    } else {
        format!("{base}{location}")
    };
    let sep = if absolute.contains('?') { '&' } else { '?' };
    format!("{absolute}{sep}digest=sha256%3A{}", digest.hex())
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn expect_status(response: &Response, accepted: &[StatusCode]) -> Result<()> {
    if accepted.contains(&response.status()) {
        Ok(())
    } else {
        Err(Error::InvalidStatus {
            status: response.status().as_u16(),
            url: response.url().to_string(),
        })
    }
}

/// The final response of a push must name the digest we sent.
fn verify_pushed_digest(response: &Response, descriptor: &Descriptor) -> Result<()> {
    let returned = header_str(response, DOCKER_CONTENT_DIGEST)
        .ok_or_else(|| Error::Internal("push response carried no content digest".into()))
        .and_then(|raw| Digest::parse(&raw))?;
    if returned != descriptor.digest {
        return Err(Error::Internal(format!(
            "push digest mismatch: sent {}, registry recorded {returned}",
            descriptor.digest
        )));
    }
    Ok(())
}

fn pull_scope(name: &str) -> String {
    format!("repository:{name}:pull")
}

fn push_scope(name: &str) -> String {
    format!("repository:{name}:pull,push")
}
