use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use url::Url;

use crate::capabilities::{CapabilityRegistry, ToastOptions};
use crate::LocalBoxFuture;

const UPLOAD_PATH: &str = "/api/images/upload";
const CSRF_PATH: &str = "/csrf-token";

/// Destination for converted companion assets. The production implementation
/// posts to the host's image-upload endpoint; tests substitute a recorder.
pub trait CompanionSink {
    fn upload<'a>(
        &'a self,
        base_name: &'a str,
        webp: &'a [u8],
    ) -> LocalBoxFuture<'a, Result<Value>>;
}

/// Uploads an animated webp companion into the host's per-user image folder
/// under the character's base name, authenticating with a CSRF token when
/// one is available. Outcomes are surfaced through the toast capability.
pub struct CompanionUploader {
    http: Client,
    base: Url,
    registry: Option<Rc<RefCell<CapabilityRegistry>>>,
    csrf_override: Option<String>,
    verbose: bool,
}

impl CompanionUploader {
    pub fn new(http: Client, base: Url, registry: Option<Rc<RefCell<CapabilityRegistry>>>) -> Self {
        Self {
            http,
            base,
            registry,
            csrf_override: None,
            verbose: false,
        }
    }

    pub fn with_csrf_override(mut self, token: Option<String>) -> Self {
        self.csrf_override = token;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// CSRF token, best effort: explicit override, then the host-registered
    /// token, then the token endpoint. Absence is not an error; the upload
    /// simply goes out unauthenticated and the server decides.
    async fn csrf_token(&self) -> Option<String> {
        if let Some(token) = &self.csrf_override {
            return Some(token.clone());
        }
        if let Some(registry) = &self.registry {
            if let Some(token) = registry.borrow().csrf_token() {
                return Some(token);
            }
        }
        let endpoint = self.base.join(CSRF_PATH).ok()?;
        let response = self
            .http
            .get(endpoint)
            .header("Cache-Control", "no-store")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        body.get("token")
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    async fn try_upload(&self, base_name: &str, webp: &[u8]) -> Result<Value> {
        let endpoint = self
            .base
            .join(UPLOAD_PATH)
            .context("failed to build companion upload URL")?;
        let payload = json!({
            "image": BASE64.encode(webp),
            "format": "webp",
            "ch_name": base_name,
            "filename": format!("{base_name}.webp"),
        });

        let mut request = self.http.post(endpoint).json(&payload);
        if let Some(token) = self.csrf_token().await {
            request = request.header("X-CSRF-Token", token);
        }

        let response = request
            .send()
            .await
            .context("companion upload request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("companion upload failed with status {status}");
        }
        Ok(response.json().await.unwrap_or_else(|_| json!({})))
    }

    pub async fn upload_companion(&self, base_name: &str, webp: &[u8]) -> Result<Value> {
        if self.verbose {
            eprintln!(
                "[DEBUG] uploading {} byte companion as {base_name}.webp",
                webp.len()
            );
        }
        match self.try_upload(base_name, webp).await {
            Ok(body) => {
                if let Some(toasts) = self.toasts() {
                    toasts.success("Upload finished, please reload.", None, ToastOptions::default());
                }
                Ok(body)
            }
            Err(error) => {
                if let Some(toasts) = self.toasts() {
                    toasts.error("Failed to upload animated avatar.", None, ToastOptions::default());
                }
                Err(error)
            }
        }
    }

    fn toasts(&self) -> Option<Rc<dyn crate::capabilities::ToastSink>> {
        self.registry.as_ref().and_then(|registry| registry.borrow().toasts())
    }
}

impl CompanionSink for CompanionUploader {
    fn upload<'a>(
        &'a self,
        base_name: &'a str,
        webp: &'a [u8],
    ) -> LocalBoxFuture<'a, Result<Value>> {
        Box::pin(self.upload_companion(base_name, webp))
    }
}
