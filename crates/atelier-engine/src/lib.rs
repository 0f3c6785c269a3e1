use std::env;
use std::thread;

use anyhow::{bail, Context, Result};
use atelier_contracts::events::{EventLog, SessionEvent};
use atelier_contracts::history::{ImageData, ImageLineage, LineageState};
use atelier_contracts::keys::{ApiKeyPool, KeyAddReport};
use atelier_contracts::mask::{MaskConvention, MaskEncoder};
use atelier_contracts::models::{ModelCatalog, ModelSpec, Provider};
use atelier_contracts::modes::{AllSettings, ModeSettings, WorkMode};
use atelier_contracts::overlays::TextOverlay;
use atelier_contracts::store::KeyStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod prompt;

/// Key missing, invalid, or revoked. Always user-actionable: the caller is
/// expected to re-prompt for key selection, and the session evicts the
/// offending key from the pool when one is attributable.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ApiKeyError(pub String);

pub fn is_api_key_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ApiKeyError>().is_some())
}

/// Fully-resolved payload handed to one provider dispatch. Owned by the
/// dispatch call, never persisted.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub api_key: String,
    pub provider: Provider,
    pub model: ModelSpec,
    pub base_image: ImageData,
    pub background_image: Option<ImageData>,
    pub reference_image: Option<ImageData>,
    pub mask_png: Option<Vec<u8>>,
    pub instruction: String,
    pub settings: ModeSettings,
}

pub trait ImageProvider: Send + Sync {
    fn provider(&self) -> Provider;
    fn generate(&self, request: &GenerationRequest) -> Result<ImageData>;
    /// Minimal probe used at key-add time. Never errors: any network or
    /// auth failure, including a blank key, reads as invalid.
    fn validate_key(&self, api_key: &str) -> bool;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live() -> Self {
        let mut registry = Self::new();
        registry.register(GeminiProvider::new());
        registry.register(OpenAiProvider::new());
        registry
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers.push(Box::new(provider));
    }

    pub fn get(&self, provider: Provider) -> Option<&dyn ImageProvider> {
        self.providers
            .iter()
            .find(|item| item.provider() == provider)
            .map(|item| item.as_ref())
    }
}

/// Inline-multimodal provider: one generateContent call carrying ordered
/// binary+text parts, image-only response modality.
pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

const GEMINI_PROBE_MODEL: &str = "gemini-2.5-flash";

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_parts(request: &GenerationRequest) -> Vec<Value> {
        let mode = request.settings.mode();
        let mut parts = vec![inline_image_part(&request.base_image.mime, &request.base_image.bytes)];
        if mode == WorkMode::Creative {
            if let Some(mask) = request.mask_png.as_ref() {
                // Masks are always rasterized as PNG, whatever the base
                // image's original encoding.
                parts.push(inline_image_part("image/png", mask));
            }
            if let Some(reference) = request.reference_image.as_ref() {
                parts.push(inline_image_part(&reference.mime, &reference.bytes));
            }
        }
        if mode == WorkMode::Composite {
            if let Some(background) = request.background_image.as_ref() {
                parts.push(inline_image_part(&background.mime, &background.bytes));
            }
        }
        parts.push(json!({ "text": request.instruction }));
        parts
    }

    fn extract_inline_image(response_payload: &Value) -> Option<ImageData> {
        let candidates = response_payload.get("candidates")?.as_array()?;
        // Candidates may interleave commentary text with the image part;
        // scan past anything that is not a decodable inline image.
        for candidate in candidates {
            let Some(parts) = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for part in parts {
                let Some(inline) = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let Ok(bytes) = BASE64.decode(data.as_bytes()) else {
                    continue;
                };
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png");
                return Some(ImageData::new(bytes, mime));
            }
        }
        None
    }

    fn response_or_error(response: HttpResponse) -> Result<Value> {
        let status = response.status();
        let code = status.as_u16();
        let body = response
            .text()
            .context("Gemini response body read failed")?;
        if !status.is_success() {
            if body.contains("API_KEY_INVALID") || body.contains("API key not valid") {
                return Err(ApiKeyError(
                    "The Gemini API key in use is invalid or has been revoked. Select a \
                     different key in key management."
                        .to_string(),
                )
                .into());
            }
            bail!(
                "Gemini request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        serde_json::from_str(&body).context("Gemini returned invalid JSON payload")
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for GeminiProvider {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ImageData> {
        let endpoint = self.endpoint_for_model(&request.model.name);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": Self::build_parts(request),
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", request.api_key.as_str())])
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = Self::response_or_error(response)?;
        Self::extract_inline_image(&response_payload)
            .context("Gemini response did not contain an image")
    }

    fn validate_key(&self, api_key: &str) -> bool {
        if api_key.trim().is_empty() {
            return false;
        }
        let endpoint = self.endpoint_for_model(GEMINI_PROBE_MODEL);
        let payload = json!({
            "contents": [{ "parts": [{ "text": "test" }] }],
        });
        self.http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }
}

/// Form-upload provider with two independent request shapes.
///
/// When a mask is attached and the selected model carries the `edit`
/// capability, the edit endpoint receives the base image and mask as binary
/// form fields. Every other combination goes to the generation-only
/// endpoint, which takes the rendered instruction text alone — a supplied
/// base image is deliberately ignored there. That is a documented capability
/// gap of the protocol, not a bug: callers selecting a non-edit model get
/// pure text-to-image output.
pub struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
}

const OPENAI_OUTPUT_SIZE: &str = "1024x1024";

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn edit_image(&self, request: &GenerationRequest, mask_png: &[u8]) -> Result<ImageData> {
        let endpoint = format!("{}/images/edits", self.api_base);
        let image_part = MultipartPart::bytes(request.base_image.bytes.clone())
            .file_name("image.png")
            .mime_str(&request.base_image.mime)
            .with_context(|| format!("invalid mime '{}'", request.base_image.mime))?;
        let mask_part = MultipartPart::bytes(mask_png.to_vec())
            .file_name("mask.png")
            .mime_str("image/png")
            .context("invalid mask mime")?;
        let form = MultipartForm::new()
            .part("image", image_part)
            .part("mask", mask_part)
            .text("prompt", request.instruction.clone())
            .text("n", "1")
            .text("size", OPENAI_OUTPUT_SIZE)
            .text("response_format", "b64_json");

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&request.api_key)
            .multipart(form)
            .send()
            .context("OpenAI edits request failed")?;
        let payload = Self::response_or_error(response)?;
        Self::extract_b64_image(&payload)
    }

    fn generate_image(&self, request: &GenerationRequest) -> Result<ImageData> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let mut payload = json!({
            "model": request.model.name,
            "prompt": request.instruction,
            "n": 1,
            "size": OPENAI_OUTPUT_SIZE,
            "response_format": "b64_json",
        });
        if request.model.name == "dall-e-3" {
            payload["quality"] = Value::String("hd".to_string());
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&request.api_key)
            .json(&payload)
            .send()
            .context("OpenAI generations request failed")?;
        let parsed = Self::response_or_error(response)?;
        Self::extract_b64_image(&parsed)
    }

    fn response_or_error(response: HttpResponse) -> Result<Value> {
        let status = response.status();
        let code = status.as_u16();
        let body = response
            .text()
            .context("OpenAI response body read failed")?;
        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        if !status.is_success() {
            let error = parsed
                .as_ref()
                .and_then(|value| value.get("error"))
                .cloned()
                .unwrap_or(Value::Null);
            if error.get("code").and_then(Value::as_str) == Some("invalid_api_key") {
                return Err(ApiKeyError(
                    "The OpenAI API key is invalid. Check it in key management.".to_string(),
                )
                .into());
            }
            if let Some(message) = error.get("message").and_then(Value::as_str) {
                bail!("OpenAI request failed ({code}): {message}");
            }
            bail!(
                "OpenAI request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        parsed.context("OpenAI returned invalid JSON payload")
    }

    fn extract_b64_image(payload: &Value) -> Result<ImageData> {
        let b64 = payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("b64_json"))
            .and_then(Value::as_str)
            .context("OpenAI response returned no images")?;
        let bytes = BASE64
            .decode(b64.as_bytes())
            .context("OpenAI image base64 decode failed")?;
        Ok(ImageData::new(bytes, "image/png"))
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for OpenAiProvider {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ImageData> {
        if request.model.supports("edit") {
            if let Some(mask) = request.mask_png.as_ref() {
                return self.edit_image(request, mask);
            }
        }
        self.generate_image(request)
    }

    fn validate_key(&self, api_key: &str) -> bool {
        if api_key.trim().is_empty() {
            return false;
        }
        self.http
            .get(format!("{}/models", self.api_base))
            .bearer_auth(api_key)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }
}

/// One interactive editing session: the working image lineage, per-mode
/// settings, mask session, key pool and its durable store, and the provider
/// registry, stitched together behind the operations the UI calls.
///
/// Only one `generate` may be in flight at a time; the caller must disable
/// new invocations while one is pending. The session does not enforce
/// mutual exclusion itself.
pub struct EditSession {
    session_id: String,
    store: KeyStore,
    pool: ApiKeyPool,
    catalog: ModelCatalog,
    settings: AllSettings,
    active_mode: WorkMode,
    lineage: ImageLineage,
    mask: Option<MaskEncoder>,
    overlays: Vec<TextOverlay>,
    background_image: Option<ImageData>,
    reference_image: Option<ImageData>,
    providers: ProviderRegistry,
    events: EventLog,
}

impl EditSession {
    pub fn new(store: KeyStore, events_path: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::with_registry(store, events_path, ProviderRegistry::live())
    }

    pub fn with_registry(
        store: KeyStore,
        events_path: impl Into<std::path::PathBuf>,
        providers: ProviderRegistry,
    ) -> Result<Self> {
        let session_id = Uuid::new_v4().to_string();
        let events = EventLog::new(events_path.into(), session_id.clone());
        let pool = store.load();
        events.emit(&SessionEvent::SessionStarted {
            keystore: store.path().display().to_string(),
        })?;
        Ok(Self {
            session_id,
            store,
            pool,
            catalog: ModelCatalog::default(),
            settings: AllSettings::default(),
            active_mode: WorkMode::Portrait,
            lineage: ImageLineage::new(),
            mask: None,
            overlays: Vec::new(),
            background_image: None,
            reference_image: None,
            providers,
            events,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pool(&self) -> &ApiKeyPool {
        &self.pool
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn lineage(&self) -> &ImageLineage {
        &self.lineage
    }

    pub fn active_mode(&self) -> WorkMode {
        self.active_mode
    }

    pub fn active_settings(&self) -> ModeSettings {
        self.settings.active(self.active_mode)
    }

    pub fn overlays(&self) -> &[TextOverlay] {
        &self.overlays
    }

    pub fn mask_encoder(&self) -> Option<&MaskEncoder> {
        self.mask.as_ref()
    }

    // --- settings & mode -------------------------------------------------

    pub fn set_mode(&mut self, mode: WorkMode) {
        if mode != WorkMode::Composite {
            self.background_image = None;
        }
        if mode != WorkMode::Creative {
            self.reference_image = None;
        }
        self.mask = None;
        self.settings.switch_mode(mode);
        self.active_mode = mode;
    }

    pub fn update_settings(&mut self, patch: &Map<String, Value>) -> Result<ModeSettings> {
        let current = self.settings.active(self.active_mode);
        let engine_before = current.engine().clone();
        let merged = current.merged(patch, &self.catalog)?;
        if *merged.engine() != engine_before {
            // The mask convention is fixed per engine; restarting the mask
            // session keeps raster polarity and selection consistent.
            self.mask = None;
        }
        self.settings.replace(merged.clone());
        Ok(merged)
    }

    // --- images ----------------------------------------------------------

    pub fn load_image(&mut self, image: ImageData) -> Result<()> {
        self.lineage.load(image);
        self.mask = None;
        self.overlays.clear();
        self.events.emit(&SessionEvent::ImageLoaded)?;
        Ok(())
    }

    pub fn clear_image(&mut self) {
        self.lineage.clear();
        self.background_image = None;
        self.reference_image = None;
        self.mask = None;
        self.overlays.clear();
    }

    pub fn set_background_image(&mut self, image: Option<ImageData>) {
        self.background_image = image;
    }

    pub fn set_reference_image(&mut self, image: Option<ImageData>) {
        self.reference_image = image;
    }

    // --- mask session ----------------------------------------------------

    /// Starts a masking session on a surface of the given display size. The
    /// export convention is fixed now, from the currently selected engine,
    /// until the base image or provider changes.
    pub fn begin_masking(&mut self, width: u32, height: u32) -> Result<MaskConvention> {
        let engine = self.active_settings().engine().clone();
        let model = self
            .catalog
            .resolve(engine.provider, &engine.model)
            .with_context(|| format!("no models cataloged for {}", engine.provider))?;
        let convention = MaskConvention::for_model(&model);
        self.mask = Some(MaskEncoder::new(width, height, convention));
        Ok(convention)
    }

    pub fn add_mask_stroke(&mut self, from: (f32, f32), to: (f32, f32), brush_px: f32) {
        if let Some(encoder) = self.mask.as_mut() {
            encoder.add_segment(from, to, brush_px);
        }
    }

    pub fn resize_mask_surface(&mut self, width: u32, height: u32) {
        if let Some(encoder) = self.mask.as_mut() {
            encoder.resize(width, height);
        }
    }

    pub fn cancel_masking(&mut self) {
        self.mask = None;
    }

    // --- text overlays ---------------------------------------------------

    pub fn add_text_overlay(&mut self, text: impl Into<String>) -> &TextOverlay {
        self.overlays.push(TextOverlay::new(text));
        self.overlays.last().expect("overlay just pushed")
    }

    pub fn remove_text_overlay(&mut self, id: &str) -> bool {
        let before = self.overlays.len();
        self.overlays.retain(|overlay| overlay.id != id);
        self.overlays.len() != before
    }

    // --- key management --------------------------------------------------

    /// Validates and adds a batch of candidate keys for `provider`.
    ///
    /// Probes run concurrently, one per candidate; the pool is mutated once,
    /// after every probe has resolved, so a concurrent reader never observes
    /// a partially-applied batch. The report is informational: failures are
    /// never fatal, and a probe network error counts as an invalid key.
    pub fn add_keys(&mut self, provider: Provider, candidates: Vec<String>) -> Result<KeyAddReport> {
        let mut fresh: Vec<String> = Vec::new();
        for candidate in &candidates {
            let trimmed = candidate.trim().to_string();
            if trimmed.is_empty()
                || self.pool.contains(provider, &trimmed)
                || fresh.contains(&trimmed)
            {
                continue;
            }
            fresh.push(trimmed);
        }
        if fresh.is_empty() {
            return Ok(KeyAddReport {
                added: Vec::new(),
                failed: candidates,
            });
        }

        let provider_impl = self
            .providers
            .get(provider)
            .with_context(|| format!("provider '{provider}' not registered"))?;
        let verdicts: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = fresh
                .iter()
                .map(|key| {
                    let key = key.as_str();
                    scope.spawn(move || provider_impl.validate_key(key))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .collect()
        });

        let mut report = KeyAddReport::default();
        let mut valid = Vec::new();
        for (key, ok) in fresh.into_iter().zip(verdicts) {
            if ok {
                valid.push(key);
            } else {
                report.failed.push(key);
            }
        }

        // Single atomic replace of the pool, then persist.
        let mut next = self.pool.clone();
        report.added = next.add_keys(provider, valid);
        self.pool = next;
        self.store.save(&self.pool)?;

        self.events.emit(&SessionEvent::KeysAdded {
            provider,
            added: report.added.len(),
            failed: report.failed.len(),
        })?;
        Ok(report)
    }

    pub fn remove_key(&mut self, provider: Provider, key: &str) -> Result<bool> {
        let removed = self.pool.remove_key(provider, key);
        if removed {
            self.store.save(&self.pool)?;
        }
        Ok(removed)
    }

    pub fn set_active_key(&mut self, provider: Provider, key: &str) -> Result<()> {
        self.pool.set_active(provider, key)?;
        self.store.save(&self.pool)
    }

    // --- generation ------------------------------------------------------

    /// Runs one generation attempt and stages the result as pending.
    ///
    /// `flattened` carries the base image with text overlays baked in when
    /// any exist; flattening itself happens in the compositing collaborator.
    /// A failed attempt leaves the lineage in `Editing` and never mutates
    /// history; an `ApiKeyError` additionally evicts the key it is
    /// attributable to.
    pub fn generate(&mut self, prompt_hint: &str, flattened: Option<ImageData>) -> Result<()> {
        self.lineage.discard_pending();
        let settings = self.settings.active(self.active_mode);
        let engine = settings.engine().clone();
        let base_image = match flattened {
            Some(image) => image,
            None => self
                .lineage
                .current()
                .cloned()
                .context("no image loaded to edit")?,
        };
        let model = self
            .catalog
            .resolve(engine.provider, &engine.model)
            .with_context(|| format!("no models cataloged for {}", engine.provider))?;

        let mask = match (&self.mask, self.active_mode) {
            (Some(encoder), WorkMode::Creative) if !encoder.is_empty() => {
                Some((encoder.finish()?, encoder.convention()))
            }
            _ => None,
        };
        let reference_image = (self.active_mode == WorkMode::Creative)
            .then(|| self.reference_image.clone())
            .flatten();
        let background_image = (self.active_mode == WorkMode::Composite)
            .then(|| self.background_image.clone())
            .flatten();

        let instruction = prompt::compile(
            engine.provider,
            &settings,
            prompt_hint,
            mask.as_ref().map(|(_, convention)| *convention),
            reference_image.is_some(),
        );

        let pointer_before = self.pool.active().cloned();
        let Some(api_key) = self.pool.select_for(engine.provider) else {
            let error = ApiKeyError(format!(
                "No API key is set for {}. Open key management to add and select a key.",
                engine.provider
            ));
            self.events.emit(&SessionEvent::GenerationFailed {
                provider: engine.provider,
                error: error.to_string(),
            })?;
            return Err(error.into());
        };
        // A fallback promotion must be durable before the network call.
        if self.pool.active().cloned() != pointer_before {
            self.store.save(&self.pool)?;
        }

        self.events.emit(&SessionEvent::GenerationStarted {
            mode: self.active_mode,
            provider: engine.provider,
            model: model.name.clone(),
            masked: mask.is_some(),
        })?;

        let request = GenerationRequest {
            api_key: api_key.clone(),
            provider: engine.provider,
            model,
            base_image,
            background_image,
            reference_image,
            mask_png: mask.map(|(bytes, _)| bytes),
            instruction,
            settings,
        };
        let provider_impl = self
            .providers
            .get(engine.provider)
            .with_context(|| format!("provider '{}' not registered", engine.provider))?;

        match provider_impl.generate(&request) {
            Ok(image) => {
                self.lineage.stage_result(image)?;
                self.events.emit(&SessionEvent::ArtifactStaged {
                    artifact_id: short_id(&request.instruction),
                })?;
                Ok(())
            }
            Err(err) => {
                self.events.emit(&SessionEvent::GenerationFailed {
                    provider: engine.provider,
                    error: error_chain_text(&err, 2048),
                })?;
                if is_api_key_error(&err) {
                    self.pool.remove_key(engine.provider, &api_key);
                    self.store.save(&self.pool)?;
                    self.events.emit(&SessionEvent::KeyEvicted {
                        provider: engine.provider,
                    })?;
                }
                Err(err)
            }
        }
    }

    // --- history ---------------------------------------------------------

    pub fn commit_result(&mut self) -> Result<()> {
        self.lineage.commit()?;
        self.mask = None;
        self.events.emit(&SessionEvent::ResultCommitted)?;
        Ok(())
    }

    pub fn discard_result(&mut self) {
        self.lineage.discard_pending();
    }

    pub fn undo(&mut self) -> bool {
        let moved = self.lineage.undo();
        if moved {
            self.mask = None;
        }
        moved
    }

    pub fn redo(&mut self) -> bool {
        let moved = self.lineage.redo();
        if moved {
            self.mask = None;
        }
        moved
    }

    pub fn state(&self) -> LineageState {
        self.lineage.state()
    }
}

fn inline_image_part(mime: &str, bytes: &[u8]) -> Value {
    json!({
        "inlineData": {
            "mimeType": mime,
            "data": BASE64.encode(bytes),
        }
    })
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn short_id(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use tempfile::TempDir;

    use super::*;

    #[derive(Clone, Copy)]
    enum StubBehavior {
        Succeed,
        RejectKey,
        Explode,
    }

    struct StubProvider {
        provider: Provider,
        behavior: StubBehavior,
    }

    impl ImageProvider for StubProvider {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn generate(&self, _request: &GenerationRequest) -> Result<ImageData> {
            match self.behavior {
                StubBehavior::Succeed => Ok(ImageData::new(vec![0xAB], "image/png")),
                StubBehavior::RejectKey => {
                    Err(ApiKeyError("stub rejected the key".to_string()).into())
                }
                StubBehavior::Explode => Err(anyhow!("stub provider exploded")),
            }
        }

        fn validate_key(&self, api_key: &str) -> bool {
            api_key.starts_with("valid")
        }
    }

    fn session_with(behavior: StubBehavior) -> (EditSession, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let store = KeyStore::new(temp.path().join("keys.json"));
        let mut registry = ProviderRegistry::new();
        registry.register(StubProvider {
            provider: Provider::Gemini,
            behavior,
        });
        registry.register(StubProvider {
            provider: Provider::OpenAi,
            behavior,
        });
        let session =
            EditSession::with_registry(store, temp.path().join("events.jsonl"), registry).unwrap();
        (session, temp)
    }

    fn base_image() -> ImageData {
        ImageData::new(vec![1, 2, 3], "image/png")
    }

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn generate_with_empty_pool_fails_with_api_key_error_and_leaves_lineage() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        session.load_image(base_image())?;

        let err = session.generate("warm it up", None).unwrap_err();
        assert!(is_api_key_error(&err));
        assert!(err.to_string().contains("key management"));
        assert_eq!(session.state(), LineageState::Editing);
        assert_eq!(session.lineage().len(), 1);
        Ok(())
    }

    #[test]
    fn generate_with_no_image_fails_before_dispatch() {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        let err = session.generate("anything", None).unwrap_err();
        assert!(!is_api_key_error(&err));
        assert_eq!(session.state(), LineageState::Empty);
    }

    #[test]
    fn successful_generate_stages_then_commit_extends_history() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        session.load_image(base_image())?;
        let report = session.add_keys(Provider::Gemini, vec!["valid-g1".to_string()])?;
        assert_eq!(report.added, vec!["valid-g1".to_string()]);

        session.generate("soft light", None)?;
        assert_eq!(session.state(), LineageState::ResultPending);
        assert_eq!(session.lineage().len(), 1);

        session.commit_result()?;
        assert_eq!(session.state(), LineageState::Editing);
        assert_eq!(session.lineage().len(), 2);
        assert_eq!(session.lineage().current().unwrap().bytes, vec![0xAB]);
        Ok(())
    }

    #[test]
    fn api_key_error_evicts_the_offending_key() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::RejectKey);
        session.load_image(base_image())?;
        session.add_keys(Provider::Gemini, vec!["valid-bad".to_string()])?;
        assert!(session.pool().contains(Provider::Gemini, "valid-bad"));

        let err = session.generate("anything", None).unwrap_err();
        assert!(is_api_key_error(&err));
        assert!(!session.pool().contains(Provider::Gemini, "valid-bad"));
        assert!(session
            .pool()
            .active()
            .map(|active| active.key != "valid-bad")
            .unwrap_or(true));
        assert_eq!(session.state(), LineageState::Editing);
        Ok(())
    }

    #[test]
    fn generic_failure_keeps_pool_and_lineage_untouched() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Explode);
        session.load_image(base_image())?;
        session.add_keys(Provider::Gemini, vec!["valid-g1".to_string()])?;

        let err = session.generate("anything", None).unwrap_err();
        assert!(!is_api_key_error(&err));
        assert!(session.pool().contains(Provider::Gemini, "valid-g1"));
        assert_eq!(session.state(), LineageState::Editing);
        assert_eq!(session.lineage().len(), 1);
        Ok(())
    }

    #[test]
    fn add_keys_partitions_valid_and_invalid_candidates() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        let report = session.add_keys(
            Provider::OpenAi,
            vec!["valid-o1".to_string(), "bogus".to_string()],
        )?;
        assert_eq!(report.added, vec!["valid-o1".to_string()]);
        assert_eq!(report.failed, vec!["bogus".to_string()]);
        assert_eq!(session.pool().keys_for(Provider::OpenAi), ["valid-o1"]);
        Ok(())
    }

    #[test]
    fn add_keys_with_only_duplicates_reports_all_failed() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        session.add_keys(Provider::Gemini, vec!["valid-g1".to_string()])?;
        let report = session.add_keys(Provider::Gemini, vec!["valid-g1".to_string()])?;
        assert!(report.added.is_empty());
        assert_eq!(report.failed, vec!["valid-g1".to_string()]);
        assert_eq!(session.pool().keys_for(Provider::Gemini).len(), 1);
        Ok(())
    }

    #[test]
    fn fallback_promotion_is_persisted_before_dispatch() -> Result<()> {
        let (mut session, temp) = session_with(StubBehavior::Succeed);
        session.load_image(base_image())?;
        session.add_keys(Provider::Gemini, vec!["valid-g1".to_string()])?;
        session.add_keys(Provider::OpenAi, vec!["valid-o1".to_string()])?;
        session.set_active_key(Provider::Gemini, "valid-g1")?;

        let patch = patch(json!({"provider": "openai"}));
        session.update_settings(&patch)?;
        session.generate("anything", None)?;

        let reloaded = KeyStore::new(temp.path().join("keys.json")).load();
        let active = reloaded.active().cloned().unwrap();
        assert_eq!(active.provider, Provider::OpenAi);
        assert_eq!(active.key, "valid-o1");
        Ok(())
    }

    #[test]
    fn mode_switch_clears_aux_images_and_mask_session() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        session.load_image(base_image())?;
        session.set_mode(WorkMode::Creative);
        session.set_reference_image(Some(base_image()));
        session.begin_masking(320, 240)?;
        session.add_mask_stroke((10.0, 10.0), (50.0, 50.0), 12.0);
        assert!(session.mask_encoder().is_some());

        session.set_mode(WorkMode::Composite);
        assert!(session.mask_encoder().is_none());

        session.set_background_image(Some(base_image()));
        session.set_mode(WorkMode::Portrait);
        // Aux inputs do not survive leaving their owning modes.
        session.set_mode(WorkMode::Composite);
        Ok(())
    }

    #[test]
    fn engine_change_restarts_the_mask_session() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        session.load_image(base_image())?;
        session.set_mode(WorkMode::Creative);
        let convention = session.begin_masking(100, 100)?;
        assert_eq!(convention, MaskConvention::Protect);

        let patch = patch(json!({"provider": "openai", "model": "dall-e-2"}));
        session.update_settings(&patch)?;
        assert!(session.mask_encoder().is_none());

        let convention = session.begin_masking(100, 100)?;
        assert_eq!(convention, MaskConvention::Erase);
        Ok(())
    }

    #[test]
    fn load_image_clears_overlays_and_pending_state() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        session.load_image(base_image())?;
        session.add_text_overlay("caption");
        session.add_keys(Provider::Gemini, vec!["valid-g1".to_string()])?;
        session.generate("anything", None)?;
        assert_eq!(session.state(), LineageState::ResultPending);

        session.load_image(base_image())?;
        assert!(session.overlays().is_empty());
        assert_eq!(session.state(), LineageState::Editing);
        assert_eq!(session.lineage().len(), 1);
        Ok(())
    }

    #[test]
    fn undo_discards_pending_and_clears_mask() -> Result<()> {
        let (mut session, _temp) = session_with(StubBehavior::Succeed);
        session.load_image(base_image())?;
        session.add_keys(Provider::Gemini, vec!["valid-g1".to_string()])?;
        session.generate("one", None)?;
        session.commit_result()?;

        session.set_mode(WorkMode::Creative);
        session.begin_masking(64, 64)?;
        session.generate("two", None)?;
        assert_eq!(session.state(), LineageState::ResultPending);

        assert!(session.undo());
        assert_eq!(session.state(), LineageState::Editing);
        assert!(session.mask_encoder().is_none());
        assert!(session.redo());
        Ok(())
    }

    #[test]
    fn live_providers_fail_blank_keys_without_probing() {
        assert!(!GeminiProvider::new().validate_key("  "));
        assert!(!OpenAiProvider::new().validate_key(""));
    }

    #[test]
    fn gemini_parts_order_base_mask_reference_then_text() {
        let settings = ModeSettings::defaults(WorkMode::Creative);
        let request = GenerationRequest {
            api_key: "k".to_string(),
            provider: Provider::Gemini,
            model: ModelCatalog::default().get("gemini-2.5-flash-image").cloned().unwrap(),
            base_image: ImageData::new(vec![1], "image/jpeg"),
            background_image: None,
            reference_image: Some(ImageData::new(vec![2], "image/webp")),
            mask_png: Some(vec![3]),
            instruction: "do the thing".to_string(),
            settings,
        };
        let parts = GeminiProvider::build_parts(&request);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/webp");
        assert_eq!(parts[3]["text"], "do the thing");
    }

    #[test]
    fn gemini_extracts_first_inline_image_from_candidates() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here you go" },
                        { "inlineData": { "mimeType": "image/png", "data": BASE64.encode([9u8, 9, 9]) } }
                    ]
                }
            }]
        });
        let image = GeminiProvider::extract_inline_image(&payload).unwrap();
        assert_eq!(image.bytes, vec![9, 9, 9]);
        assert_eq!(image.mime, "image/png");

        assert!(GeminiProvider::extract_inline_image(&json!({"candidates": []})).is_none());
    }

    #[test]
    fn gemini_scans_past_commentary_parts_and_partless_candidates() {
        let payload = json!({
            "candidates": [
                { "finishReason": "STOP" },
                {
                    "content": {
                        "parts": [
                            { "text": "Here is your edited photo:" },
                            { "inlineData": { "mimeType": "image/jpeg", "data": BASE64.encode([4u8, 2]) } },
                            { "text": "Let me know about further tweaks." }
                        ]
                    }
                }
            ]
        });
        let image = GeminiProvider::extract_inline_image(&payload).unwrap();
        assert_eq!(image.bytes, vec![4, 2]);
        assert_eq!(image.mime, "image/jpeg");

        let text_only = json!({
            "candidates": [{ "content": { "parts": [{ "text": "no image today" }] } }]
        });
        assert!(GeminiProvider::extract_inline_image(&text_only).is_none());
    }

    #[test]
    fn openai_extracts_b64_payload() {
        let payload = json!({ "data": [ { "b64_json": BASE64.encode([7u8, 7]) } ] });
        let image = OpenAiProvider::extract_b64_image(&payload).unwrap();
        assert_eq!(image.bytes, vec![7, 7]);

        let empty = json!({ "data": [] });
        assert!(OpenAiProvider::extract_b64_image(&empty).is_err());
    }
}
