use std::env;
use std::io::Cursor;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use atelier_contracts::chat::vocabulary::STYLE_VOCABULARY;
use atelier_contracts::chat::{
    classify_keywords, is_acknowledgement, AspectRatio, Classification, ContentKind, ExplicitMode,
    GenerationParams, Intent, ProductKind,
};
use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::media::{DirMediaStore, MediaStore};
use atelier_contracts::sessions::{memory, SessionStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, DynamicImage, Frame, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

const TEXT_REQUEST_TIMEOUT_S: u64 = 30;
const IMAGE_REQUEST_TIMEOUT_S: u64 = 90;
const EDIT_REQUEST_TIMEOUT_S: u64 = 120;
const DOWNLOAD_TIMEOUT_S: u64 = 60;

const HISTORY_TURNS: usize = 8;
const LOOP_FRAME_COUNT: u32 = 4;
const LOOP_FRAME_DELAY_MS: u32 = 500;
const MOCK_FRAME_SEED_STRIDE: u64 = 137;
const DESIGN_OPACITY: f32 = 0.85;
const PRESERVE_COMPOSITION_QUALIFIER: &str = "preserving the original composition";

const CREATIVE_SYSTEM_PROMPT: &str = "You are Atelier, an AI creative studio assistant. You help \
users create visual content like artworks, posters, brand visuals, and vision boards. When the \
user asks you to create something, respond with a warm, concise note (2-3 sentences) describing \
what you made, mention the styles you explored, and offer to iterate.";

const TEXT_ONLY_SYSTEM_PROMPT: &str = "You are Atelier, a creative AI assistant. If the user asks \
for a poem, story, script, or other creative text, write it. If the user asks general questions, \
answer them helpfully. Keep your tone witty and imaginative.";

const CLASSIFIER_INSTRUCTION: &str = "Classify the following user message into exactly ONE of \
these categories: text_only, image_generation, image_transformation, poster_design, vision_board, \
brand_artwork, story_sequence, video_loop, product_mockup. Respond ONLY with the category name.";

/// One creative request, immutable once received.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub text: String,
    pub attached_image: Option<Vec<u8>>,
    pub explicit_mode: Option<ExplicitMode>,
    pub refinement_target: Option<String>,
}

impl Request {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One generated output unit attached to the response.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub content_kind: ContentKind,
    pub title: String,
    pub description: String,
    pub location: String,
    pub prompt_used: String,
}

impl Artifact {
    pub fn to_json(&self) -> Value {
        json!({
            "content_kind": self.content_kind.as_str(),
            "title": self.title,
            "description": self.description,
            "location": self.location,
            "prompt_used": self.prompt_used,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub intent: Intent,
    pub confidence: f64,
    pub response_text: String,
    pub artifacts: Vec<Artifact>,
}

impl OrchestrationResult {
    pub fn to_json(&self) -> Value {
        json!({
            "intent": self.intent.as_str(),
            "confidence": self.confidence,
            "response_text": self.response_text,
            "artifacts": self.artifacts.iter().map(Artifact::to_json).collect::<Vec<Value>>(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub system: String,
    pub history: Vec<(String, String)>,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub n: u32,
    pub source_image: Option<ImageBytes>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
}

/// Text-generation capability: produce a reply from a prompt plus recent
/// conversation turns.
pub trait TextStrategy {
    fn name(&self) -> &str;
    fn complete(&self, request: &TextRequest) -> Result<String>;
}

/// Image-generation capability, covering both text-to-image and, when
/// `source_image` is present, image-to-image.
pub trait ImageStrategy {
    fn name(&self) -> &str;
    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>>;
}

/// Asynchronous video generation: submit, poll to a terminal state, download.
pub trait VideoStrategy {
    fn name(&self) -> &str;
    fn attempt(&self, request: &VideoRequest) -> Result<ImageBytes>;
}

/// Tries each strategy in order and stops at the first usable result. Every
/// failure is downgraded to a logged fallthrough; `None` means the chain is
/// exhausted and the caller owns the deterministic fallback.
pub fn run_chain<S, R, N, F>(
    events: &EventWriter,
    kind: &str,
    strategies: &[S],
    mut strategy_name: N,
    mut attempt: F,
) -> Option<(String, R)>
where
    N: FnMut(&S) -> String,
    F: FnMut(&S) -> Result<R>,
{
    for strategy in strategies {
        let name = strategy_name(strategy);
        let _ = events.emit(
            "provider_attempt",
            map_object(json!({ "kind": kind, "provider": name })),
        );
        match attempt(strategy) {
            Ok(result) => {
                let _ = events.emit(
                    "provider_result",
                    map_object(json!({ "kind": kind, "provider": name, "ok": true })),
                );
                return Some((name, result));
            }
            Err(err) => {
                let _ = events.emit(
                    "provider_result",
                    map_object(json!({
                        "kind": kind,
                        "provider": name,
                        "ok": false,
                        "error": error_chain_text(&err, 512),
                    })),
                );
            }
        }
    }
    let _ = events.emit(
        "chain_exhausted",
        map_object(json!({ "kind": kind, "strategies": strategies.len() })),
    );
    None
}

pub enum Poll<T> {
    Ready(T),
    Pending,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
}

/// Bounded poll against an asynchronous remote job. Returns `Ok(None)` once
/// the ceiling is reached so the caller can cancel the job explicitly.
pub fn poll_bounded<T>(
    settings: PollSettings,
    mut check: impl FnMut() -> Result<Poll<T>>,
) -> Result<Option<T>> {
    let started = Instant::now();
    loop {
        if let Poll::Ready(value) = check()? {
            return Ok(Some(value));
        }
        if started.elapsed() >= settings.max_wait {
            return Ok(None);
        }
        thread::sleep(settings.interval);
    }
}

struct GeminiTextProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiTextProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: gemini_api_base(),
            http,
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn configured() -> bool {
        Self::api_key().is_some()
    }

    fn model() -> String {
        non_empty_env("GEMINI_TEXT_MODEL").unwrap_or_else(|| "gemini-2.5-flash".to_string())
    }

    fn generate_text(&self, prompt: &str) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY not set");
        };
        let endpoint = format!(
            "{}/models/{}:generateContent",
            self.api_base,
            Self::model()
        );
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Duration::from_secs(TEXT_REQUEST_TIMEOUT_S))
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Gemini", response)?;
        let text = extract_gemini_text(&parsed);
        if text.trim().is_empty() {
            bail!("Gemini returned no text candidates");
        }
        Ok(text)
    }
}

impl TextStrategy for GeminiTextProvider {
    fn name(&self) -> &str {
        "gemini-text"
    }

    fn complete(&self, request: &TextRequest) -> Result<String> {
        self.generate_text(&flatten_text_request(request))
    }
}

struct OpenRouterTextProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenRouterTextProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: env::var("OPENROUTER_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
            http,
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("OPENROUTER_API_KEY")
    }

    fn configured() -> bool {
        Self::api_key().is_some()
    }

    fn model() -> String {
        non_empty_env("OPENROUTER_TEXT_MODEL").unwrap_or_else(|| "openai/gpt-4o-mini".to_string())
    }
}

impl TextStrategy for OpenRouterTextProvider {
    fn name(&self) -> &str {
        "openrouter-text"
    }

    fn complete(&self, request: &TextRequest) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("OPENROUTER_API_KEY not set");
        };
        let endpoint = format!("{}/chat/completions", self.api_base);

        let mut messages = vec![json!({ "role": "system", "content": request.system })];
        for (role, content) in &request.history {
            let mapped = if role == "assistant" { "assistant" } else { "user" };
            messages.push(json!({ "role": mapped, "content": content }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .timeout(Duration::from_secs(TEXT_REQUEST_TIMEOUT_S))
            .json(&json!({ "model": Self::model(), "messages": messages }))
            .send()
            .with_context(|| format!("OpenRouter request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenRouter", response)?;
        let text = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if text.is_empty() {
            bail!("OpenRouter returned no completion text");
        }
        Ok(text)
    }
}

struct ImagenProvider {
    api_base: String,
    http: HttpClient,
}

impl ImagenProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: env::var("IMAGEN_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(gemini_api_base),
            http,
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("IMAGEN_API_KEY")
            .or_else(|| non_empty_env("GEMINI_API_KEY"))
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn configured() -> bool {
        Self::api_key().is_some()
    }

    fn model() -> String {
        non_empty_env("IMAGEN_MODEL").unwrap_or_else(|| "imagen-3.0-generate-002".to_string())
    }

    fn extract_predictions(response_payload: &Value) -> Result<Vec<ImageBytes>> {
        let mut out = Vec::new();
        let predictions = response_payload
            .get("predictions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in predictions {
            let Some(obj) = row.as_object() else {
                continue;
            };
            if let Some(encoded) = obj
                .get("bytesBase64Encoded")
                .or_else(|| obj.get("bytes_base64_encoded"))
                .and_then(Value::as_str)
            {
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .context("Imagen image base64 decode failed")?;
                out.push(ImageBytes {
                    bytes,
                    mime_type: obj
                        .get("mimeType")
                        .or_else(|| obj.get("mime_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
        }
        Ok(out)
    }
}

impl ImageStrategy for ImagenProvider {
    fn name(&self) -> &str {
        "imagen"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        let Some(api_key) = Self::api_key() else {
            bail!("IMAGEN_API_KEY not set");
        };
        if request.source_image.is_some() {
            bail!("Imagen provider supports text-to-image only");
        }
        let endpoint = format!("{}/models/{}:predict", self.api_base, Self::model());
        let payload = json!({
            "instances": [{ "prompt": request.prompt }],
            "parameters": {
                "sampleCount": request.n.max(1),
                "aspectRatio": request.aspect_ratio.as_str(),
            },
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Duration::from_secs(IMAGE_REQUEST_TIMEOUT_S))
            .json(&payload)
            .send()
            .with_context(|| format!("Imagen request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Imagen", response)?;
        let images = Self::extract_predictions(&parsed)?;
        if images.is_empty() {
            bail!("Imagen returned no images");
        }
        Ok(images)
    }
}

struct StabilityProvider {
    api_base: String,
    http: HttpClient,
}

impl StabilityProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: stability_api_base(),
            http,
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("STABILITY_API_KEY")
    }

    fn configured() -> bool {
        Self::api_key().is_some()
    }

    fn read_image_response(response: HttpResponse) -> Result<ImageBytes> {
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Stability request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if !content_type.starts_with("image/") {
            bail!("Stability returned unexpected content type '{content_type}'");
        }
        let bytes = response
            .bytes()
            .context("failed reading Stability image bytes")?
            .to_vec();
        Ok(ImageBytes {
            bytes,
            mime_type: Some(content_type),
        })
    }
}

impl ImageStrategy for StabilityProvider {
    fn name(&self) -> &str {
        "stability"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        let Some(api_key) = Self::api_key() else {
            bail!("STABILITY_API_KEY not set");
        };
        if request.source_image.is_some() {
            bail!("Stability core endpoint supports text-to-image only");
        }
        let endpoint = format!("{}/v2beta/stable-image/generate/core", self.api_base);
        let mut images = Vec::new();
        for idx in 0..request.n.max(1) {
            let mut form = MultipartForm::new()
                .text("prompt", request.prompt.clone())
                .text("aspect_ratio", request.aspect_ratio.as_str().to_string())
                .text("output_format", "png".to_string());
            if let Some(seed) = request.seed {
                form = form.text("seed", seed.wrapping_add(u64::from(idx)).to_string());
            }
            let response = self
                .http
                .post(&endpoint)
                .bearer_auth(&api_key)
                .header("Accept", "image/*")
                .timeout(Duration::from_secs(IMAGE_REQUEST_TIMEOUT_S))
                .multipart(form)
                .send()
                .with_context(|| format!("Stability request failed ({endpoint})"))?;
            images.push(Self::read_image_response(response)?);
        }
        Ok(images)
    }
}

struct HuggingFaceProvider {
    api_base: String,
    http: HttpClient,
}

impl HuggingFaceProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: huggingface_api_base(),
            http,
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("HUGGINGFACE_API_KEY").or_else(|| non_empty_env("HF_API_TOKEN"))
    }

    fn configured() -> bool {
        Self::api_key().is_some()
    }

    fn model() -> String {
        non_empty_env("HUGGINGFACE_IMAGE_MODEL")
            .unwrap_or_else(|| "stabilityai/stable-diffusion-xl-base-1.0".to_string())
    }

    fn post_inference(&self, payload: &Value, timeout_s: u64) -> Result<ImageBytes> {
        let Some(api_key) = Self::api_key() else {
            bail!("HUGGINGFACE_API_KEY not set");
        };
        let endpoint = format!("{}/models/{}", self.api_base, Self::model());
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .timeout(Duration::from_secs(timeout_s))
            .json(payload)
            .send()
            .with_context(|| format!("Hugging Face request failed ({endpoint})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "Hugging Face request failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading Hugging Face image bytes")?
            .to_vec();
        if bytes.is_empty() {
            bail!("Hugging Face returned an empty body");
        }
        Ok(ImageBytes { bytes, mime_type })
    }
}

impl ImageStrategy for HuggingFaceProvider {
    fn name(&self) -> &str {
        "huggingface"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        if request.source_image.is_some() {
            bail!("Hugging Face text-to-image strategy takes no source image");
        }
        let mut images = Vec::new();
        for idx in 0..request.n.max(1) {
            let prompt = if idx == 0 {
                request.prompt.clone()
            } else {
                format!("{}, variation {}", request.prompt, idx + 1)
            };
            images.push(self.post_inference(
                &json!({ "inputs": prompt }),
                IMAGE_REQUEST_TIMEOUT_S,
            )?);
        }
        Ok(images)
    }
}

struct HuggingFaceEditProvider {
    inner: HuggingFaceProvider,
}

impl HuggingFaceEditProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            inner: HuggingFaceProvider::new(http),
        }
    }

    fn configured() -> bool {
        HuggingFaceProvider::configured()
    }
}

impl ImageStrategy for HuggingFaceEditProvider {
    fn name(&self) -> &str {
        "huggingface-edit"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        let Some(source) = request.source_image.as_ref() else {
            bail!("Hugging Face edit strategy requires a source image");
        };
        let payload = json!({
            "inputs": BASE64.encode(&source.bytes),
            "parameters": {
                "prompt": request.prompt,
                "negative_prompt": "blurry, low quality, distorted",
                "strength": 0.7,
            },
        });
        let image = self.inner.post_inference(&payload, EDIT_REQUEST_TIMEOUT_S)?;
        Ok(vec![image])
    }
}

struct PollinationsProvider {
    api_base: String,
    http: HttpClient,
}

impl PollinationsProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: env::var("POLLINATIONS_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://image.pollinations.ai".to_string()),
            http,
        }
    }

    // Keyless service; opt out with POLLINATIONS_DISABLED.
    fn configured() -> bool {
        non_empty_env("POLLINATIONS_DISABLED").is_none()
    }
}

impl ImageStrategy for PollinationsProvider {
    fn name(&self) -> &str {
        "pollinations"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        if request.source_image.is_some() {
            bail!("Pollinations supports text-to-image only");
        }
        let (width, height) = request.aspect_ratio.dims();
        let mut images = Vec::new();
        for idx in 0..request.n.max(1) {
            let endpoint = format!(
                "{}/prompt/{}",
                self.api_base,
                percent_encode(&request.prompt)
            );
            let mut query: Vec<(String, String)> = vec![
                ("width".to_string(), width.to_string()),
                ("height".to_string(), height.to_string()),
                ("nologo".to_string(), "true".to_string()),
            ];
            if let Some(seed) = request.seed {
                query.push((
                    "seed".to_string(),
                    seed.wrapping_add(u64::from(idx)).to_string(),
                ));
            }
            let response = self
                .http
                .get(&endpoint)
                .query(&query)
                .timeout(Duration::from_secs(IMAGE_REQUEST_TIMEOUT_S))
                .send()
                .with_context(|| format!("Pollinations request failed ({endpoint})"))?;
            if !response.status().is_success() {
                let code = response.status().as_u16();
                bail!("Pollinations request failed ({code})");
            }
            let mime_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            if !mime_type
                .as_deref()
                .map(|value| value.starts_with("image/"))
                .unwrap_or(false)
            {
                bail!("Pollinations returned a non-image payload");
            }
            let bytes = response
                .bytes()
                .context("failed reading Pollinations image bytes")?
                .to_vec();
            images.push(ImageBytes { bytes, mime_type });
        }
        Ok(images)
    }
}

/// Shared Replicate plumbing: create a prediction, poll it to a terminal
/// state within a hard ceiling, cancel it when the ceiling is hit, download
/// outputs.
struct ReplicateApi {
    api_base: String,
    http: HttpClient,
}

impl ReplicateApi {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: env::var("REPLICATE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.replicate.com/v1".to_string()),
            http,
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY"))
    }

    fn create_prediction(&self, model: &str, input: Value) -> Result<Value> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let endpoint = format!("{}/predictions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Prefer", "wait")
            .timeout(Duration::from_secs(EDIT_REQUEST_TIMEOUT_S))
            .json(&json!({ "model": model, "input": input }))
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        response_json_or_error("Replicate", response)
    }

    /// Drives a prediction to `succeeded`, cancelling at the poll ceiling.
    fn await_prediction(&self, prediction: Value, settings: PollSettings) -> Result<Value> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let status = prediction_status(&prediction);
        if status == "succeeded" {
            return Ok(prediction);
        }
        if !matches!(status.as_str(), "starting" | "processing") {
            bail!("Replicate prediction failed: {prediction}");
        }

        let poll_url = prediction
            .get("urls")
            .and_then(Value::as_object)
            .and_then(|urls| urls.get("get"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Replicate prediction missing poll URL"))?;

        let polled = poll_bounded(settings, || {
            let response = self
                .http
                .get(&poll_url)
                .bearer_auth(&api_key)
                .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_S))
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            match prediction_status(&payload).as_str() {
                "succeeded" => Ok(Poll::Ready(payload)),
                "starting" | "processing" => Ok(Poll::Pending),
                _ => bail!("Replicate prediction failed: {payload}"),
            }
        })?;

        match polled {
            Some(payload) => Ok(payload),
            None => {
                self.cancel_prediction(&prediction, &api_key);
                bail!(
                    "Replicate polling timed out after {:.0}s",
                    settings.max_wait.as_secs_f64()
                )
            }
        }
    }

    fn cancel_prediction(&self, prediction: &Value, api_key: &str) {
        let cancel_url = prediction
            .get("urls")
            .and_then(Value::as_object)
            .and_then(|urls| urls.get("cancel"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                prediction
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|id| format!("{}/predictions/{}/cancel", self.api_base, id))
            });
        if let Some(url) = cancel_url {
            let _ = self
                .http
                .post(&url)
                .bearer_auth(api_key)
                .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_S))
                .send();
        }
    }

    fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(url) => {
                let trimmed = url.trim();
                if !trimmed.is_empty()
                    && trimmed.starts_with("http")
                    && !out.iter().any(|existing| existing == trimmed)
                {
                    out.push(trimmed.to_string());
                }
            }
            Value::Array(rows) => {
                for row in rows {
                    Self::extract_output_urls(row, out);
                }
            }
            Value::Object(obj) => {
                if let Some(url) = obj.get("url") {
                    Self::extract_output_urls(url, out);
                }
                if let Some(output) = obj.get("output") {
                    Self::extract_output_urls(output, out);
                }
            }
            _ => {}
        }
    }

    fn download(&self, url: &str) -> Result<ImageBytes> {
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_S))
            .send()
            .with_context(|| format!("failed downloading Replicate output ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            bail!("Replicate output download failed ({code})");
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading Replicate output bytes")?
            .to_vec();
        Ok(ImageBytes { bytes, mime_type })
    }
}

fn prediction_status(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

struct ReplicateEditProvider {
    api: ReplicateApi,
}

impl ReplicateEditProvider {
    const POLL: PollSettings = PollSettings {
        interval: Duration::from_secs(3),
        max_wait: Duration::from_secs(120),
    };

    fn new(http: HttpClient) -> Self {
        Self {
            api: ReplicateApi::new(http),
        }
    }

    fn configured() -> bool {
        ReplicateApi::api_key().is_some()
    }

    fn model() -> String {
        non_empty_env("REPLICATE_EDIT_MODEL")
            .unwrap_or_else(|| "black-forest-labs/flux-kontext-dev".to_string())
    }
}

impl ImageStrategy for ReplicateEditProvider {
    fn name(&self) -> &str {
        "replicate-edit"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        let Some(source) = request.source_image.as_ref() else {
            bail!("Replicate edit strategy requires a source image");
        };
        let input = json!({
            "prompt": request.prompt,
            "input_image": data_url(source),
        });
        let prediction = self.api.create_prediction(&Self::model(), input)?;
        let finished = self.api.await_prediction(prediction, Self::POLL)?;

        let mut urls = Vec::new();
        if let Some(output) = finished.get("output") {
            ReplicateApi::extract_output_urls(output, &mut urls);
        }
        let Some(url) = urls.first() else {
            bail!("Replicate edit returned no output URLs");
        };
        Ok(vec![self.api.download(url)?])
    }
}

struct StabilityEditProvider {
    api_base: String,
    http: HttpClient,
}

impl StabilityEditProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: stability_api_base(),
            http,
        }
    }

    fn configured() -> bool {
        StabilityProvider::api_key().is_some()
    }
}

impl ImageStrategy for StabilityEditProvider {
    fn name(&self) -> &str {
        "stability-edit"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        let Some(api_key) = StabilityProvider::api_key() else {
            bail!("STABILITY_API_KEY not set");
        };
        let Some(source) = request.source_image.as_ref() else {
            bail!("Stability edit strategy requires a source image");
        };
        let endpoint = format!("{}/v2beta/stable-image/generate/sd3", self.api_base);
        let part = MultipartPart::bytes(source.bytes.clone())
            .file_name("source.png")
            .mime_str(source.mime_type.as_deref().unwrap_or("image/png"))
            .context("invalid source image mime type")?;
        let form = MultipartForm::new()
            .text("prompt", request.prompt.clone())
            .text("mode", "image-to-image".to_string())
            .text("strength", "0.7".to_string())
            .text("output_format", "png".to_string())
            .part("image", part);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Accept", "image/*")
            .timeout(Duration::from_secs(EDIT_REQUEST_TIMEOUT_S))
            .multipart(form)
            .send()
            .with_context(|| format!("Stability edit request failed ({endpoint})"))?;
        Ok(vec![StabilityProvider::read_image_response(response)?])
    }
}

struct GeminiEditProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiEditProvider {
    fn new(http: HttpClient) -> Self {
        Self {
            api_base: gemini_api_base(),
            http,
        }
    }

    fn configured() -> bool {
        GeminiTextProvider::configured()
    }

    fn model() -> String {
        non_empty_env("GEMINI_IMAGE_MODEL")
            .unwrap_or_else(|| "gemini-2.5-flash-image".to_string())
    }

    fn extract_inline_images(response_payload: &Value) -> Result<Vec<ImageBytes>> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .context("Gemini image base64 decode failed")?;
                out.push(ImageBytes {
                    bytes,
                    mime_type: inline
                        .get("mimeType")
                        .or_else(|| inline.get("mime_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
            }
        }
        Ok(out)
    }
}

impl ImageStrategy for GeminiEditProvider {
    fn name(&self) -> &str {
        "gemini-edit"
    }

    fn attempt(&self, request: &ImageRequest) -> Result<Vec<ImageBytes>> {
        let Some(api_key) = GeminiTextProvider::api_key() else {
            bail!("GEMINI_API_KEY not set");
        };
        let Some(source) = request.source_image.as_ref() else {
            bail!("Gemini edit strategy requires a source image");
        };
        let endpoint = format!(
            "{}/models/{}:generateContent",
            self.api_base,
            Self::model()
        );
        let payload = json!({
            "contents": [{
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": source.mime_type.as_deref().unwrap_or("image/png"),
                            "data": BASE64.encode(&source.bytes),
                        }
                    },
                    { "text": request.prompt },
                ]
            }],
        });
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Duration::from_secs(EDIT_REQUEST_TIMEOUT_S))
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini edit request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Gemini edit", response)?;
        let images = Self::extract_inline_images(&parsed)?;
        if images.is_empty() {
            bail!("Gemini edit returned no inline images");
        }
        Ok(images)
    }
}

struct ReplicateVideoProvider {
    api: ReplicateApi,
}

impl ReplicateVideoProvider {
    const POLL: PollSettings = PollSettings {
        interval: Duration::from_secs(5),
        max_wait: Duration::from_secs(300),
    };

    fn new(http: HttpClient) -> Self {
        Self {
            api: ReplicateApi::new(http),
        }
    }

    fn configured() -> bool {
        ReplicateApi::api_key().is_some() && non_empty_env("REPLICATE_VIDEO_MODEL").is_some()
    }

    fn model() -> String {
        non_empty_env("REPLICATE_VIDEO_MODEL")
            .unwrap_or_else(|| "wan-video/wan-2.2-t2v-fast".to_string())
    }
}

impl VideoStrategy for ReplicateVideoProvider {
    fn name(&self) -> &str {
        "replicate-video"
    }

    fn attempt(&self, request: &VideoRequest) -> Result<ImageBytes> {
        let input = json!({
            "prompt": request.prompt,
            "aspect_ratio": request.aspect_ratio.as_str(),
        });
        let prediction = self.api.create_prediction(&Self::model(), input)?;
        let finished = self.api.await_prediction(prediction, Self::POLL)?;

        let mut urls = Vec::new();
        if let Some(output) = finished.get("output") {
            ReplicateApi::extract_output_urls(output, &mut urls);
        }
        let Some(url) = urls.first() else {
            bail!("Replicate video returned no output URLs");
        };
        self.api.download(url)
    }
}

/// Stitches decoded frames into a looping GIF: every frame is resized to the
/// first frame's dimensions, 500ms per frame, infinite repeat. Frames that
/// fail to decode are dropped silently; zero usable frames is an error the
/// caller downgrades to "no artifact".
pub fn stitch_loop(frames: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    for bytes in frames {
        if let Ok(img) = image::load_from_memory(bytes) {
            decoded.push(img.to_rgba8());
        }
    }
    if decoded.is_empty() {
        bail!("no usable frames to stitch");
    }

    let (width, height) = decoded[0].dimensions();
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder
            .set_repeat(Repeat::Infinite)
            .context("failed to set GIF repeat")?;
        for frame in decoded {
            let sized = if frame.dimensions() == (width, height) {
                frame
            } else {
                imageops::resize(&frame, width, height, FilterType::Lanczos3)
            };
            encoder
                .encode_frame(Frame::from_parts(
                    sized,
                    0,
                    0,
                    Delay::from_numer_denom_ms(LOOP_FRAME_DELAY_MS, 1),
                ))
                .context("failed to encode GIF frame")?;
        }
    }
    Ok(out)
}

/// Scales the design into the product's placement rectangle (aspect
/// preserved, centered), drops its opacity to mimic material interaction,
/// composites it onto the base product photo, and flattens to opaque PNG.
pub fn compose_product_mockup(
    base_bytes: &[u8],
    design_bytes: &[u8],
    product: ProductKind,
) -> Result<Vec<u8>> {
    let base = image::load_from_memory(base_bytes)
        .context("base product image undecodable")?
        .to_rgba8();
    let design = image::load_from_memory(design_bytes)
        .context("design image undecodable")?
        .to_rgba8();

    let (base_w, base_h) = base.dimensions();
    let rect = product.placement();
    let rect_w = ((base_w as f32 * rect.width).round() as u32).max(1);
    let rect_h = ((base_h as f32 * rect.height).round() as u32).max(1);

    let (design_w, design_h) = design.dimensions();
    let scale = (rect_w as f32 / design_w as f32).min(rect_h as f32 / design_h as f32);
    let scaled_w = ((design_w as f32 * scale).round() as u32).max(1);
    let scaled_h = ((design_h as f32 * scale).round() as u32).max(1);
    let mut scaled = imageops::resize(&design, scaled_w, scaled_h, FilterType::Lanczos3);
    for pixel in scaled.pixels_mut() {
        pixel[3] = (f32::from(pixel[3]) * DESIGN_OPACITY).round() as u8;
    }

    let x = (base_w as f32 * rect.x).round() as i64 + i64::from((rect_w - scaled_w.min(rect_w)) / 2);
    let y = (base_h as f32 * rect.y).round() as i64 + i64::from((rect_h - scaled_h.min(rect_h)) / 2);

    let mut composite = base;
    imageops::overlay(&mut composite, &scaled, x, y);
    let flattened = DynamicImage::ImageRgba8(composite).to_rgb8();
    encode_png(&DynamicImage::ImageRgb8(flattened))
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(cursor.into_inner())
}

/// Seed for mock artifacts: a content hash of the request text mixed with
/// the wall clock, so repeated identical requests still vary.
fn mock_seed(text: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(timestamp_millis().to_be_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap_or_default())
}

fn color_from_seed(text: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn mock_style(seed: u64) -> &'static str {
    STYLE_VOCABULARY[(seed % STYLE_VOCABULARY.len() as u64) as usize]
}

/// Deterministic placeholder: a vertical gradient between two colors drawn
/// from the seed. Pure local computation, cannot fail to produce output.
fn placeholder_image_bytes(text: &str, width: u32, height: u32, seed: u64) -> Result<Vec<u8>> {
    let (r0, g0, b0) = color_from_seed(text, seed);
    let (r1, g1, b1) = color_from_seed(text, seed.rotate_left(17));
    let mut img = RgbImage::new(width.max(1), height.max(1));
    let span = img.height().max(1) as f32;
    for (_, y, pixel) in img.enumerate_pixels_mut() {
        let t = y as f32 / span;
        *pixel = Rgb([
            lerp_channel(r0, r1, t),
            lerp_channel(g0, g1, t),
            lerp_channel(b0, b1, t),
        ]);
    }
    encode_png(&DynamicImage::ImageRgb8(img))
}

fn lerp_channel(from: u8, to: u8, t: f32) -> u8 {
    (f32::from(from) + (f32::from(to) - f32::from(from)) * t).round() as u8
}

fn mock_placeholder_dims(intent: Intent) -> (u32, u32) {
    match intent {
        Intent::PosterDesign => (600, 900),
        Intent::VisionBoard => (400, 400),
        _ => (800, 600),
    }
}

const TEXT_ONLY_RESPONSE_POOL: &[&str] = &[
    "I'm listening. How can I help you?",
    "That sounds interesting. Tell me more.",
    "I'm here to chat. What's on your mind?",
    "Understood. Is there anything specific you'd like to discuss?",
];

const VISUAL_RESPONSE_POOL: &[&str] = &[
    "I've created {count} visuals based on your request.",
    "Here are {count} creative interpretations.",
    "I've generated {count} artworks for you.",
];

const STYLING_OPTIONS_ADDENDUM: &str = " Want me to explore 3 styling options?";

/// Templated reply used when the whole text chain is dry.
fn mock_response_text(intent: Intent, artifact_count: usize, seed: u64) -> String {
    if intent == Intent::TextOnly {
        let pool = TEXT_ONLY_RESPONSE_POOL;
        return pool[(seed % pool.len() as u64) as usize].to_string();
    }
    let pool = VISUAL_RESPONSE_POOL;
    let template = pool[(seed % pool.len() as u64) as usize];
    let mut text = template.replace("{count}", &artifact_count.to_string());
    if matches!(
        intent,
        Intent::PosterDesign | Intent::BrandArtwork | Intent::ProductMockup
    ) {
        text.push_str(STYLING_OPTIONS_ADDENDUM);
    }
    text
}

fn default_text_chain(http: &HttpClient) -> Vec<Box<dyn TextStrategy>> {
    let mut chain: Vec<Box<dyn TextStrategy>> = Vec::new();
    if GeminiTextProvider::configured() {
        chain.push(Box::new(GeminiTextProvider::new(http.clone())));
    }
    if OpenRouterTextProvider::configured() {
        chain.push(Box::new(OpenRouterTextProvider::new(http.clone())));
    }
    chain
}

fn default_image_chain(http: &HttpClient) -> Vec<Box<dyn ImageStrategy>> {
    let mut chain: Vec<Box<dyn ImageStrategy>> = Vec::new();
    if ImagenProvider::configured() {
        chain.push(Box::new(ImagenProvider::new(http.clone())));
    }
    if StabilityProvider::configured() {
        chain.push(Box::new(StabilityProvider::new(http.clone())));
    }
    if HuggingFaceProvider::configured() {
        chain.push(Box::new(HuggingFaceProvider::new(http.clone())));
    }
    if PollinationsProvider::configured() {
        chain.push(Box::new(PollinationsProvider::new(http.clone())));
    }
    chain
}

fn default_edit_chain(http: &HttpClient) -> Vec<Box<dyn ImageStrategy>> {
    let mut chain: Vec<Box<dyn ImageStrategy>> = Vec::new();
    if HuggingFaceEditProvider::configured() {
        chain.push(Box::new(HuggingFaceEditProvider::new(http.clone())));
    }
    if ReplicateEditProvider::configured() {
        chain.push(Box::new(ReplicateEditProvider::new(http.clone())));
    }
    if StabilityEditProvider::configured() {
        chain.push(Box::new(StabilityEditProvider::new(http.clone())));
    }
    if GeminiEditProvider::configured() {
        chain.push(Box::new(GeminiEditProvider::new(http.clone())));
    }
    chain
}

fn default_video_chain(http: &HttpClient) -> Vec<Box<dyn VideoStrategy>> {
    let mut chain: Vec<Box<dyn VideoStrategy>> = Vec::new();
    if ReplicateVideoProvider::configured() {
        chain.push(Box::new(ReplicateVideoProvider::new(http.clone())));
    }
    chain
}

/// The orchestrator. Constructed once at startup with its HTTP client and
/// provider chains; every request flows through [`CreativeEngine::orchestrate`].
pub struct CreativeEngine {
    media: DirMediaStore,
    events: EventWriter,
    http: HttpClient,
    classifier: Option<GeminiTextProvider>,
    text_chain: Vec<Box<dyn TextStrategy>>,
    image_chain: Vec<Box<dyn ImageStrategy>>,
    edit_chain: Vec<Box<dyn ImageStrategy>>,
    video_chain: Vec<Box<dyn VideoStrategy>>,
}

impl CreativeEngine {
    pub fn new(
        media_root: impl Into<std::path::PathBuf>,
        events_path: impl Into<std::path::PathBuf>,
    ) -> Result<Self> {
        let media = DirMediaStore::new(media_root)?;
        let events = EventWriter::new(events_path, "engine");
        let http = HttpClient::new();
        Ok(Self {
            classifier: GeminiTextProvider::configured()
                .then(|| GeminiTextProvider::new(http.clone())),
            text_chain: default_text_chain(&http),
            image_chain: default_image_chain(&http),
            edit_chain: default_edit_chain(&http),
            video_chain: default_video_chain(&http),
            media,
            events,
            http,
        })
    }

    pub fn media(&self) -> &DirMediaStore {
        &self.media
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    /// Entry point: resolves the intent, updates context memory, drives the
    /// provider chains, and always returns a complete result. The only
    /// surfaced error is a structurally invalid request.
    pub fn orchestrate(
        &self,
        session: &mut SessionStore,
        request: &Request,
    ) -> Result<OrchestrationResult> {
        let text = request.text.trim().to_string();
        if text.is_empty() && request.attached_image.is_none() {
            bail!("request must carry text or an attached image");
        }

        self.emit_session(
            session,
            "request_received",
            map_object(json!({
                "text": truncate_text(&text, 120),
                "has_image": request.attached_image.is_some(),
                "refinement_target": request.refinement_target,
            })),
        );

        let resolved = self.resolve_intent(session, request, &text);
        self.emit_session(
            session,
            "intent_resolved",
            map_object(json!({
                "intent": resolved.intent.as_str(),
                "confidence": resolved.confidence,
            })),
        );

        match memory::remember_styles(session, &text) {
            Ok(added) if !added.is_empty() => {
                self.emit_session(
                    session,
                    "memory_updated",
                    map_object(json!({ "styles": added })),
                );
            }
            Ok(_) => {}
            Err(err) => {
                self.emit_session(
                    session,
                    "memory_update_failed",
                    map_object(json!({ "error": error_chain_text(&err, 256) })),
                );
            }
        }

        session.auto_title(&text);
        session.push_user_message(&text);

        let params = GenerationParams::for_intent(resolved.intent, &text);
        let style_fragment = memory::style_prompt_fragment(session.preferred_styles());
        let seed = mock_seed(&text);

        let mut artifacts = match resolved.intent {
            Intent::TextOnly => Vec::new(),
            Intent::Refinement => {
                self.refine_artifacts(session, request, &text, &params, &style_fragment, seed)?
            }
            Intent::VideoLoop => {
                self.video_loop_artifacts(session, &text, &style_fragment, seed)?
            }
            Intent::ProductMockup if request.attached_image.is_some() => self
                .product_mockup_artifacts(
                    session,
                    &text,
                    request.attached_image.as_deref().unwrap_or_default(),
                    seed,
                )?,
            Intent::ImageTransformation if request.attached_image.is_some() => {
                let source = ImageBytes {
                    bytes: request.attached_image.clone().unwrap_or_default(),
                    mime_type: None,
                };
                self.transform_artifacts(&text, source, &params, &style_fragment, seed)?
            }
            _ => self.generate_artifacts(&text, &params, &style_fragment, seed)?,
        };

        if artifacts.is_empty() && resolved.intent.is_visual() {
            self.emit_session(
                session,
                "mock_fallback",
                map_object(json!({ "intent": resolved.intent.as_str() })),
            );
            artifacts = self.mock_artifacts(resolved.intent, &text, &params, seed)?;
        }

        let response_text = self.build_response_text(
            session,
            resolved.intent,
            &text,
            artifacts.len(),
            &style_fragment,
            seed,
        );

        let locations = artifacts
            .iter()
            .map(|artifact| artifact.location.clone())
            .collect();
        session.push_assistant_message(&response_text, resolved.intent.as_str(), locations);
        if let Err(err) = session.save() {
            self.emit_session(
                session,
                "session_persist_failed",
                map_object(json!({ "error": error_chain_text(&err, 256) })),
            );
        }

        self.emit_session(
            session,
            "response_ready",
            map_object(json!({
                "intent": resolved.intent.as_str(),
                "artifacts": artifacts.len(),
            })),
        );

        Ok(OrchestrationResult {
            intent: resolved.intent,
            confidence: resolved.confidence,
            response_text,
            artifacts,
        })
    }

    /// Pre-classification overrides, evaluated before the classifier in
    /// priority order: refinement target, attached image, short follow-up,
    /// explicit mode hint.
    fn resolve_intent(
        &self,
        session: &SessionStore,
        request: &Request,
        text: &str,
    ) -> Classification {
        if request.refinement_target.is_some() {
            return Classification::new(Intent::Refinement, 1.0);
        }
        if request.attached_image.is_some() {
            // An upload is a transformation unless the text explicitly asks
            // to put the design on a product.
            if classify_keywords(text).intent == Intent::ProductMockup {
                return Classification::new(Intent::ProductMockup, 1.0);
            }
            return Classification::new(Intent::ImageTransformation, 1.0);
        }
        if is_acknowledgement(text) {
            let prior = session
                .last_assistant_intent()
                .and_then(|label| Intent::from_label(&label));
            return match prior {
                Some(intent) if intent.is_visual() => Classification::new(intent, 0.9),
                _ => Classification::new(Intent::TextOnly, 0.85),
            };
        }
        match request.explicit_mode {
            Some(ExplicitMode::Video) => Classification::new(Intent::VideoLoop, 1.0),
            Some(ExplicitMode::Image) => {
                let resolved = self.classify(session, text);
                if resolved.intent == Intent::TextOnly {
                    // An explicit image-mode request is never answered with
                    // bare text.
                    Classification::new(Intent::ImageGeneration, 1.0)
                } else {
                    resolved
                }
            }
            None => self.classify(session, text),
        }
    }

    fn classify(&self, session: &SessionStore, text: &str) -> Classification {
        if let Some(remote) = self.classify_remote(session, text) {
            return remote;
        }
        classify_keywords(text)
    }

    /// Remote label classification. Any provider error or unrecognized label
    /// falls through to the keyword classifier, never to the caller.
    fn classify_remote(&self, session: &SessionStore, text: &str) -> Option<Classification> {
        let classifier = self.classifier.as_ref()?;
        let prompt = format!("{CLASSIFIER_INSTRUCTION}\n\nUser message: \"{text}\"");
        match classifier.generate_text(&prompt) {
            Ok(answer) => {
                let intent = Intent::from_label(&answer)?;
                Some(Classification::new(intent, 0.95))
            }
            Err(err) => {
                self.emit_session(
                    session,
                    "classification_fallback",
                    map_object(json!({ "error": error_chain_text(&err, 256) })),
                );
                None
            }
        }
    }

    fn generate_artifacts(
        &self,
        text: &str,
        params: &GenerationParams,
        style_fragment: &str,
        seed: u64,
    ) -> Result<Vec<Artifact>> {
        let style = mock_style(seed);
        let prompt = build_prompt(text, style, &params.prompt_suffix, style_fragment);
        let image_request = ImageRequest {
            prompt: prompt.clone(),
            aspect_ratio: params.aspect_ratio,
            n: params.artifact_count,
            source_image: None,
            seed: Some(seed & 0x7fff_ffff),
        };
        match run_chain(
            &self.events,
            "image",
            &self.image_chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&image_request),
        ) {
            Some((provider, images)) => self.artifacts_from_images(
                images,
                params.artifact_count,
                params.content_kind,
                style,
                &provider,
                &prompt,
            ),
            None => Ok(Vec::new()),
        }
    }

    fn transform_artifacts(
        &self,
        text: &str,
        source: ImageBytes,
        params: &GenerationParams,
        style_fragment: &str,
        seed: u64,
    ) -> Result<Vec<Artifact>> {
        let edit_request = ImageRequest {
            prompt: text.to_string(),
            aspect_ratio: params.aspect_ratio,
            n: 1,
            source_image: Some(source),
            seed: Some(seed & 0x7fff_ffff),
        };
        match run_chain(
            &self.events,
            "image-edit",
            &self.edit_chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&edit_request),
        ) {
            Some((provider, images)) => self.artifacts_from_images(
                images,
                1,
                ContentKind::Photo,
                mock_style(seed),
                &provider,
                text,
            ),
            None => self.degraded_generation(text, params, style_fragment, seed),
        }
    }

    /// Image-to-image fallback of last resort before the mock: plain
    /// text-to-image with a composition-preserving qualifier.
    fn degraded_generation(
        &self,
        text: &str,
        params: &GenerationParams,
        style_fragment: &str,
        seed: u64,
    ) -> Result<Vec<Artifact>> {
        let style = mock_style(seed);
        let prompt = format!(
            "{}, {}",
            build_prompt(text, style, &params.prompt_suffix, style_fragment),
            PRESERVE_COMPOSITION_QUALIFIER,
        );
        let image_request = ImageRequest {
            prompt: prompt.clone(),
            aspect_ratio: params.aspect_ratio,
            n: 1,
            source_image: None,
            seed: Some(seed & 0x7fff_ffff),
        };
        match run_chain(
            &self.events,
            "image",
            &self.image_chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&image_request),
        ) {
            Some((provider, images)) => self.artifacts_from_images(
                images,
                1,
                ContentKind::Photo,
                style,
                &provider,
                &prompt,
            ),
            None => Ok(Vec::new()),
        }
    }

    fn refine_artifacts(
        &self,
        session: &SessionStore,
        request: &Request,
        text: &str,
        params: &GenerationParams,
        style_fragment: &str,
        seed: u64,
    ) -> Result<Vec<Artifact>> {
        let Some(target) = request.refinement_target.as_deref() else {
            return self.degraded_generation(text, params, style_fragment, seed);
        };
        match self.fetch_location(target) {
            Ok(bytes) => {
                let source = ImageBytes {
                    bytes,
                    mime_type: None,
                };
                self.transform_artifacts(text, source, params, style_fragment, seed)
            }
            Err(err) => {
                self.emit_session(
                    session,
                    "refinement_source_unavailable",
                    map_object(json!({
                        "location": target,
                        "error": error_chain_text(&err, 256),
                    })),
                );
                self.degraded_generation(text, params, style_fragment, seed)
            }
        }
    }

    fn video_loop_artifacts(
        &self,
        session: &SessionStore,
        text: &str,
        style_fragment: &str,
        seed: u64,
    ) -> Result<Vec<Artifact>> {
        let style = mock_style(seed);
        let prompt = build_prompt(text, style, "cinematic, seamless loop", style_fragment);

        let video_request = VideoRequest {
            prompt: prompt.clone(),
            aspect_ratio: AspectRatio::Wide,
        };
        if let Some((provider, video)) = run_chain(
            &self.events,
            "video",
            &self.video_chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&video_request),
        ) {
            let ext = ext_from_mime(video.mime_type.as_deref(), "mp4");
            let location = self.media.save(&video.bytes, &format!("video-loop.{ext}"))?;
            return Ok(vec![Artifact {
                content_kind: ContentKind::Video,
                title: format!("Video Loop — {}", title_case(style)),
                description: format!("Generated by {provider}. Prompt: {prompt}"),
                location,
                prompt_used: prompt,
            }]);
        }

        // No video provider: render still frames and stitch them.
        let mut frames = Vec::new();
        for idx in 0..LOOP_FRAME_COUNT {
            let frame_prompt = format!(
                "{prompt}, frame {} of {} of a seamless loop",
                idx + 1,
                LOOP_FRAME_COUNT
            );
            let frame_request = ImageRequest {
                prompt: frame_prompt,
                aspect_ratio: AspectRatio::Wide,
                n: 1,
                source_image: None,
                seed: Some((seed & 0x7fff_ffff).wrapping_add(u64::from(idx))),
            };
            if let Some((_, images)) = run_chain(
                &self.events,
                "image",
                &self.image_chain,
                |strategy| strategy.name().to_string(),
                |strategy| strategy.attempt(&frame_request),
            ) {
                if let Some(first) = images.into_iter().next() {
                    frames.push(first.bytes);
                }
            }
        }

        if frames.len() >= 2 {
            match stitch_loop(&frames) {
                Ok(gif) => {
                    self.emit_session(
                        session,
                        "assembly_completed",
                        map_object(json!({ "kind": "loop", "frames": frames.len() })),
                    );
                    let location = self.media.save(&gif, "video-loop.gif")?;
                    return Ok(vec![Artifact {
                        content_kind: ContentKind::Video,
                        title: format!("Loop Animation — {}", title_case(style)),
                        description: format!("Stitched from {} stills. Prompt: {prompt}", frames.len()),
                        location,
                        prompt_used: prompt,
                    }]);
                }
                Err(err) => {
                    self.emit_session(
                        session,
                        "assembly_failed",
                        map_object(json!({
                            "kind": "loop",
                            "error": error_chain_text(&err, 256),
                        })),
                    );
                }
            }
        }

        Ok(Vec::new())
    }

    fn product_mockup_artifacts(
        &self,
        session: &SessionStore,
        text: &str,
        design: &[u8],
        seed: u64,
    ) -> Result<Vec<Artifact>> {
        let product = ProductKind::from_text(text);
        let base_prompt = product.base_prompt().to_string();
        let base_request = ImageRequest {
            prompt: base_prompt.clone(),
            aspect_ratio: AspectRatio::Square,
            n: 1,
            source_image: None,
            seed: Some(seed & 0x7fff_ffff),
        };
        let base = run_chain(
            &self.events,
            "image",
            &self.image_chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&base_request),
        )
        .and_then(|(_, images)| images.into_iter().next());
        let Some(base) = base else {
            self.emit_session(
                session,
                "assembly_failed",
                map_object(json!({
                    "kind": "mockup",
                    "error": "no base product image available",
                })),
            );
            return Ok(Vec::new());
        };

        match compose_product_mockup(&base.bytes, design, product) {
            Ok(bytes) => {
                self.emit_session(
                    session,
                    "assembly_completed",
                    map_object(json!({ "kind": "mockup", "product": product.as_str() })),
                );
                let location = self.media.save(&bytes, "product-mockup.png")?;
                Ok(vec![Artifact {
                    content_kind: ContentKind::BrandAsset,
                    title: format!("Product Mockup — {}", title_case(product.as_str())),
                    description: format!("Your design composited onto a {}.", product.as_str()),
                    location,
                    prompt_used: base_prompt,
                }])
            }
            Err(err) => {
                self.emit_session(
                    session,
                    "assembly_failed",
                    map_object(json!({
                        "kind": "mockup",
                        "error": error_chain_text(&err, 256),
                    })),
                );
                Ok(Vec::new())
            }
        }
    }

    /// Deterministic local fallback; cannot fail to produce output for any
    /// visual intent.
    fn mock_artifacts(
        &self,
        intent: Intent,
        text: &str,
        params: &GenerationParams,
        seed: u64,
    ) -> Result<Vec<Artifact>> {
        if intent == Intent::VideoLoop {
            let style = mock_style(seed);
            let gif = self.mock_loop_gif(text, seed)?;
            let location = self.media.save(&gif, "video-loop.gif")?;
            return Ok(vec![Artifact {
                content_kind: ContentKind::Video,
                title: format!("Video Loop — {} (Mock)", title_case(style)),
                description: "Deterministic placeholder animation.".to_string(),
                location,
                prompt_used: format!("[{style}] {text}"),
            }]);
        }

        let (width, height) = mock_placeholder_dims(intent);
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut artifacts = Vec::new();
        for idx in 0..u64::from(params.artifact_count.max(1)) {
            let item_seed = seed.wrapping_add(idx * MOCK_FRAME_SEED_STRIDE);
            let style = mock_style(item_seed);
            let bytes = placeholder_image_bytes(text, width, height, item_seed)?;
            let location = self
                .media
                .save(&bytes, &format!("artifact-{stamp}-{idx:02}.png"))?;
            artifacts.push(Artifact {
                content_kind: params.content_kind,
                title: format!(
                    "{} — {} (Mock)",
                    params.content_kind.title_word(),
                    title_case(style)
                ),
                description: "Deterministic placeholder image.".to_string(),
                location,
                prompt_used: format!("[{style}] {text}"),
            });
        }
        Ok(artifacts)
    }

    fn mock_loop_gif(&self, text: &str, seed: u64) -> Result<Vec<u8>> {
        let mut frames = Vec::new();
        for idx in 0..u64::from(LOOP_FRAME_COUNT) {
            frames.push(placeholder_image_bytes(
                text,
                640,
                360,
                seed.wrapping_add(idx * MOCK_FRAME_SEED_STRIDE),
            )?);
        }
        stitch_loop(&frames)
    }

    fn build_response_text(
        &self,
        session: &SessionStore,
        intent: Intent,
        text: &str,
        artifact_count: usize,
        style_fragment: &str,
        seed: u64,
    ) -> String {
        let mut system = if intent == Intent::TextOnly {
            TEXT_ONLY_SYSTEM_PROMPT.to_string()
        } else {
            CREATIVE_SYSTEM_PROMPT.to_string()
        };
        if !style_fragment.is_empty() {
            system.push(' ');
            system.push_str(style_fragment);
        }
        let text_request = TextRequest {
            system,
            history: session.recent_messages(HISTORY_TURNS),
            prompt: text.to_string(),
        };
        match run_chain(
            &self.events,
            "text",
            &self.text_chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.complete(&text_request),
        ) {
            Some((_, reply)) => reply,
            None => mock_response_text(intent, artifact_count, seed),
        }
    }

    fn artifacts_from_images(
        &self,
        images: Vec<ImageBytes>,
        limit: u32,
        content_kind: ContentKind,
        style: &str,
        provider: &str,
        prompt: &str,
    ) -> Result<Vec<Artifact>> {
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut artifacts = Vec::new();
        for (idx, image) in images
            .into_iter()
            .take(limit.max(1) as usize)
            .enumerate()
        {
            let ext = ext_from_mime(image.mime_type.as_deref(), "png");
            let location = self
                .media
                .save(&image.bytes, &format!("artifact-{stamp}-{idx:02}.{ext}"))?;
            artifacts.push(Artifact {
                content_kind,
                title: format!("{} — {}", content_kind.title_word(), title_case(style)),
                description: format!("Generated by {provider}. Prompt: {prompt}"),
                location,
                prompt_used: prompt.to_string(),
            });
        }
        Ok(artifacts)
    }

    /// Fetches local media-store locations and external URLs transparently.
    fn fetch_location(&self, location: &str) -> Result<Vec<u8>> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let response = self
                .http
                .get(location)
                .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_S))
                .send()
                .with_context(|| format!("failed fetching {location}"))?;
            if !response.status().is_success() {
                bail!("fetch failed ({}) for {location}", response.status().as_u16());
            }
            return Ok(response
                .bytes()
                .with_context(|| format!("failed reading {location}"))?
                .to_vec());
        }
        self.media.fetch(location)
    }

    /// Loop stitching over stored or remote frame locations. Frames that
    /// fail to fetch are dropped; `None` when nothing usable remains.
    pub fn stitch_loop_from_locations(&self, locations: &[String]) -> Option<Vec<u8>> {
        let frames: Vec<Vec<u8>> = locations
            .iter()
            .filter_map(|location| self.fetch_location(location).ok())
            .collect();
        stitch_loop(&frames).ok()
    }

    fn emit_session(&self, session: &SessionStore, event_type: &str, mut payload: EventPayload) {
        payload.insert(
            "session_id".to_string(),
            Value::String(session.session_id.clone()),
        );
        let _ = self.events.emit(event_type, payload);
    }
}

fn build_prompt(text: &str, style: &str, suffix: &str, style_fragment: &str) -> String {
    let mut prompt = format!("{text}, {style} style, {suffix}");
    if !style_fragment.is_empty() {
        prompt.push_str(". ");
        prompt.push_str(style_fragment);
    }
    prompt
}

fn flatten_text_request(request: &TextRequest) -> String {
    let mut sections = vec![request.system.clone()];
    if !request.history.is_empty() {
        let turns = request
            .history
            .iter()
            .map(|(role, content)| format!("{role}: {content}"))
            .collect::<Vec<String>>()
            .join("\n");
        sections.push(format!("Conversation so far:\n{turns}"));
    }
    sections.push(format!("User request: {}", request.prompt));
    sections.join("\n\n")
}

fn extract_gemini_text(payload: &Value) -> String {
    let mut out = Vec::new();
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_string());
                }
            }
        }
    }
    out.join("\n")
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
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

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn gemini_api_base() -> String {
    env::var("GEMINI_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string())
}

fn stability_api_base() -> String {
    env::var("STABILITY_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "https://api.stability.ai".to_string())
}

fn huggingface_api_base() -> String {
    env::var("HUGGINGFACE_API_BASE")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "https://router.huggingface.co/hf-inference".to_string())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn data_url(image: &ImageBytes) -> String {
    format!(
        "data:{};base64,{}",
        image.mime_type.as_deref().unwrap_or("image/png"),
        BASE64.encode(&image.bytes)
    )
}

fn ext_from_mime(mime: Option<&str>, fallback: &str) -> String {
    if let Some(mime) = mime {
        let lowered = mime.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg".to_string();
        }
        if lowered.contains("webp") {
            return "webp".to_string();
        }
        if lowered.contains("gif") {
            return "gif".to_string();
        }
        if lowered.contains("mp4") {
            return "mp4".to_string();
        }
        if lowered.contains("png") {
            return "png".to_string();
        }
    }
    fallback.to_string()
}

fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use image::codecs::gif::GifDecoder;
    use image::AnimationDecoder;
    use serde_json::Value;

    use super::*;

    fn sandbox_engine(temp: &tempfile::TempDir) -> CreativeEngine {
        CreativeEngine {
            media: DirMediaStore::new(temp.path().join("media")).expect("media store"),
            events: EventWriter::new(temp.path().join("events.jsonl"), "engine"),
            http: HttpClient::new(),
            classifier: None,
            text_chain: Vec::new(),
            image_chain: Vec::new(),
            edit_chain: Vec::new(),
            video_chain: Vec::new(),
        }
    }

    fn sandbox_session(temp: &tempfile::TempDir) -> SessionStore {
        SessionStore::open(temp.path().join("session.json"))
    }

    fn tiny_png(seed: u64) -> Vec<u8> {
        placeholder_image_bytes("fixture", 16, 12, seed).expect("placeholder")
    }

    struct ScriptedImageStrategy {
        label: &'static str,
        succeed: bool,
        calls: Arc<AtomicUsize>,
    }

    impl ImageStrategy for ScriptedImageStrategy {
        fn name(&self) -> &str {
            self.label
        }

        fn attempt(&self, _request: &ImageRequest) -> Result<Vec<ImageBytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(vec![ImageBytes {
                    bytes: tiny_png(7),
                    mime_type: Some("image/png".to_string()),
                }])
            } else {
                bail!("scripted failure")
            }
        }
    }

    fn image_request(prompt: &str) -> ImageRequest {
        ImageRequest {
            prompt: prompt.to_string(),
            aspect_ratio: AspectRatio::Square,
            n: 1,
            source_image: None,
            seed: Some(11),
        }
    }

    fn event_types(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[test]
    fn run_chain_short_circuits_on_first_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = EventWriter::new(temp.path().join("events.jsonl"), "engine");
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let chain: Vec<Box<dyn ImageStrategy>> = vec![
            Box::new(ScriptedImageStrategy {
                label: "first",
                succeed: true,
                calls: Arc::clone(&first_calls),
            }),
            Box::new(ScriptedImageStrategy {
                label: "second",
                succeed: true,
                calls: Arc::clone(&second_calls),
            }),
        ];

        let request = image_request("a boat");
        let outcome = run_chain(
            &events,
            "image",
            &chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&request),
        );

        let (provider, images) = outcome.expect("chain result");
        assert_eq!(provider, "first");
        assert_eq!(images.len(), 1);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn run_chain_falls_through_failures_and_exhausts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events_path = temp.path().join("events.jsonl");
        let events = EventWriter::new(&events_path, "engine");
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let chain: Vec<Box<dyn ImageStrategy>> = vec![
            Box::new(ScriptedImageStrategy {
                label: "first",
                succeed: false,
                calls: Arc::clone(&first_calls),
            }),
            Box::new(ScriptedImageStrategy {
                label: "second",
                succeed: false,
                calls: Arc::clone(&second_calls),
            }),
        ];

        let request = image_request("a boat");
        let outcome = run_chain(
            &events,
            "image",
            &chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&request),
        );

        assert!(outcome.is_none());
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        let types = event_types(&events_path);
        assert!(types.contains(&"chain_exhausted".to_string()));
    }

    #[test]
    fn run_chain_recovers_after_leading_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let events = EventWriter::new(temp.path().join("events.jsonl"), "engine");
        let chain: Vec<Box<dyn ImageStrategy>> = vec![
            Box::new(ScriptedImageStrategy {
                label: "flaky",
                succeed: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(ScriptedImageStrategy {
                label: "steady",
                succeed: true,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        ];

        let request = image_request("a boat");
        let outcome = run_chain(
            &events,
            "image",
            &chain,
            |strategy| strategy.name().to_string(),
            |strategy| strategy.attempt(&request),
        );
        assert_eq!(outcome.expect("result").0, "steady");
    }

    #[test]
    fn orchestrate_guarantees_artifact_for_visual_intent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        let result = engine.orchestrate(
            &mut session,
            &Request::from_text("paint a sunset picture of the harbor"),
        )?;

        assert_eq!(result.intent, Intent::ImageGeneration);
        assert!(!result.artifacts.is_empty());
        assert!(result.artifacts[0].title.contains("(Mock)"));
        // the placeholder actually landed in the media store
        assert!(engine.fetch_location(&result.artifacts[0].location).is_ok());
        Ok(())
    }

    #[test]
    fn orchestrate_text_only_produces_no_artifacts() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        let result = engine.orchestrate(
            &mut session,
            &Request::from_text("why do painters prefer north light?"),
        )?;

        assert_eq!(result.intent, Intent::TextOnly);
        assert!(result.artifacts.is_empty());
        assert!(TEXT_ONLY_RESPONSE_POOL.contains(&result.response_text.as_str()));
        Ok(())
    }

    #[test]
    fn attached_image_resolves_to_transformation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        let request = Request {
            text: "make it feel warmer".to_string(),
            attached_image: Some(tiny_png(3)),
            ..Request::default()
        };
        let result = engine.orchestrate(&mut session, &request)?;

        assert_eq!(result.intent, Intent::ImageTransformation);
        assert_eq!(result.confidence, 1.0);
        assert!(!result.artifacts.is_empty());
        Ok(())
    }

    #[test]
    fn attached_image_with_mockup_text_resolves_to_product_mockup() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        let request = Request {
            text: "put this on a mug".to_string(),
            attached_image: Some(tiny_png(3)),
            ..Request::default()
        };
        let result = engine.orchestrate(&mut session, &request)?;

        assert_eq!(result.intent, Intent::ProductMockup);
        assert_eq!(result.confidence, 1.0);
        assert!(!result.artifacts.is_empty());
        Ok(())
    }

    #[test]
    fn acknowledgement_reuses_prior_visual_intent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);
        session.push_assistant_message(
            "Here is your poster.",
            "poster_design",
            vec!["poster.png".to_string()],
        );

        let result = engine.orchestrate(&mut session, &Request::from_text("another one!"))?;

        assert_eq!(result.intent, Intent::PosterDesign);
        assert_eq!(result.confidence, 0.9);
        assert!(!result.artifacts.is_empty());
        Ok(())
    }

    #[test]
    fn acknowledgement_without_visual_prior_stays_textual() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);
        session.push_assistant_message("Happy to chat.", "text_only", Vec::new());

        let result = engine.orchestrate(&mut session, &Request::from_text("ok"))?;

        assert_eq!(result.intent, Intent::TextOnly);
        assert_eq!(result.confidence, 0.85);
        Ok(())
    }

    #[test]
    fn explicit_image_mode_never_resolves_to_text_only() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        let request = Request {
            text: "tell me about lighthouses".to_string(),
            explicit_mode: Some(ExplicitMode::Image),
            ..Request::default()
        };
        let result = engine.orchestrate(&mut session, &request)?;

        assert_eq!(result.intent, Intent::ImageGeneration);
        assert_eq!(result.confidence, 1.0);
        assert!(!result.artifacts.is_empty());
        Ok(())
    }

    #[test]
    fn explicit_video_mode_yields_mock_loop() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        let request = Request {
            text: "ocean waves at dusk".to_string(),
            explicit_mode: Some(ExplicitMode::Video),
            ..Request::default()
        };
        let result = engine.orchestrate(&mut session, &request)?;

        assert_eq!(result.intent, Intent::VideoLoop);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].content_kind, ContentKind::Video);

        let gif = engine.fetch_location(&result.artifacts[0].location)?;
        let frames = GifDecoder::new(Cursor::new(gif.as_slice()))?
            .into_frames()
            .collect_frames()?;
        assert_eq!(frames.len(), LOOP_FRAME_COUNT as usize);
        Ok(())
    }

    #[test]
    fn refinement_target_forces_refinement_intent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);
        let prior = engine.media.save(&tiny_png(9), "artwork.png")?;

        let request = Request {
            text: "more dramatic clouds".to_string(),
            refinement_target: Some(prior),
            ..Request::default()
        };
        let result = engine.orchestrate(&mut session, &request)?;

        assert_eq!(result.intent, Intent::Refinement);
        assert_eq!(result.confidence, 1.0);
        assert!(!result.artifacts.is_empty());
        Ok(())
    }

    #[test]
    fn structurally_invalid_request_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        let err = engine.orchestrate(&mut session, &Request::from_text("   "));
        assert!(err.is_err());
    }

    #[test]
    fn memory_accumulates_styles_across_requests() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        engine.orchestrate(&mut session, &Request::from_text("a noir alley poster"))?;
        engine.orchestrate(&mut session, &Request::from_text("now pastel, please draw it"))?;

        assert!(session.preferred_styles().contains(&"noir".to_string()));
        assert!(session.preferred_styles().contains(&"pastel".to_string()));
        assert_eq!(
            session
                .preferred_styles()
                .iter()
                .filter(|style| *style == "noir")
                .count(),
            1
        );
        Ok(())
    }

    #[test]
    fn orchestrate_event_order_contract() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = sandbox_engine(&temp);
        let mut session = sandbox_session(&temp);

        engine.orchestrate(&mut session, &Request::from_text("draw a quiet harbor"))?;

        let types = event_types(&temp.path().join("events.jsonl"));
        let received = types
            .iter()
            .position(|value| value == "request_received")
            .expect("missing request_received");
        let resolved = types
            .iter()
            .position(|value| value == "intent_resolved")
            .expect("missing intent_resolved");
        let mock = types
            .iter()
            .position(|value| value == "mock_fallback")
            .expect("missing mock_fallback");
        let ready = types
            .iter()
            .position(|value| value == "response_ready")
            .expect("missing response_ready");
        assert!(received < resolved);
        assert!(resolved < mock);
        assert!(mock < ready);
        Ok(())
    }

    #[test]
    fn stitch_loop_resizes_to_first_frame_dimensions() -> Result<()> {
        let frames = vec![
            placeholder_image_bytes("frame", 64, 48, 1)?,
            placeholder_image_bytes("frame", 32, 32, 2)?,
            placeholder_image_bytes("frame", 16, 16, 3)?,
        ];
        let gif = stitch_loop(&frames)?;

        let decoded = GifDecoder::new(Cursor::new(gif.as_slice()))?
            .into_frames()
            .collect_frames()?;
        assert_eq!(decoded.len(), 3);
        for frame in &decoded {
            assert_eq!(frame.buffer().dimensions(), (64, 48));
            assert_eq!(frame.delay().numer_denom_ms(), (LOOP_FRAME_DELAY_MS, 1));
        }
        Ok(())
    }

    #[test]
    fn stitch_loop_drops_undecodable_frames() -> Result<()> {
        let frames = vec![
            b"not an image".to_vec(),
            placeholder_image_bytes("frame", 20, 20, 4)?,
        ];
        let gif = stitch_loop(&frames)?;
        let decoded = GifDecoder::new(Cursor::new(gif.as_slice()))?
            .into_frames()
            .collect_frames()?;
        assert_eq!(decoded.len(), 1);
        Ok(())
    }

    #[test]
    fn stitch_loop_with_no_usable_frames_reports_nothing() {
        assert!(stitch_loop(&[b"junk".to_vec(), b"more junk".to_vec()]).is_err());

        let temp = tempfile::tempdir().expect("tempdir");
        let engine = sandbox_engine(&temp);
        let missing = vec![
            temp.path().join("nope-1.png").to_string_lossy().to_string(),
            temp.path().join("nope-2.png").to_string_lossy().to_string(),
        ];
        assert!(engine.stitch_loop_from_locations(&missing).is_none());
    }

    #[test]
    fn product_mockup_composites_onto_base() -> Result<()> {
        let base = placeholder_image_bytes("base", 200, 200, 5)?;
        let design = placeholder_image_bytes("design", 100, 50, 6)?;

        let shirt = compose_product_mockup(&base, &design, ProductKind::Shirt)?;
        let mug = compose_product_mockup(&base, &design, ProductKind::Mug)?;

        let decoded = image::load_from_memory(&shirt)?;
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 200);
        // distinct placement rectangles land the design differently
        assert_ne!(shirt, mug);
        Ok(())
    }

    #[test]
    fn product_mockup_rejects_undecodable_design() {
        let base = placeholder_image_bytes("base", 64, 64, 5).expect("base");
        assert!(compose_product_mockup(&base, b"garbage", ProductKind::Shirt).is_err());
    }

    #[test]
    fn placeholder_bytes_are_deterministic_per_seed() -> Result<()> {
        let first = placeholder_image_bytes("harbor", 80, 60, 42)?;
        let second = placeholder_image_bytes("harbor", 80, 60, 42)?;
        let other = placeholder_image_bytes("harbor", 80, 60, 43)?;
        assert_eq!(first, second);
        assert_ne!(first, other);
        Ok(())
    }

    #[test]
    fn mock_response_text_matches_intent() {
        let chat = mock_response_text(Intent::TextOnly, 0, 1);
        assert!(TEXT_ONLY_RESPONSE_POOL.contains(&chat.as_str()));

        let visual = mock_response_text(Intent::ImageGeneration, 2, 1);
        assert!(visual.contains('2'));
        assert!(!visual.contains("styling options"));

        let poster = mock_response_text(Intent::PosterDesign, 1, 1);
        assert!(poster.contains("3 styling options"));
    }

    #[test]
    fn poll_bounded_returns_none_at_ceiling() -> Result<()> {
        let settings = PollSettings {
            interval: Duration::from_millis(5),
            max_wait: Duration::from_millis(20),
        };
        let outcome: Option<u32> = poll_bounded(settings, || Ok(Poll::Pending))?;
        assert!(outcome.is_none());

        let mut remaining = 2;
        let outcome = poll_bounded(settings, || {
            if remaining == 0 {
                Ok(Poll::Ready(7u32))
            } else {
                remaining -= 1;
                Ok(Poll::Pending)
            }
        })?;
        assert_eq!(outcome, Some(7));
        Ok(())
    }

    #[test]
    fn generation_uses_first_successful_strategy_artifacts() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = sandbox_engine(&temp);
        engine.image_chain = vec![
            Box::new(ScriptedImageStrategy {
                label: "flaky",
                succeed: false,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(ScriptedImageStrategy {
                label: "steady",
                succeed: true,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        ];
        let mut session = sandbox_session(&temp);

        let result =
            engine.orchestrate(&mut session, &Request::from_text("draw a harbor picture"))?;

        assert_eq!(result.artifacts.len(), 1);
        assert!(!result.artifacts[0].title.contains("(Mock)"));
        assert!(result.artifacts[0].description.contains("steady"));
        Ok(())
    }
}
