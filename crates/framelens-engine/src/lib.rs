use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use framelens_contracts::analysis::{AnalysisResult, Frame, MediaKind};
use framelens_contracts::session::{Session, Turn};
use framelens_contracts::taxonomy::Taxonomy;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const IMAGE_ANALYSIS_MODEL: &str = "gemini-2.5-flash";
pub const VIDEO_ANALYSIS_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_FRAME_COUNT: usize = 15;
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Seeking all the way to the reported duration lands past the last decodable
/// frame on most containers, so every timestamp is clamped this far back.
const END_CLAMP_SECONDS: f64 = 0.1;
const MAX_UPLOAD_DIM: u32 = 1024;
const JPEG_QUALITY: u8 = 90;
const GENERATE_TIMEOUT_SECONDS: u64 = 90;
const STREAM_TIMEOUT_SECONDS: u64 = 300;
const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid media: {0}")]
    InvalidMedia(String),
    #[error("media decode failed: {0}")]
    Decode(String),
    #[error("model response did not match the required structure: {0}")]
    MalformedResponse(String),
    #[error("model transport failure: {message}")]
    ChatTransport {
        status: Option<u16>,
        message: String,
    },
    #[error("no usable API key; select a key and retry")]
    MissingCredential,
}

impl EngineError {
    fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::ChatTransport {
            status,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport encoding
// ---------------------------------------------------------------------------

/// Base64 transport encoding used for every inline media payload.
pub mod transport {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    use super::EngineError;

    pub fn encode(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    pub fn decode(text: &str) -> Result<Vec<u8>, EngineError> {
        BASE64
            .decode(text.as_bytes())
            .map_err(|err| EngineError::Decode(format!("base64 decode failed: {err}")))
    }
}

/// Short content fingerprint of an asset, used as the run id in the event
/// log and to tie exports back to their source bytes.
pub fn asset_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

// ---------------------------------------------------------------------------
// Frame sampler
// ---------------------------------------------------------------------------

/// Evenly spaced sample timestamps over `[0, duration)`, clamped back from
/// the end of stream. Non-decreasing; duplicates from clamping are accepted.
pub fn sample_timestamps(duration_seconds: f64, count: usize) -> Result<Vec<f64>, EngineError> {
    if count == 0 {
        return Err(EngineError::InvalidMedia(
            "frame count must be positive".to_string(),
        ));
    }
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return Err(EngineError::InvalidMedia(format!(
            "video has no usable duration ({duration_seconds})"
        )));
    }

    let interval = duration_seconds / count as f64;
    let limit = (duration_seconds - END_CLAMP_SECONDS).max(0.0);
    Ok((0..count)
        .map(|idx| (idx as f64 * interval).min(limit))
        .collect())
}

/// Samples `count` stills from the video at evenly spaced timestamps and
/// returns them transport-encoded, in ascending timestamp order.
///
/// Extraction is strictly sequential: one seek/rasterize completes before the
/// next starts. Any single failure aborts the whole call; no partial frame
/// sets are returned. Scratch stills live in a temp directory that is
/// released on every exit path.
pub fn sample_video_frames(path: &Path, count: usize) -> Result<Vec<Frame>, EngineError> {
    let duration = probe_duration(path)?;
    let timestamps = sample_timestamps(duration, count)?;

    let scratch = tempfile::tempdir()
        .map_err(|err| EngineError::Decode(format!("scratch dir creation failed: {err}")))?;

    let mut frames = Vec::with_capacity(timestamps.len());
    for (idx, timestamp) in timestamps.iter().enumerate() {
        let still_path = scratch.path().join(format!("frame-{idx:03}.png"));
        extract_still(path, *timestamp, &still_path)?;
        let (bytes, mime_type) = encode_still_jpeg(&still_path)
            .map_err(|err| EngineError::Decode(format!("frame {idx} decode failed: {err}")))?;
        frames.push(Frame {
            timestamp: *timestamp,
            mime_type,
            encoded_data: transport::encode(&bytes),
        });
    }
    Ok(frames)
}

/// Reads the container duration in seconds via ffprobe.
fn probe_duration(path: &Path) -> Result<f64, EngineError> {
    if !path.exists() {
        return Err(EngineError::InvalidMedia(format!(
            "file not found: {}",
            path.display()
        )));
    }

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|err| EngineError::Decode(format!("ffprobe launch failed: {err}")))?;

    if !output.status.success() {
        return Err(EngineError::InvalidMedia(format!(
            "ffprobe rejected the file: {}",
            truncate_text(&String::from_utf8_lossy(&output.stderr), ERROR_BODY_MAX_CHARS)
        )));
    }

    let payload: Value = serde_json::from_slice(&output.stdout)
        .map_err(|err| EngineError::Decode(format!("ffprobe output parse failed: {err}")))?;
    duration_from_probe(&payload).ok_or_else(|| {
        EngineError::InvalidMedia("video has no duration or is invalid".to_string())
    })
}

/// Duration from the format section, falling back to the longest stream.
fn duration_from_probe(payload: &Value) -> Option<f64> {
    let format_duration = payload
        .get("format")
        .and_then(|format| format.get("duration"))
        .and_then(parse_probe_seconds);
    let stream_duration = payload
        .get("streams")
        .and_then(Value::as_array)
        .map(|streams| {
            streams
                .iter()
                .filter_map(|stream| stream.get("duration").and_then(parse_probe_seconds))
                .fold(0.0_f64, f64::max)
        })
        .filter(|value| *value > 0.0);

    format_duration
        .filter(|value| *value > 0.0)
        .or(stream_duration)
}

fn parse_probe_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

fn extract_still(video: &Path, timestamp: f64, out: &Path) -> Result<(), EngineError> {
    let output = Command::new("ffmpeg")
        .args(["-y", "-ss", &format!("{timestamp:.3}"), "-i"])
        .arg(video)
        .args(["-frames:v", "1"])
        .arg(out)
        .output()
        .map_err(|err| EngineError::Decode(format!("ffmpeg launch failed: {err}")))?;

    if !output.status.success() || !out.exists() {
        return Err(EngineError::Decode(format!(
            "frame extraction at {timestamp:.2}s failed: {}",
            truncate_text(&String::from_utf8_lossy(&output.stderr), ERROR_BODY_MAX_CHARS)
        )));
    }
    Ok(())
}

/// Decodes a still, flattens alpha onto white, bounds the long edge, and
/// re-encodes as JPEG for transport.
fn encode_still_jpeg(path: &Path) -> Result<(Vec<u8>, String), String> {
    let decoded = image::open(path).map_err(|err| err.to_string())?;
    let rgba = decoded.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }

    let mut bounded = DynamicImage::ImageRgba8(flattened);
    if bounded.width().max(bounded.height()) > MAX_UPLOAD_DIM {
        bounded = bounded.resize(MAX_UPLOAD_DIM, MAX_UPLOAD_DIM, FilterType::Triangle);
    }

    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(bounded.to_rgb8()))
        .map_err(|err| err.to_string())?;
    Ok((bytes, "image/jpeg".to_string()))
}

/// Loads an uploaded image for analysis. Formats the image crate cannot
/// decode are passed through as raw bytes with a guessed mime type.
fn load_upload_image(path: &Path) -> Result<(Vec<u8>, String), EngineError> {
    if let Ok(prepared) = encode_still_jpeg(path) {
        return Ok(prepared);
    }
    let bytes = std::fs::read(path).map_err(|err| {
        EngineError::InvalidMedia(format!("failed reading {}: {err}", path.display()))
    })?;
    Ok((bytes, guess_image_mime(path).to_string()))
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" | "heif" => "image/heic",
        _ => "image/png",
    }
}

// ---------------------------------------------------------------------------
// Analysis request builder
// ---------------------------------------------------------------------------

const IMAGE_ANALYSIS_PROMPT: &str = r#"You are an expert in documentary theory and critical media analysis, applying the frameworks from the 'Documentary in the Age of AI' workshop. Your task is to analyze the provided image through this specific lens, focusing on how credibility now rests on making the process legible.

Analyze the image based on the following structure, providing your analysis in markdown:

**1. Bidirectional map: relation to the fact**
*   **Material signature:** Describe the image's visual texture (grain, color palette, focus, lighting). What historical period or technology does its aesthetic suggest (e.g., Super-8, VHS, early digital)? How does this texture, which can now be synthetically replicated, function as 'style' rather than a 'trace' of reality?
*   **Archival nature:** If this image were found in an archive, what might it represent? Distinguish between its potential as a *captured archive* (a direct recording of an event) versus a *synthetic archive* (generated from a dataset). What is its relationship to a physical event, and how can we know?

**2. Taxonomy classification (Mililiere framework)**
*   **Classification Path:** Based on the detailed media taxonomy provided at the end of this prompt, determine the most accurate classification for this image. Provide the full path to the most specific category (e.g., 'Machine-made > Synthetic > Partially Synthetic > Local > DL-BASED > Visual > Static').
*   **Justification:** Briefly explain why you chose this path, referencing specific visual evidence from the image and ruling out other plausible categories.

**3. CEI framework evaluation (Congruence, Evidence, Uncertainty)**
*   **Historical congruence (C):** Does the content (e.g., clothing, objects, environment) appear consistent with a specific time period? Are there any anachronisms a machine might miss but a human expert would spot?
*   **Available evidence (E):** Within the image itself, what serves as evidence for its claims? What is ambiguous or requires external verification?
*   **Declared uncertainty (I):** Imagine this image in a documentary. What context is a machine likely to miss entirely (e.g., emotional tone, cultural symbolism, political subtext)? How could a filmmaker declare the uncertainty or contested nature of this image rather than presenting it as fact?

**4. Machine vision bias & blind spots**
*   **Probabilistic labels:** What simple, statistical labels would a standard computer vision model likely assign to this image (e.g., 'crowd,' 'city,' 'protest')?
*   **Potential misinterpretation:** How might these labels be reductive or biased? For example, could a 'protest' be mislabeled as a 'riot'? Could cultural nuances lead to incorrect classifications? What does the machine fail to "see," and why does that matter for documentary ethics?"#;

const VIDEO_ANALYSIS_PROMPT_PREFIX: &str = r#"You are an expert in documentary theory and critical media analysis, applying the frameworks from the 'Documentary in the Age of AI' workshop. You will be given a sequence of frames from a video, each with a timestamp. Your task is to analyze the sequence as a whole, focusing on how the progression of images builds meaning and potential bias.

Your output MUST be a valid JSON object with NO additional text or markdown formatting before or after it.

The JSON object must have this exact structure:
{
  "synopsis": "A concise, one-paragraph summary of the video's content and narrative, based on visual analysis.",
  "suggestedTitle": "A creative and relevant title for this video sequence.",
  "technicalDescription": {
    "duration": "The total duration of the provided clip, in M:SS format.",
    "estimatedShotCount": "An estimation of the number of distinct shots or camera angles (e.g., '1-2 shots', 'Multiple quick cuts').",
    "estimatedYear": "An estimation of the decade the footage was likely filmed (e.g., '1980s', '2010s').",
    "estimatedOrigin": "An estimation of the production context (e.g., 'Amateur home video', 'Professional news report', 'Artistic short film').",
    "formatAesthetic": "A description of the visual style (e.g., 'Grainy 16mm film', 'Low-resolution VHS', 'Crisp 4K digital')."
  },
  "taxonomyClassification": {
    "path": "The full path to the most specific and relevant category from the provided taxonomy.",
    "reasoning": "A detailed justification for the chosen classification path, referencing visual evidence from the frames."
  },
  "analysis": "A detailed analysis string in markdown format.",
  "events": [
    {
      "timestamp": 0,
      "timeString": "0:00",
      "description": "A brief description of the key event at this timestamp."
    }
  ],
  "keyPeople": [
    {
        "timestamp": 0,
        "timeString": "0:00",
        "name": "Person's name or a brief description (e.g., 'Person in red hat')",
        "description": "A brief description of the person's significance or first notable action."
    }
  ]
}

**Instructions for the `analysis` field:**

Analyze the video frames based on the following structure, formatting the entire analysis as a single markdown string:

**1. Temporal analysis & narrative construction**
*   Describe the sequence of events depicted across the frames. What story does the progression of images tell? How does motion and the sequence of frames imply causality or relationships that a single static image would miss?

**2. Process index**
*   Consider the concept of a 'process index.' What visual clues suggest how this footage was made? How does the sequence either build or erode trust in its authenticity?

**3. CEI framework evaluation (Congruence, Evidence, Uncertainty)**
*   **Historical congruence (C):** Do the actions, environment, and objects appear consistent over time? Does the sequence reinforce or contradict a specific historical context?
*   **Available evidence (E):** How does the sequence as a whole function as evidence? Does the progression of frames strengthen or weaken the interpretation of the event compared to a single photo?
*   **Declared uncertainty (I):** What narrative or emotional elements are likely missed by an AI analyzing these frames (e.g., implied sound, character motivation)? If this sequence were a reconstruction, what techniques could a filmmaker use to signal its synthetic nature to the audience?

**4. Machine vision bias & evolving interpretation**
*   **Evolving labels:** How might a vision model's labels change as the sequence progresses? For example, could a gathering initially labeled 'crowd' be re-labeled 'riot' based on actions in later frames? How does this demonstrate bias in temporal analysis?
*   **Potential misinterpretation:** What are the risks of misinterpreting the entire event based on this sequence? What crucial context is missing from these frames alone?

**Instructions for the `taxonomyClassification` field:**
Use the detailed media taxonomy (Mililiere framework) provided at the end of this prompt to classify the video. Select the most specific path that accurately describes the footage.

**Instructions for the `events` field:**
Identify 3-5 of the most significant moments or changes in the video sequence. For each moment, create an object in the 'events' array with:
- `timestamp`: The timestamp in seconds (float or integer) of the frame where the event occurs.
- `timeString`: A formatted string like "M:SS".
- `description`: A concise, one-sentence description of the event.

**Instructions for the `keyPeople` field:**
Identify up to 3 key individuals who appear in the video. For each person, provide the timestamp of their first clear appearance.
- `timestamp`: The timestamp in seconds (float or integer) of their first appearance.
- `timeString`: A formatted string like "M:SS".
- `name`: The person's name if identifiable, otherwise a descriptive label (e.g., "Woman in blue jacket").
- `description`: A concise, one-sentence description of their role or significance.
If no specific individuals are noteworthy, return an empty array [].

Now, analyze the following frames, which span a total duration of [VIDEO_DURATION]:"#;

const DURATION_PLACEHOLDER: &str = "[VIDEO_DURATION]";
const TAXONOMY_SECTION_HEADER: &str = "\n---\n**MEDIA TAXONOMY FOR CLASSIFICATION:**\n";

const FOLLOW_UP_SYSTEM_INSTRUCTION: &str = "You are an expert in documentary theory and \
critical media analysis. You have already provided an initial analysis of the media. Continue \
the conversation by answering the user's follow-up questions about it, using the initial \
analysis as context provided in the first turn.";

/// `M:SS` clock string for a duration in seconds.
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

fn inline_data_part(mime_type: &str, encoded_data: &str) -> Value {
    json!({
        "inlineData": {
            "mimeType": mime_type,
            "data": encoded_data,
        }
    })
}

/// Request parts for a single-image analysis: the instructional template with
/// the taxonomy appended as grounding text, then the inline image.
pub fn build_image_request_parts(
    mime_type: &str,
    encoded_data: &str,
    taxonomy: &Taxonomy,
) -> Vec<Value> {
    let prompt = format!(
        "{IMAGE_ANALYSIS_PROMPT}\n{TAXONOMY_SECTION_HEADER}{}",
        taxonomy.prompt_json()
    );
    vec![
        json!({ "text": prompt }),
        inline_data_part(mime_type, encoded_data),
    ]
}

/// Request parts for a video analysis: the duration-parameterized template,
/// then a positional marker and inline image per frame, then the taxonomy.
///
/// Frame order must match the sampler's ascending-timestamp order; the
/// markers ("Frame N at Ts") are what downstream prompts reference.
pub fn build_video_request_parts(frames: &[Frame], taxonomy: &Taxonomy) -> Vec<Value> {
    let duration_seconds = frames.last().map(|frame| frame.timestamp).unwrap_or(0.0);
    let prompt =
        VIDEO_ANALYSIS_PROMPT_PREFIX.replace(DURATION_PLACEHOLDER, &format_clock(duration_seconds));

    let mut parts = Vec::with_capacity(frames.len() * 2 + 2);
    parts.push(json!({ "text": prompt }));
    for (idx, frame) in frames.iter().enumerate() {
        parts.push(json!({
            "text": format!("\nFrame {} at {:.2}s:", idx + 1, frame.timestamp),
        }));
        parts.push(inline_data_part(&frame.mime_type, &frame.encoded_data));
    }
    parts.push(json!({
        "text": format!("{TAXONOMY_SECTION_HEADER}{}\n", taxonomy.prompt_json()),
    }));
    parts
}

/// Generation config for the structured video call: JSON output is enforced
/// server-side by the response schema as well as validated at parse time.
pub fn video_generation_config() -> Value {
    json!({
        "responseMimeType": "application/json",
        "responseSchema": {
            "type": "OBJECT",
            "properties": {
                "synopsis": { "type": "STRING" },
                "suggestedTitle": { "type": "STRING" },
                "technicalDescription": {
                    "type": "OBJECT",
                    "properties": {
                        "duration": { "type": "STRING" },
                        "estimatedShotCount": { "type": "STRING" },
                        "estimatedYear": { "type": "STRING" },
                        "estimatedOrigin": { "type": "STRING" },
                        "formatAesthetic": { "type": "STRING" },
                    },
                    "required": [
                        "duration",
                        "estimatedShotCount",
                        "estimatedYear",
                        "estimatedOrigin",
                        "formatAesthetic",
                    ],
                },
                "taxonomyClassification": {
                    "type": "OBJECT",
                    "properties": {
                        "path": { "type": "STRING" },
                        "reasoning": { "type": "STRING" },
                    },
                    "required": ["path", "reasoning"],
                },
                "analysis": { "type": "STRING" },
                "events": {
                    "type": "ARRAY",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "timestamp": { "type": "NUMBER" },
                            "timeString": { "type": "STRING" },
                            "description": { "type": "STRING" },
                        },
                        "required": ["timestamp", "timeString", "description"],
                    },
                },
                "keyPeople": {
                    "type": "ARRAY",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "timestamp": { "type": "NUMBER" },
                            "timeString": { "type": "STRING" },
                            "name": { "type": "STRING" },
                            "description": { "type": "STRING" },
                        },
                        "required": ["timestamp", "timeString", "name", "description"],
                    },
                },
            },
            "required": [
                "synopsis",
                "suggestedTitle",
                "technicalDescription",
                "taxonomyClassification",
                "analysis",
                "events",
                "keyPeople",
            ],
        },
    })
}

// ---------------------------------------------------------------------------
// Structured response parser
// ---------------------------------------------------------------------------

/// Strips one enclosing fenced code block (``` or ```json), a formatting
/// artifact some model replies wrap the payload in. The fence tokens are
/// stripped independently of line boundaries, so a closing fence glued to
/// the payload's last line still unwraps. Clean input passes through
/// unchanged, so the parse is idempotent.
pub fn strip_code_fence(text: &str) -> String {
    let raw = text.trim();
    let Some(tail) = raw.strip_prefix("```") else {
        return raw.to_string();
    };
    let Some(body) = tail.strip_suffix("```") else {
        return raw.to_string();
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.trim().to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoAnalysisPayload {
    analysis: String,
    events: Vec<framelens_contracts::analysis::VideoEvent>,
    #[serde(default)]
    key_people: Vec<framelens_contracts::analysis::KeyPerson>,
    #[serde(default)]
    synopsis: Option<String>,
    #[serde(default)]
    suggested_title: Option<String>,
    #[serde(default)]
    technical_description: Option<framelens_contracts::analysis::TechnicalDescription>,
    #[serde(default)]
    taxonomy_classification: Option<framelens_contracts::analysis::TaxonomyClassification>,
}

/// Decodes a structured video-analysis reply. All-or-nothing: a missing or
/// mistyped required field fails the whole call rather than returning a
/// half-populated result. `keyPeople` may be absent in older response shapes
/// and decodes as empty.
pub fn parse_video_analysis(raw: &str) -> Result<AnalysisResult, EngineError> {
    let clean = strip_code_fence(raw);
    let payload: VideoAnalysisPayload = serde_json::from_str(&clean)
        .map_err(|err| EngineError::MalformedResponse(err.to_string()))?;
    Ok(AnalysisResult {
        analysis: payload.analysis,
        synopsis: payload.synopsis,
        suggested_title: payload.suggested_title,
        technical_description: payload.technical_description,
        taxonomy_classification: payload.taxonomy_classification,
        events: payload.events,
        key_people: payload.key_people,
    })
}

// ---------------------------------------------------------------------------
// Model client
// ---------------------------------------------------------------------------

/// Blocking client for the `generateContent` API family. The credential is
/// injected by the caller; the engine never reads the environment.
pub struct GeminiClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, EngineError> {
        Self::with_api_base(api_key, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        api_key: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(EngineError::MissingCredential);
        }
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http: HttpClient::new(),
        })
    }

    fn generate_endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.api_base, model.trim())
    }

    fn stream_endpoint(&self, model: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent",
            self.api_base,
            model.trim()
        )
    }

    /// One-shot analysis call: a single user turn of `parts`.
    pub fn generate_single(
        &self,
        model: &str,
        parts: Vec<Value>,
        generation_config: Option<Value>,
    ) -> Result<String, EngineError> {
        let contents = vec![json!({ "role": "user", "parts": parts })];
        self.generate_conversation(model, contents, None, generation_config)
    }

    /// Multi-turn call over an explicit `contents` history.
    pub fn generate_conversation(
        &self,
        model: &str,
        contents: Vec<Value>,
        system_instruction: Option<&str>,
        generation_config: Option<Value>,
    ) -> Result<String, EngineError> {
        let payload = build_generate_payload(contents, system_instruction, generation_config);
        let response = self
            .http
            .post(self.generate_endpoint(model))
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(GENERATE_TIMEOUT_SECONDS))
            .json(&payload)
            .send()
            .map_err(|err| EngineError::transport(None, err.to_string()))?;

        let body = read_success_body(response)?;
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            EngineError::transport(None, format!("invalid JSON envelope from backend: {err}"))
        })?;
        let text = extract_reply_text(&parsed);
        if text.is_empty() {
            return Err(EngineError::MalformedResponse(
                "model returned an empty reply".to_string(),
            ));
        }
        Ok(text)
    }

    /// Opens an SSE stream over the same conversation shape. The caller owns
    /// reading the fragments; see [`send_follow_up_streaming`].
    fn open_conversation_stream(
        &self,
        model: &str,
        contents: Vec<Value>,
        system_instruction: Option<&str>,
    ) -> Result<HttpResponse, EngineError> {
        let payload = build_generate_payload(contents, system_instruction, None);
        let response = self
            .http
            .post(self.stream_endpoint(model))
            .query(&[("key", self.api_key.as_str()), ("alt", "sse")])
            .timeout(Duration::from_secs(STREAM_TIMEOUT_SECONDS))
            .json(&payload)
            .send()
            .map_err(|err| EngineError::transport(None, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            if matches!(code, 401 | 403) {
                return Err(EngineError::MissingCredential);
            }
            return Err(EngineError::transport(
                Some(code),
                truncate_text(&body, ERROR_BODY_MAX_CHARS),
            ));
        }
        Ok(response)
    }
}

fn build_generate_payload(
    contents: Vec<Value>,
    system_instruction: Option<&str>,
    generation_config: Option<Value>,
) -> Value {
    let mut payload = json!({ "contents": contents });
    if let Some(instruction) = system_instruction {
        payload["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    if let Some(config) = generation_config {
        payload["generationConfig"] = config;
    }
    payload
}

fn read_success_body(response: HttpResponse) -> Result<String, EngineError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| EngineError::transport(Some(code), err.to_string()))?;
    if matches!(code, 401 | 403) {
        return Err(EngineError::MissingCredential);
    }
    if !status.is_success() {
        return Err(EngineError::transport(
            Some(code),
            truncate_text(&body, ERROR_BODY_MAX_CHARS),
        ));
    }
    Ok(body)
}

/// Reply text from a `generateContent` envelope: every text part of the
/// first candidate, concatenated in order.
fn extract_reply_text(payload: &Value) -> String {
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    out.trim().to_string()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

// ---------------------------------------------------------------------------
// Chat turn executor
// ---------------------------------------------------------------------------

fn contents_from_transcript(transcript: &[Turn], pending_message: &str) -> Vec<Value> {
    let mut contents = Vec::with_capacity(transcript.len() + 1);
    for turn in transcript {
        contents.push(json!({
            "role": turn.role.wire_name(),
            "parts": [{ "text": turn.text }],
        }));
    }
    contents.push(json!({
        "role": "user",
        "parts": [{ "text": pending_message }],
    }));
    contents
}

/// Sends one blocking follow-up turn. The exchange is recorded on the
/// session only after the backend replies, so a failed turn leaves the
/// transcript untouched and may be retried as-is.
pub fn send_follow_up(
    client: &GeminiClient,
    session: &mut Session,
    message: &str,
) -> Result<String, EngineError> {
    let contents = contents_from_transcript(session.transcript(), message);
    let reply = client.generate_conversation(
        &session.model,
        contents,
        Some(FOLLOW_UP_SYSTEM_INSTRUCTION),
        None,
    )?;
    session.record_exchange(message, reply.clone());
    Ok(reply)
}

/// Sends one follow-up turn in streaming mode. Fragments arrive in emission
/// order; their concatenation equals the blocking reply for the same model
/// output. The exchange is recorded on the session only once the stream ends
/// cleanly.
pub fn send_follow_up_streaming<'s>(
    client: &GeminiClient,
    session: &'s mut Session,
    message: &str,
) -> Result<StreamedReply<'s, BufReader<HttpResponse>>, EngineError> {
    let contents = contents_from_transcript(session.transcript(), message);
    let response = client.open_conversation_stream(
        &session.model,
        contents,
        Some(FOLLOW_UP_SYSTEM_INSTRUCTION),
    )?;
    Ok(StreamedReply::from_parts(
        SseFragments::new(BufReader::new(response)),
        session,
        message.to_string(),
    ))
}

/// Pull-based reader over an SSE body, yielding one text fragment per
/// `data:` payload that carries candidate text. Finite and single-pass: the
/// stream ends at EOF.
struct SseFragments<R: BufRead> {
    reader: R,
    done: bool,
}

impl<R: BufRead> SseFragments<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseFragments<R> {
    type Item = Result<String, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(EngineError::transport(
                        None,
                        format!("stream read failed: {err}"),
                    )));
                }
            }

            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            let fragment = extract_reply_fragment(&chunk);
            if !fragment.is_empty() {
                return Some(Ok(fragment));
            }
        }
        None
    }
}

/// Like [`extract_reply_text`] but without trimming: streamed fragments keep
/// their boundary whitespace so concatenation reproduces the full reply.
fn extract_reply_fragment(chunk: &Value) -> String {
    let parts = chunk
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    out
}

/// One in-flight streamed reply. Iterating yields fragments; when the stream
/// is exhausted without a transport error the user/model exchange is
/// committed to the session. An error mid-stream leaves the session
/// unchanged so the same turn may be retried.
pub struct StreamedReply<'s, R: BufRead> {
    fragments: SseFragments<R>,
    session: &'s mut Session,
    pending_message: String,
    accumulated: String,
    failed: bool,
    committed: bool,
}

impl<'s, R: BufRead> StreamedReply<'s, R> {
    fn from_parts(fragments: SseFragments<R>, session: &'s mut Session, message: String) -> Self {
        Self {
            fragments,
            session,
            pending_message: message,
            accumulated: String::new(),
            failed: false,
            committed: false,
        }
    }

    /// The reply text accumulated so far.
    pub fn text(&self) -> &str {
        &self.accumulated
    }
}

impl<R: BufRead> Iterator for StreamedReply<'_, R> {
    type Item = Result<String, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.fragments.next() {
            Some(Ok(fragment)) => {
                self.accumulated.push_str(&fragment);
                Some(Ok(fragment))
            }
            Some(Err(err)) => {
                self.failed = true;
                Some(Err(err))
            }
            None => {
                if !self.failed && !self.committed {
                    self.session
                        .record_exchange(self.pending_message.clone(), self.accumulated.clone());
                    self.committed = true;
                }
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Front door for the analysis pipeline: owns the client, the taxonomy
/// grounding data, and the model choices.
pub struct Analyzer {
    client: GeminiClient,
    taxonomy: &'static Taxonomy,
    image_model: String,
    video_model: String,
}

impl Analyzer {
    pub fn new(client: GeminiClient) -> Self {
        Self {
            client,
            taxonomy: Taxonomy::embedded(),
            image_model: IMAGE_ANALYSIS_MODEL.to_string(),
            video_model: VIDEO_ANALYSIS_MODEL.to_string(),
        }
    }

    /// Overrides both analysis models, e.g. from a CLI flag.
    pub fn set_model(&mut self, model: Option<String>) {
        if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
            self.image_model = model.clone();
            self.video_model = model;
        }
    }

    pub fn client(&self) -> &GeminiClient {
        &self.client
    }

    /// Analyzes a single image and seeds a follow-up session from the
    /// narrative. The reply is free markdown, not a structured document.
    pub fn analyze_image(&self, path: &Path) -> Result<(AnalysisResult, Session), EngineError> {
        let (bytes, mime_type) = load_upload_image(path)?;
        let parts =
            build_image_request_parts(&mime_type, &transport::encode(&bytes), self.taxonomy);
        let text = self.client.generate_single(&self.image_model, parts, None)?;
        let result = AnalysisResult::from_narrative(text);
        let session = Session::continue_from(MediaKind::Image, &result, &self.image_model);
        Ok((result, session))
    }

    /// Samples the video, requests a structured analysis, and seeds a
    /// follow-up session from the parsed narrative.
    pub fn analyze_video(
        &self,
        path: &Path,
        frame_count: usize,
    ) -> Result<(AnalysisResult, Session, Vec<Frame>), EngineError> {
        let frames = sample_video_frames(path, frame_count)?;
        let parts = build_video_request_parts(&frames, self.taxonomy);
        let text =
            self.client
                .generate_single(&self.video_model, parts, Some(video_generation_config()))?;
        let result = parse_video_analysis(&text)?;
        let session = Session::continue_from(MediaKind::Video, &result, &self.video_model);
        Ok((result, session, frames))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use framelens_contracts::analysis::AnalysisResult;
    use framelens_contracts::session::{Role, Session};
    use framelens_contracts::taxonomy::Taxonomy;
    use serde_json::json;

    use super::*;

    fn frame_at(timestamp: f64) -> Frame {
        Frame {
            timestamp,
            mime_type: "image/jpeg".to_string(),
            encoded_data: transport::encode(b"frame-bytes"),
        }
    }

    #[test]
    fn sample_timestamps_thirty_seconds_fifteen_frames() {
        let timestamps = sample_timestamps(30.0, 15).expect("timestamps");
        assert_eq!(timestamps.len(), 15);
        let expected: Vec<f64> = (0..15).map(|idx| idx as f64 * 2.0).collect();
        for (got, want) in timestamps.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
        }
    }

    #[test]
    fn sample_timestamps_are_nondecreasing_and_in_range() {
        for (duration, count) in [(1.0, 7), (30.0, 15), (0.5, 3), (3600.0, 4)] {
            let timestamps = sample_timestamps(duration, count).expect("timestamps");
            assert_eq!(timestamps.len(), count);
            for pair in timestamps.windows(2) {
                assert!(pair[0] <= pair[1]);
            }
            for value in &timestamps {
                assert!(*value >= 0.0 && *value < duration);
            }
        }
    }

    #[test]
    fn sample_timestamps_clamp_near_end_of_stream() {
        let timestamps = sample_timestamps(2.0, 20).expect("timestamps");
        assert!(timestamps.iter().all(|value| *value <= 1.9));
        // late samples collapse onto the clamp; duplicates are accepted
        assert_eq!(*timestamps.last().expect("last"), 1.9);
    }

    #[test]
    fn sample_timestamps_reject_bad_inputs() {
        assert!(matches!(
            sample_timestamps(0.0, 15),
            Err(EngineError::InvalidMedia(_))
        ));
        assert!(matches!(
            sample_timestamps(-3.0, 15),
            Err(EngineError::InvalidMedia(_))
        ));
        assert!(matches!(
            sample_timestamps(30.0, 0),
            Err(EngineError::InvalidMedia(_))
        ));
    }

    #[test]
    fn duration_from_probe_prefers_format_then_streams() {
        let both = json!({
            "format": { "duration": "30.500000" },
            "streams": [{ "duration": "29.97" }],
        });
        assert_eq!(duration_from_probe(&both), Some(30.5));

        let streams_only = json!({
            "format": {},
            "streams": [{ "duration": "12.0" }, { "duration": "29.97" }],
        });
        assert_eq!(duration_from_probe(&streams_only), Some(29.97));

        let neither = json!({ "format": {}, "streams": [] });
        assert_eq!(duration_from_probe(&neither), None);
    }

    #[test]
    fn transport_round_trips_arbitrary_bytes() {
        let cases: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0_u8],
            vec![0xff, 0x00, 0x7f, 0x80],
            (0..=255).collect(),
        ];
        for bytes in cases {
            let encoded = transport::encode(&bytes);
            assert_eq!(transport::decode(&encoded).expect("decode"), bytes);
        }
    }

    #[test]
    fn transport_decode_rejects_garbage() {
        assert!(matches!(
            transport::decode("not base64!!!"),
            Err(EngineError::Decode(_))
        ));
    }

    #[test]
    fn asset_fingerprint_is_short_stable_hex() {
        let first = asset_fingerprint(b"same bytes");
        let second = asset_fingerprint(b"same bytes");
        let other = asset_fingerprint(b"other bytes");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.len(), 12);
        assert!(first.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn format_clock_matches_m_ss() {
        assert_eq!(format_clock(0.0), "0:00");
        assert_eq!(format_clock(9.4), "0:09");
        assert_eq!(format_clock(59.6), "1:00");
        assert_eq!(format_clock(125.0), "2:05");
        assert_eq!(format_clock(-1.0), "0:00");
    }

    #[test]
    fn image_request_has_prompt_then_inline_image() {
        let parts = build_image_request_parts("image/png", "QUJD", Taxonomy::embedded());
        assert_eq!(parts.len(), 2);
        let prompt = parts[0]["text"].as_str().expect("prompt text");
        assert!(prompt.contains("MEDIA TAXONOMY FOR CLASSIFICATION"));
        assert!(prompt.contains("Machine-made"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(parts[1]["inlineData"]["data"], json!("QUJD"));
    }

    #[test]
    fn video_request_interleaves_markers_and_frames() {
        let frames = vec![frame_at(0.0), frame_at(2.0), frame_at(28.0)];
        let parts = build_video_request_parts(&frames, Taxonomy::embedded());
        // prompt + (marker, frame) per sample + taxonomy suffix
        assert_eq!(parts.len(), 2 + frames.len() * 2);

        let prompt = parts[0]["text"].as_str().expect("prompt");
        assert!(prompt.contains("a total duration of 0:28"));
        assert!(!prompt.contains(DURATION_PLACEHOLDER));

        assert_eq!(parts[1]["text"], json!("\nFrame 1 at 0.00s:"));
        assert!(parts[2]["inlineData"]["data"].is_string());
        assert_eq!(parts[3]["text"], json!("\nFrame 2 at 2.00s:"));
        assert_eq!(parts[5]["text"], json!("\nFrame 3 at 28.00s:"));

        let suffix = parts.last().expect("suffix")["text"]
            .as_str()
            .expect("text");
        assert!(suffix.contains("MEDIA TAXONOMY FOR CLASSIFICATION"));
    }

    #[test]
    fn encode_still_jpeg_flattens_and_reencodes() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let source = scratch.path().join("still.png");
        let mut pixels = RgbaImage::new(2, 2);
        pixels.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        pixels.put_pixel(1, 1, Rgba([0, 0, 0, 0])); // transparent, flattens to white
        pixels.save(&source).expect("write png");

        let (bytes, mime_type) = encode_still_jpeg(&source).expect("encode");
        assert_eq!(mime_type, "image/jpeg");
        let decoded = image::load_from_memory(&bytes).expect("valid jpeg");
        assert_eq!((decoded.width(), decoded.height()), (2, 2));
    }

    #[test]
    fn video_generation_config_carries_response_schema() {
        let config = video_generation_config();
        assert_eq!(config["responseMimeType"], json!("application/json"));

        let schema = &config["responseSchema"];
        assert_eq!(schema["type"], json!("OBJECT"));
        let required: Vec<&str> = schema["required"]
            .as_array()
            .expect("required list")
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"analysis"));
        assert!(required.contains(&"events"));
        assert!(required.contains(&"keyPeople"));
        assert_eq!(
            schema["properties"]["events"]["items"]["properties"]["timeString"]["type"],
            json!("STRING")
        );
    }

    #[test]
    fn strip_code_fence_unwraps_labeled_blocks() {
        assert_eq!(
            strip_code_fence("```json\n{\"analysis\":\"x\"}\n```"),
            "{\"analysis\":\"x\"}"
        );
        assert_eq!(
            strip_code_fence("```\n{\"analysis\":\"x\"}\n```"),
            "{\"analysis\":\"x\"}"
        );
        assert_eq!(strip_code_fence("{\"analysis\":\"x\"}"), "{\"analysis\":\"x\"}");
        assert_eq!(strip_code_fence("``````"), "");
        assert_eq!(strip_code_fence("```"), "```");
    }

    #[test]
    fn strip_code_fence_handles_fence_glued_to_payload() {
        // closing fence on the payload's own last line, no newline before it
        assert_eq!(
            strip_code_fence("```json\n{\"analysis\":\"x\"}```"),
            "{\"analysis\":\"x\"}"
        );
        assert_eq!(strip_code_fence("```json{\"a\":1}```"), "{\"a\":1}");
    }

    #[test]
    fn parse_accepts_fence_glued_to_payload() {
        let raw = "```json\n{\"analysis\":\"x\",\"events\":[]}```";
        let result = parse_video_analysis(raw).expect("parse");
        assert_eq!(result.analysis, "x");
    }

    #[test]
    fn parse_accepts_fenced_wrapper() {
        let raw = "```json\n{\"analysis\":\"x\",\"events\":[],\"keyPeople\":[]}\n```";
        let result = parse_video_analysis(raw).expect("parse");
        assert_eq!(result.analysis, "x");
        assert!(result.events.is_empty());
        assert!(result.key_people.is_empty());
    }

    #[test]
    fn parse_is_idempotent_on_clean_input() {
        let clean = "{\"analysis\":\"x\",\"events\":[]}";
        let wrapped = format!("```json\n{clean}\n```");
        assert_eq!(
            parse_video_analysis(clean).expect("clean"),
            parse_video_analysis(&wrapped).expect("wrapped")
        );
    }

    #[test]
    fn parse_defaults_missing_key_people() {
        let raw = r#"{
            "analysis": "x",
            "events": [
                { "timestamp": 4.0, "timeString": "0:04", "description": "later" },
                { "timestamp": 1.0, "timeString": "0:01", "description": "earlier" }
            ]
        }"#;
        let result = parse_video_analysis(raw).expect("parse");
        assert!(result.key_people.is_empty());
        // model-declared order is preserved, never re-sorted by timestamp
        assert_eq!(result.events[0].description, "later");
        assert_eq!(result.events[1].description, "earlier");
    }

    #[test]
    fn parse_rejects_missing_analysis() {
        let raw = "{\"events\":[],\"keyPeople\":[]}";
        assert!(matches!(
            parse_video_analysis(raw),
            Err(EngineError::MalformedResponse(_))
        ));
    }

    #[test]
    fn parse_rejects_truncated_json() {
        let raw = "{\"analysis\":\"x\",\"events\":[";
        assert!(matches!(
            parse_video_analysis(raw),
            Err(EngineError::MalformedResponse(_))
        ));
    }

    #[test]
    fn parse_carries_structured_fields_through() {
        let raw = r#"{
            "synopsis": "A crowd gathers.",
            "suggestedTitle": "Gathering",
            "technicalDescription": {
                "duration": "0:30",
                "estimatedShotCount": "1-2 shots",
                "estimatedYear": "1990s",
                "estimatedOrigin": "Amateur home video",
                "formatAesthetic": "Low-resolution VHS"
            },
            "taxonomyClassification": {
                "path": "Machine-made > Archival > Visual > Dynamic",
                "reasoning": "Continuous handheld footage."
            },
            "analysis": "Detailed markdown.",
            "events": [],
            "keyPeople": [
                { "timestamp": 3.5, "timeString": "0:03", "name": "Woman in blue jacket", "description": "Leads the chant." }
            ]
        }"#;
        let result = parse_video_analysis(raw).expect("parse");
        assert_eq!(result.synopsis.as_deref(), Some("A crowd gathers."));
        assert_eq!(
            result.technical_description.as_ref().map(|td| td.format_aesthetic.as_str()),
            Some("Low-resolution VHS")
        );
        assert_eq!(result.key_people[0].name, "Woman in blue jacket");
    }

    #[test]
    fn empty_api_key_is_a_credential_error() {
        assert!(matches!(
            GeminiClient::new("  "),
            Err(EngineError::MissingCredential)
        ));
    }

    #[test]
    fn extract_reply_text_joins_candidate_parts() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "Hello " },
                        { "inlineData": { "mimeType": "image/png", "data": "x" } },
                        { "text": "world" }
                    ]
                }
            }]
        });
        assert_eq!(extract_reply_text(&payload), "Hello world");
        assert_eq!(extract_reply_text(&json!({})), "");
    }

    #[test]
    fn contents_include_transcript_then_pending_message() {
        let result = AnalysisResult::from_narrative("Summary text");
        let session = Session::continue_from(MediaKind::Video, &result, "gemini-2.5-pro");
        let contents = contents_from_transcript(session.transcript(), "Why?");

        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], json!("user"));
        assert_eq!(contents[1]["role"], json!("model"));
        assert!(contents[1]["parts"][0]["text"]
            .as_str()
            .expect("text")
            .contains("Summary text"));
        assert_eq!(contents[2]["role"], json!("user"));
        assert_eq!(contents[2]["parts"][0]["text"], json!("Why?"));
    }

    fn sse_body(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            let chunk = json!({
                "candidates": [{ "content": { "parts": [{ "text": fragment }] } }]
            });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: {\"candidates\":[{\"finishReason\":\"STOP\"}]}\n\n");
        body
    }

    #[test]
    fn sse_fragments_decode_data_lines_in_order() {
        let body = sse_body(&["Be", "cause", " X"]);
        let fragments: Vec<String> = SseFragments::new(Cursor::new(body))
            .collect::<Result<_, _>>()
            .expect("fragments");
        assert_eq!(fragments, vec!["Be", "cause", " X"]);
        assert_eq!(fragments.concat(), "Because X");
    }

    #[test]
    fn sse_fragments_skip_noise_lines() {
        let body = "\n: keepalive\ndata:\nnot-sse\ndata: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]}}]}\n";
        let fragments: Vec<String> = SseFragments::new(Cursor::new(body.to_string()))
            .collect::<Result<_, _>>()
            .expect("fragments");
        assert_eq!(fragments, vec!["ok"]);
    }

    #[test]
    fn streamed_reply_commits_exchange_after_clean_end() {
        let result = AnalysisResult::from_narrative("Summary text");
        let mut session = Session::continue_from(MediaKind::Video, &result, "gemini-2.5-pro");

        let body = sse_body(&["Be", "cause", " X"]);
        let mut reply = StreamedReply::from_parts(
            SseFragments::new(Cursor::new(body)),
            &mut session,
            "Why?".to_string(),
        );
        let mut collected = String::new();
        for fragment in &mut reply {
            collected.push_str(&fragment.expect("fragment"));
        }
        assert_eq!(collected, "Because X");
        assert_eq!(reply.text(), "Because X");
        drop(reply);

        assert_eq!(session.transcript().len(), 4);
        assert_eq!(session.transcript()[2].role, Role::User);
        assert_eq!(session.transcript()[2].text, "Why?");
        assert_eq!(session.transcript()[3].text, "Because X");
    }

    #[test]
    fn streamed_reply_leaves_session_untouched_after_error() {
        struct FailingReader;
        impl std::io::Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("connection reset"))
            }
        }

        let result = AnalysisResult::from_narrative("Summary text");
        let mut session = Session::continue_from(MediaKind::Video, &result, "gemini-2.5-pro");

        let mut reply = StreamedReply::from_parts(
            SseFragments::new(BufReader::new(FailingReader)),
            &mut session,
            "Why?".to_string(),
        );
        let first = reply.next().expect("yields the error");
        assert!(matches!(first, Err(EngineError::ChatTransport { .. })));
        assert!(reply.next().is_none());
        drop(reply);

        // failed turn recorded nothing; the caller may retry the same turn
        assert_eq!(session.transcript().len(), 2);
    }

    #[test]
    fn generate_payload_shapes_instruction_and_config() {
        let payload = build_generate_payload(
            vec![json!({ "role": "user", "parts": [{ "text": "hi" }] })],
            Some("be brief"),
            Some(json!({ "responseMimeType": "application/json" })),
        );
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            json!("be brief")
        );
        assert_eq!(
            payload["generationConfig"]["responseMimeType"],
            json!("application/json")
        );

        let bare = build_generate_payload(Vec::new(), None, None);
        assert!(bare.get("systemInstruction").is_none());
        assert!(bare.get("generationConfig").is_none());
    }

    #[test]
    fn truncate_text_appends_ellipsis_beyond_limit() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdefghij", 4), "abcd…");
    }

    #[test]
    fn guess_image_mime_covers_common_extensions() {
        assert_eq!(guess_image_mime(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(guess_image_mime(Path::new("a.webp")), "image/webp");
        assert_eq!(guess_image_mime(Path::new("a.unknown")), "image/png");
    }
}
