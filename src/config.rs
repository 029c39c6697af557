//! Configuration for shortforge.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHORTFORGE_HOME, SHORTFORGE_OUTPUT, API keys)
//! 2. Config file (.shortforge/config.yaml)
//! 3. Defaults (~/.shortforge)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shortforge/config.yaml
//! - Paths in config file are relative to the project root (the parent of .shortforge/)
//!
//! The binary resolves a [`Config`] once at startup and hands `&Config` to
//! every component constructor. Library code never reads the environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::policy::{RetryPolicy, StageLimits};
use crate::domain::{Resolution, Stage, Visibility};

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub voice: VoiceSettings,
    #[serde(default)]
    pub visual: VisualSettings,
    #[serde(default)]
    pub publish: PublishSettings,
    #[serde(default)]
    pub stages: StageSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub prompts: PromptSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (job logs, publish ledger)
    pub home: Option<String>,
    /// Where finished videos are copied
    pub output: Option<String>,
    /// Directory of user theme override files (*.yaml)
    pub themes: Option<String>,
    /// Directory of prompt template files ({theme}_{language}.txt)
    pub prompts: Option<String>,
}

/// Text generation backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local inference through an Ollama server
    Ollama {
        #[serde(default = "default_ollama_url")]
        base_url: String,
        #[serde(default = "default_ollama_model")]
        model: String,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_top_p")]
        top_p: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
    /// OpenAI-compatible chat completions API
    Remote {
        #[serde(default = "default_remote_url")]
        base_url: String,
        #[serde(default = "default_remote_model")]
        model: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_remote_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_remote_model() -> String {
    "gpt-4".to_string()
}
fn default_temperature() -> f32 {
    0.8
}
fn default_top_p() -> f32 {
    0.9
}
fn default_max_tokens() -> u32 {
    1000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Ollama {
            base_url: default_ollama_url(),
            model: default_ollama_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ollama { .. } => "ollama",
            Self::Remote { .. } => "remote",
        }
    }

    pub fn max_tokens(&self) -> u32 {
        match self {
            Self::Ollama { max_tokens, .. } | Self::Remote { max_tokens, .. } => *max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default)]
    pub backend: BackendConfig,

    /// Speaking rate used to estimate narration time
    #[serde(default = "default_words_per_minute")]
    pub words_per_minute: f64,

    /// Extra backend calls allowed when the output cannot be parsed
    #[serde(default = "default_max_regenerations")]
    pub max_regenerations: u32,

    /// Minimum numbered points a script must contain
    #[serde(default = "default_min_points")]
    pub min_points: usize,

    /// Backoff for backend failures (timeouts, rate limits, connectivity)
    #[serde(default)]
    pub backend_retry: RetryPolicy,

    /// Per-request timeout for backend calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_words_per_minute() -> f64 {
    150.0
}
fn default_max_regenerations() -> u32 {
    2
}
fn default_min_points() -> usize {
    3
}
fn default_request_timeout() -> u64 {
    120
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            words_per_minute: default_words_per_minute(),
            max_regenerations: default_max_regenerations(),
            min_points: default_min_points(),
            backend_retry: RetryPolicy::default(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Prefer the female voice of the language profile
    #[serde(default)]
    pub female: bool,

    /// Explicit voice per language code, overriding the profile
    #[serde(default)]
    pub voices: HashMap<String, String>,

    /// Attempts per segment before the stage fails
    #[serde(default)]
    pub segment_retry: RetryPolicy,

    /// Segments synthesized concurrently
    #[serde(default = "default_parallel_segments")]
    pub max_parallel_segments: usize,

    #[serde(default = "default_edge_tts")]
    pub edge_tts_binary: String,

    #[serde(default = "default_ffprobe")]
    pub ffprobe_binary: String,
}

fn default_parallel_segments() -> usize {
    4
}
fn default_edge_tts() -> String {
    "edge-tts".to_string()
}
fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            female: false,
            voices: HashMap::new(),
            segment_retry: RetryPolicy::default(),
            max_parallel_segments: default_parallel_segments(),
            edge_tts_binary: default_edge_tts(),
            ffprobe_binary: default_ffprobe(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualSettings {
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Stock query used when a segment's own query finds nothing
    #[serde(default = "default_fallback_query")]
    pub fallback_query: String,

    /// Allowed |video - audio| duration difference in seconds
    #[serde(default = "default_tolerance")]
    pub duration_tolerance_secs: f64,

    /// Retries for image searches and downloads
    #[serde(default)]
    pub image_retry: RetryPolicy,

    #[serde(default)]
    pub pexels_api_key: Option<String>,

    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_binary: String,

    /// Font for captions and branding (ffmpeg default font when unset)
    #[serde(default)]
    pub font_file: Option<String>,

    /// Words per on-screen caption
    #[serde(default = "default_caption_words")]
    pub caption_words: usize,
}

fn default_resolution() -> Resolution {
    Resolution::PORTRAIT_1080
}
fn default_fps() -> u32 {
    30
}
fn default_fallback_query() -> String {
    "abstract colorful background".to_string()
}
fn default_tolerance() -> f64 {
    0.5
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_caption_words() -> usize {
    3
}

impl Default for VisualSettings {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            fps: default_fps(),
            fallback_query: default_fallback_query(),
            duration_tolerance_secs: default_tolerance(),
            image_retry: RetryPolicy::default(),
            pexels_api_key: None,
            ffmpeg_binary: default_ffmpeg(),
            font_file: None,
            caption_words: default_caption_words(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    #[serde(default)]
    pub visibility: Visibility,

    #[serde(default = "default_category")]
    pub category_id: String,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Retries for network failures during upload
    #[serde(default)]
    pub upload_retry: RetryPolicy,
}

fn default_category() -> String {
    "24".to_string()
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            visibility: Visibility::Private,
            category_id: default_category(),
            client_id: None,
            client_secret: None,
            refresh_token: None,
            upload_retry: RetryPolicy::default(),
        }
    }
}

/// Per-stage timeout and retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    #[serde(default)]
    pub resolving: StageLimits,
    #[serde(default)]
    pub generating: StageLimits,
    #[serde(default)]
    pub synthesizing: StageLimits,
    #[serde(default = "default_composing_limits")]
    pub composing: StageLimits,
    #[serde(default = "default_publishing_limits")]
    pub publishing: StageLimits,
}

fn default_composing_limits() -> StageLimits {
    StageLimits {
        timeout_seconds: 900,
        ..Default::default()
    }
}

fn default_publishing_limits() -> StageLimits {
    StageLimits {
        timeout_seconds: 1800,
        ..Default::default()
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            resolving: StageLimits::default(),
            generating: StageLimits::default(),
            synthesizing: StageLimits::default(),
            composing: default_composing_limits(),
            publishing: default_publishing_limits(),
        }
    }
}

impl StageSettings {
    pub fn for_stage(&self, stage: Stage) -> &StageLimits {
        match stage {
            Stage::Resolving => &self.resolving,
            Stage::Generating => &self.generating,
            Stage::Synthesizing => &self.synthesizing,
            Stage::Composing => &self.composing,
            Stage::Publishing => &self.publishing,
        }
    }

    /// Same limits for every stage (mostly for tests)
    pub fn uniform(limits: StageLimits) -> Self {
        Self {
            resolving: limits.clone(),
            generating: limits.clone(),
            synthesizing: limits.clone(),
            composing: limits.clone(),
            publishing: limits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

fn default_max_concurrent_jobs() -> usize {
    2
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

/// Fallback chain for prompt template lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSettings {
    #[serde(default = "default_fallback_language")]
    pub fallback_language: Option<String>,
    #[serde(default = "default_fallback_content_type")]
    pub fallback_content_type: Option<String>,
}

fn default_fallback_language() -> Option<String> {
    Some("es".to_string())
}
fn default_fallback_content_type() -> Option<String> {
    Some("DEFAULT".to_string())
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            fallback_language: default_fallback_language(),
            fallback_content_type: default_fallback_content_type(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine state (job logs, publish ledger)
    pub home: PathBuf,
    /// Finished videos
    pub output_dir: PathBuf,
    /// User theme overrides
    pub themes_dir: Option<PathBuf>,
    /// User prompt templates
    pub prompts_dir: Option<PathBuf>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub generation: GenerationSettings,
    pub voice: VoiceSettings,
    pub visual: VisualSettings,
    pub publish: PublishSettings,
    pub stages: StageSettings,
    pub batch: BatchSettings,
    pub prompts: PromptSettings,
}

impl Config {
    /// Configuration rooted at `home` with every other setting at its default
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            output_dir: home.join("output"),
            home,
            themes_dir: None,
            prompts_dir: None,
            config_file: None,
            generation: GenerationSettings::default(),
            voice: VoiceSettings::default(),
            visual: VisualSettings::default(),
            publish: PublishSettings::default(),
            stages: StageSettings::default(),
            batch: BatchSettings::default(),
            prompts: PromptSettings::default(),
        }
    }

    /// Per-job working directories live here
    pub fn jobs_dir(&self) -> PathBuf {
        self.home.join("jobs")
    }

    /// Append-only record of completed uploads
    pub fn publish_ledger_path(&self) -> PathBuf {
        self.home.join("publish_ledger.jsonl")
    }

    /// Load configuration from all sources (file, environment, defaults)
    pub fn load() -> Result<Self> {
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".shortforge");

        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let config_file = find_config_file(&cwd);

        let file = match config_file {
            Some(ref path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        Ok(resolve(file, config_file, default_home, &EnvOverrides::from_env()))
    }
}

/// Values taken from the process environment at startup
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<String>,
    pub output: Option<String>,
    pub remote_api_key: Option<String>,
    pub pexels_api_key: Option<String>,
    pub youtube_client_id: Option<String>,
    pub youtube_client_secret: Option<String>,
    pub youtube_refresh_token: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            home: var("SHORTFORGE_HOME"),
            output: var("SHORTFORGE_OUTPUT"),
            remote_api_key: var("OPENAI_API_KEY"),
            pexels_api_key: var("PEXELS_API_KEY"),
            youtube_client_id: var("YOUTUBE_CLIENT_ID"),
            youtube_client_secret: var("YOUTUBE_CLIENT_SECRET"),
            youtube_refresh_token: var("YOUTUBE_REFRESH_TOKEN"),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".shortforge").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file values, environment and defaults into a [`Config`]
fn resolve(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    env: &EnvOverrides,
) -> Config {
    // Project root is the parent of .shortforge/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let home = match (&env.home, &file.paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(path)) => resolve_path(&base_dir, path),
        (None, None) => default_home,
    };

    let output_dir = match (&env.output, &file.paths.output) {
        (Some(env_out), _) => PathBuf::from(env_out),
        (None, Some(path)) => resolve_path(&base_dir, path),
        (None, None) => home.join("output"),
    };

    let themes_dir = file
        .paths
        .themes
        .as_deref()
        .map(|p| resolve_path(&base_dir, p))
        .or_else(|| Some(home.join("themes")));

    let prompts_dir = file
        .paths
        .prompts
        .as_deref()
        .map(|p| resolve_path(&base_dir, p))
        .or_else(|| Some(home.join("prompts")));

    let mut generation = file.generation;
    if let BackendConfig::Remote { ref mut api_key, .. } = generation.backend {
        if api_key.is_none() {
            *api_key = env.remote_api_key.clone();
        }
    }

    let mut visual = file.visual;
    if visual.pexels_api_key.is_none() {
        visual.pexels_api_key = env.pexels_api_key.clone();
    }
    // Portrait output is not configurable away
    if !visual.resolution.is_portrait() {
        visual.resolution = Resolution::PORTRAIT_1080;
    }

    let mut publish = file.publish;
    publish.client_id = publish.client_id.or_else(|| env.youtube_client_id.clone());
    publish.client_secret = publish
        .client_secret
        .or_else(|| env.youtube_client_secret.clone());
    publish.refresh_token = publish
        .refresh_token
        .or_else(|| env.youtube_refresh_token.clone());

    Config {
        home,
        output_dir,
        themes_dir,
        prompts_dir,
        config_file,
        generation,
        voice: file.voice,
        visual,
        publish,
        stages: file.stages,
        batch: file.batch,
        prompts: file.prompts,
    }
}
