//! Shared fakes for integration tests.
//!
//! Every external boundary of the pipeline has an in-memory stand-in here,
//! plus a [`Harness`] that wires them into an orchestrator rooted in a
//! temporary directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use shortforge::adapters::{
    BackendError, CredentialProvider, Credentials, ImageError, ImageRef, ImageSource,
    PublishError, PublishTarget, RemoteVideo, RenderError, RenderOutput, RenderPlan, Renderer,
    SynthesizedClip, TextBackend, ThumbnailPlan, UploadRequest, VoiceBackend, VoiceError,
};
use shortforge::config::StageSettings;
use shortforge::core::{RetryPolicy, StageLimits};
use shortforge::{Backends, Config, Orchestrator, PromptResolver, ThemeRegistry, TopicSampler};

/// Speaking rate shared by the generator estimate and the fake voice
pub const WPM: f64 = 150.0;

/// Hook, five points and an outro at 15 words each: 105 words, 42s
pub const STANDARD: [usize; 7] = [15, 15, 15, 15, 15, 15, 15];

const VOCABULARY: [&str; 12] = [
    "los", "pulpos", "tienen", "tres", "corazones", "y", "sangre", "azul", "en", "el", "océano",
    "profundo",
];

/// `count` words of plain narration
pub fn filler(count: usize) -> String {
    VOCABULARY
        .iter()
        .cycle()
        .take(count)
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A well-formed script with one segment per entry: hook, points, outro
pub fn script_from(segments: &[String]) -> String {
    let (hook, rest) = segments.split_first().expect("hook");
    let (outro, points) = rest.split_last().expect("outro");

    let mut lines = vec!["[TITLE] Datos que no conocías".to_string(), format!("[HOOK] {}", hook)];
    for (i, point) in points.iter().enumerate() {
        lines.push(format!("[POINT {}] {}", i + 1, point));
    }
    lines.push(format!("[OUTRO] {}", outro));
    lines.push("[HASHTAGS] #Shorts #Curiosidades #Océano".to_string());
    lines.join("\n")
}

/// A well-formed script whose segments have the given word counts
pub fn script(segment_words: &[usize]) -> String {
    let segments: Vec<String> = segment_words.iter().map(|&n| filler(n)).collect();
    script_from(&segments)
}

/// Standard script with `word` leading the third point
pub fn script_mentioning(word: &str) -> String {
    let mut segments: Vec<String> = STANDARD.iter().map(|&n| filler(n)).collect();
    segments[3] = format!("{} {}", word, filler(14));
    script_from(&segments)
}

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

/// Answers from a queue, then repeats the default answer
pub struct ScriptedText {
    responses: Mutex<VecDeque<Result<String, BackendError>>>,
    default: String,
    delay: Duration,
    cancel_on_call: Option<CancellationToken>,
    pub calls: AtomicU32,
    pub prompts: Mutex<Vec<String>>,
    in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
}

impl ScriptedText {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default: default.into(),
            delay: Duration::ZERO,
            cancel_on_call: None,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        }
    }

    pub fn with_responses(self, responses: Vec<Result<String, BackendError>>) -> Self {
        *self.responses.lock().unwrap() = responses.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cancel `token` while the call is in flight
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_call = Some(token);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextBackend for ScriptedText {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str, _max_tokens: u32) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_call {
            token.cancel();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.default.clone()))
    }
}

// ---------------------------------------------------------------------------
// Voice
// ---------------------------------------------------------------------------

/// Audio bytes are the text itself; duration follows [`WPM`]
pub struct FakeVoice {
    flaky: Mutex<HashMap<String, u32>>,
    broken: Vec<String>,
    staggered: bool,
    pub calls: AtomicU32,
    pub completed: Mutex<Vec<String>>,
}

impl FakeVoice {
    pub fn new() -> Self {
        Self {
            flaky: Mutex::new(HashMap::new()),
            broken: Vec::new(),
            staggered: false,
            calls: AtomicU32::new(0),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Segments containing `marker` fail transiently `times` times first
    pub fn flaky(self, marker: &str, times: u32) -> Self {
        self.flaky.lock().unwrap().insert(marker.to_string(), times);
        self
    }

    /// Segments containing `marker` are always rejected
    pub fn broken(mut self, marker: &str) -> Self {
        self.broken.push(marker.to_string());
        self
    }

    /// Earlier calls take longer, so completion order is reversed
    pub fn staggered(mut self) -> Self {
        self.staggered = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceBackend for FakeVoice {
    fn name(&self) -> &str {
        "fake-voice"
    }

    async fn synthesize(&self, text: &str, _voice: &str) -> Result<SynthesizedClip, VoiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if self.staggered {
            let delay = 60u64.saturating_sub(u64::from(call) * 10);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.broken.iter().any(|marker| text.contains(marker.as_str())) {
            return Err(VoiceError::Rejected(format!("cannot speak '{}'", text)));
        }

        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky
                .iter_mut()
                .find(|(marker, _)| text.contains(marker.as_str()))
                .map(|(_, remaining)| remaining)
            {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(VoiceError::Unavailable("service busy".to_string()));
                }
            }
        }

        self.completed.lock().unwrap().push(text.to_string());
        let words = text.split_whitespace().count() as f64;
        Ok(SynthesizedClip {
            audio: text.as_bytes().to_vec(),
            duration: Duration::from_secs_f64(words / WPM * 60.0),
        })
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

pub struct FakeImages {
    misses: Vec<String>,
    unavailable: bool,
    pub searches: Mutex<Vec<String>>,
}

impl FakeImages {
    pub fn new() -> Self {
        Self {
            misses: Vec::new(),
            unavailable: false,
            searches: Mutex::new(Vec::new()),
        }
    }

    /// Queries containing any of `words` return no results
    pub fn missing(words: &[&str]) -> Self {
        Self {
            misses: words.iter().map(|w| w.to_string()).collect(),
            ..Self::new()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl ImageSource for FakeImages {
    fn name(&self) -> &str {
        "fake-images"
    }

    async fn search(&self, query: &str, _count: usize) -> Result<Vec<ImageRef>, ImageError> {
        self.searches.lock().unwrap().push(query.to_string());

        if self.unavailable {
            return Err(ImageError::Unavailable("503".to_string()));
        }
        if self.misses.iter().any(|miss| query.contains(miss.as_str())) {
            return Ok(Vec::new());
        }

        Ok(vec![
            ImageRef {
                id: format!("{}-small", query),
                url: "https://images.test/small.jpg".to_string(),
                width: 640,
                height: 1136,
            },
            ImageRef {
                id: format!("{}-large", query),
                url: "https://images.test/large.jpg".to_string(),
                width: 1080,
                height: 1920,
            },
        ])
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, ImageError> {
        Ok(image.id.as_bytes().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Writes placeholder files and reports exactly what was planned
pub struct FakeRenderer {
    pub renders: AtomicU32,
    pub clips: Mutex<Vec<Duration>>,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self {
            renders: AtomicU32::new(0),
            clips: Mutex::new(Vec::new()),
        }
    }
}

impl Renderer for FakeRenderer {
    fn render(&self, plan: &RenderPlan, _cancel: &CancellationToken) -> Result<RenderOutput, RenderError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        *self.clips.lock().unwrap() = plan.clips.iter().map(|c| c.duration).collect();
        std::fs::write(&plan.output, b"mp4")?;
        Ok(RenderOutput {
            duration: plan.total_duration(),
            resolution: plan.resolution,
        })
    }

    fn render_thumbnail(&self, plan: &ThumbnailPlan, _cancel: &CancellationToken) -> Result<(), RenderError> {
        std::fs::write(&plan.output, b"jpg")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Remembers uploads by idempotency key, like a platform-side search
pub struct FakeTarget {
    videos: Mutex<HashMap<String, RemoteVideo>>,
    expired: HashSet<String>,
    network_failures: AtomicU32,
    reject: bool,
    pub uploads: AtomicU32,
    pub thumbnails: AtomicU32,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self {
            videos: Mutex::new(HashMap::new()),
            expired: HashSet::new(),
            network_failures: AtomicU32::new(0),
            reject: false,
            uploads: AtomicU32::new(0),
            thumbnails: AtomicU32::new(0),
        }
    }

    /// Tokens the target treats as expired
    pub fn expiring(mut self, tokens: &[&str]) -> Self {
        self.expired = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    /// The next `times` uploads fail with a network error
    pub fn flaky(self, times: u32) -> Self {
        self.network_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn uploads(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn forget(&self, idempotency_key: &str) {
        self.videos.lock().unwrap().remove(idempotency_key);
    }

    fn check(&self, credentials: &Credentials) -> Result<(), PublishError> {
        if self.expired.contains(&credentials.access_token) {
            return Err(PublishError::AuthExpired("token expired".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PublishTarget for FakeTarget {
    fn name(&self) -> &str {
        "fake-target"
    }

    async fn find_existing(
        &self,
        idempotency_key: &str,
        credentials: &Credentials,
    ) -> Result<Option<RemoteVideo>, PublishError> {
        self.check(credentials)?;
        Ok(self.videos.lock().unwrap().get(idempotency_key).cloned())
    }

    async fn upload(
        &self,
        request: &UploadRequest,
        credentials: &Credentials,
    ) -> Result<RemoteVideo, PublishError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        self.check(credentials)?;

        let pending = self.network_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.network_failures.store(pending - 1, Ordering::SeqCst);
            return Err(PublishError::Network("connection reset".to_string()));
        }
        if self.reject {
            return Err(PublishError::Rejected("duplicate content".to_string()));
        }

        let video = RemoteVideo {
            remote_id: format!("vid{:03}", n),
            url: format!("https://youtube.com/shorts/vid{:03}", n),
        };
        self.videos
            .lock()
            .unwrap()
            .insert(request.idempotency_key.clone(), video.clone());
        Ok(video)
    }

    async fn upload_thumbnail(
        &self,
        _remote_id: &str,
        _thumbnail: &Path,
        _credentials: &Credentials,
    ) -> Result<(), PublishError> {
        self.thumbnails.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out `token-N`, bumping N on every refresh
pub struct FakeCredentials {
    generation: AtomicU32,
    pub refreshes: AtomicU32,
}

impl FakeCredentials {
    pub fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
        }
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn current(&self) -> Result<Credentials, PublishError> {
        Ok(Credentials {
            access_token: format!("token-{}", self.generation.load(Ordering::SeqCst)),
        })
    }

    async fn refresh(&self) -> Result<Credentials, PublishError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credentials {
            access_token: format!("token-{}", generation),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Fast settings: no backoff delays, short stage timeouts
pub fn test_config(home: &Path) -> Config {
    let mut config = Config::with_home(home);
    config.generation.words_per_minute = WPM;
    config.generation.backend_retry = RetryPolicy::immediate(3);
    config.voice.segment_retry = RetryPolicy::immediate(3);
    config.visual.image_retry = RetryPolicy::immediate(2);
    config.visual.fallback_query = "naturaleza paisaje".to_string();
    config.publish.upload_retry = RetryPolicy::immediate(3);
    config.stages = StageSettings::uniform(StageLimits::new(
        Duration::from_secs(5),
        RetryPolicy::immediate(2),
    ));
    config.batch.max_concurrent_jobs = 2;
    config
}

pub struct Harness {
    pub home: TempDir,
    pub config: Config,
    pub text: Arc<ScriptedText>,
    pub voice: Arc<FakeVoice>,
    pub images: Arc<FakeImages>,
    pub renderer: Arc<FakeRenderer>,
    pub target: Arc<FakeTarget>,
    pub credentials: Arc<FakeCredentials>,
}

impl Harness {
    pub fn new() -> Self {
        let home = TempDir::new().unwrap();
        let config = test_config(home.path());

        Self {
            home,
            config,
            text: Arc::new(ScriptedText::new(script(&STANDARD))),
            voice: Arc::new(FakeVoice::new()),
            images: Arc::new(FakeImages::new()),
            renderer: Arc::new(FakeRenderer::new()),
            target: Arc::new(FakeTarget::new()),
            credentials: Arc::new(FakeCredentials::new()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            text: self.text.clone(),
            voice: self.voice.clone(),
            images: self.images.clone(),
            renderer: self.renderer.clone(),
            publish: self.target.clone(),
            credentials: self.credentials.clone(),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            &self.config,
            ThemeRegistry::builtin().unwrap(),
            PromptResolver::builtin(&self.config.prompts),
            self.backends(),
        )
        .with_sampler(TopicSampler::seeded(7))
    }
}
