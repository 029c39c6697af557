//! Main orchestrator for job execution.
//!
//! Owns the job state machine and is the only component with cross-stage
//! knowledge. For each job it runs resolving, generating, synthesizing,
//! composing and (optionally) publishing in order, wrapping every stage in
//! its own timeout and retry budget and logging each step to the job's
//! event log. Failures are finalized here: a publish failure after a
//! composed video yields `partial`, anything else yields `failed`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    build_backend, CredentialProvider, EdgeTtsVoice, FfmpegRenderer, ImageSource, OAuthCredentials,
    PexelsSource, PublishTarget, Renderer, TextBackend, VoiceBackend, YouTubePublisher,
};
use crate::config::{BatchSettings, Config, PublishSettings, StageSettings};
use crate::domain::{
    ArtifactLocation, AudioArtifact, Event, EventType, FailureReport, Job, JobRecord, JobRequest,
    JobResult, JobStatus, PublishResult, ScriptArtifact, Stage, VideoArtifact,
};
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::prompts::{PromptResolver, PromptVariables};
use crate::stages::publish::map_publish_error;
use crate::stages::{
    build_metadata, ComposeRequest, PublishLedger, Publisher, ScriptGenerator, ScriptRequest,
    VisualComposer, VoiceSynthesizer,
};
use crate::themes::{LanguageProfile, LocaleConfig, ThemeRegistry, TopicSampler};

use super::event_store::{generate_idempotency_key, JobStore};

/// External collaborators of the pipeline
pub struct Backends {
    pub text: Arc<dyn TextBackend>,
    pub voice: Arc<dyn VoiceBackend>,
    pub images: Arc<dyn ImageSource>,
    pub renderer: Arc<dyn Renderer>,
    pub publish: Arc<dyn PublishTarget>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Backends {
    /// Production implementations selected by configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            text: build_backend(
                &config.generation.backend,
                std::time::Duration::from_secs(config.generation.request_timeout_seconds),
            ),
            voice: Arc::new(EdgeTtsVoice::new(
                config.voice.edge_tts_binary.clone(),
                config.voice.ffprobe_binary.clone(),
            )),
            images: Arc::new(PexelsSource::new(config.visual.pexels_api_key.clone())),
            renderer: Arc::new(FfmpegRenderer::new(
                config.visual.ffmpeg_binary.clone(),
                config.voice.ffprobe_binary.clone(),
            )),
            publish: Arc::new(YouTubePublisher::new()),
            credentials: Arc::new(OAuthCredentials::new(
                config.publish.client_id.clone(),
                config.publish.client_secret.clone(),
                config.publish.refresh_token.clone(),
            )),
        }
    }
}

/// Output of the resolving stage
#[derive(Debug, Clone)]
struct Resolved {
    locale: LocaleConfig,
    profile: LanguageProfile,
    content_type: String,
    topic: String,
    prompt: String,
}

/// Mutable state of one job while it runs
struct JobRun {
    job: Job,
    store: JobStore,
    started_at: DateTime<Utc>,
    script: Option<ScriptArtifact>,
    audio: Option<AudioArtifact>,
    video: Option<VideoArtifact>,
    publish: Option<PublishResult>,
    last_artifact: Option<ArtifactLocation>,
    refresh_attempts: Arc<AtomicU32>,
}

/// A stage failure together with the attempts it consumed
struct StageFailure {
    stage: Stage,
    error: PipelineError,
    attempts: u32,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    jobs_dir: PathBuf,
    output_dir: PathBuf,
    registry: Arc<ThemeRegistry>,
    prompts: Arc<PromptResolver>,
    sampler: TopicSampler,
    script: ScriptGenerator,
    voice: VoiceSynthesizer,
    visual: VisualComposer,
    publisher: Publisher,
    credentials: Arc<dyn CredentialProvider>,
    stages: StageSettings,
    batch: BatchSettings,
    publish_settings: PublishSettings,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        registry: ThemeRegistry,
        prompts: PromptResolver,
        backends: Backends,
    ) -> Self {
        Self {
            jobs_dir: config.jobs_dir(),
            output_dir: config.output_dir.clone(),
            registry: Arc::new(registry),
            prompts: Arc::new(prompts),
            sampler: TopicSampler::new(),
            script: ScriptGenerator::new(backends.text, config.generation.clone()),
            voice: VoiceSynthesizer::new(backends.voice, config.voice.clone()),
            visual: VisualComposer::new(backends.images, backends.renderer, config.visual.clone()),
            publisher: Publisher::new(
                backends.publish,
                PublishLedger::new(config.publish_ledger_path()),
                config.publish.clone(),
            ),
            credentials: backends.credentials,
            stages: config.stages.clone(),
            batch: config.batch.clone(),
            publish_settings: config.publish.clone(),
        }
    }

    /// Replace the topic sampler (seeded samplers make runs reproducible)
    pub fn with_sampler(mut self, sampler: TopicSampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn registry(&self) -> &ThemeRegistry {
        &self.registry
    }

    /// Run one job to a terminal state.
    ///
    /// Stage failures are reported inside the [`JobResult`]; only failures
    /// of the job's own bookkeeping come back as `Err`.
    #[instrument(skip_all, fields(theme = %request.theme, language = %request.language, job_id = tracing::field::Empty))]
    pub async fn run_job(
        &self,
        request: JobRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<JobResult> {
        let job = Job::new(
            request.theme.clone(),
            request.language.clone(),
            request.content_type.clone().unwrap_or_default(),
            request.topic.clone().unwrap_or_default(),
            request.publish,
        );
        tracing::Span::current().record("job_id", tracing::field::display(job.id));
        info!("Starting job");

        let store = JobStore::open(&self.jobs_dir, job.id).await?;
        let mut run = JobRun {
            job,
            store,
            started_at: Utc::now(),
            script: None,
            audio: None,
            video: None,
            publish: None,
            last_artifact: None,
            refresh_attempts: Arc::new(AtomicU32::new(0)),
        };

        let start_event = Event::new(
            run.job.id,
            None,
            EventType::JobStarted,
            format!("{}:start", run.job.id),
            format!("{}/{} publish={}", request.theme, request.language, request.publish),
        );
        run.store.append(&start_event).await?;

        match self.execute(&mut run, &request, cancel).await {
            Ok(()) => self.complete(run).await,
            Err(failure) => self.fail(run, failure).await,
        }
    }

    async fn execute(
        &self,
        run: &mut JobRun,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<(), StageFailure> {
        // Resolving
        let resolved = self
            .run_stage(run, Stage::Resolving, cancel, &format!("{:?}", request), |_| async {
                self.resolve(request)
            })
            .await?;
        run.job.topic = resolved.topic.clone();
        run.job.content_type = resolved.content_type.clone();

        // Generating
        let script_request = ScriptRequest {
            prompt: resolved.prompt.clone(),
            topic: resolved.topic.clone(),
            bounds: resolved.locale.duration_bounds,
            default_hashtags: resolved.profile.hashtags.clone(),
        };
        let script = self
            .run_stage(run, Stage::Generating, cancel, &resolved.prompt, |_| {
                self.script.generate(&script_request)
            })
            .await?;
        let script_path = run
            .store
            .store_json("script", &script)
            .await
            .map_err(|e| internal(Stage::Generating, e))?;
        run.last_artifact = Some(ArtifactLocation::Script { path: script_path });
        let script = run.script.insert(script).clone();

        // Synthesizing
        let voice = self.voice.select_voice(&request.language, &resolved.profile);
        let artifacts_dir = run.store.artifacts_dir().to_path_buf();
        let audio = self
            .run_stage(run, Stage::Synthesizing, cancel, &script.narration(), |_| {
                self.voice.synthesize(&script, &voice, &artifacts_dir)
            })
            .await?;
        run.store
            .store_json("audio", &audio)
            .await
            .map_err(|e| internal(Stage::Synthesizing, e))?;
        run.last_artifact = Some(ArtifactLocation::Audio {
            path: audio.path.clone(),
        });
        let audio = run.audio.insert(audio).clone();

        // Composing
        let video = self
            .run_stage(
                run,
                Stage::Composing,
                cancel,
                &audio.path.to_string_lossy(),
                |_| {
                    self.visual.compose(ComposeRequest {
                        script: &script,
                        audio: &audio,
                        branding: &resolved.locale.channel_name,
                        output_dir: &artifacts_dir,
                    })
                },
            )
            .await?;
        run.store
            .store_json("video", &video)
            .await
            .map_err(|e| internal(Stage::Composing, e))?;
        run.last_artifact = Some(ArtifactLocation::Video {
            path: video.path.clone(),
            thumbnail: video.thumbnail.clone(),
        });
        self.export_video(run.job.id, &video).await;
        let video = run.video.insert(video).clone();

        if !run.job.publish {
            return Ok(());
        }

        // Publishing
        let metadata = build_metadata(&script, &resolved.locale, &resolved.topic, &self.publish_settings);
        let job_id = run.job.id;
        let store = run.store.clone();
        let refreshes = Arc::clone(&run.refresh_attempts);
        let published = self
            .run_stage(
                run,
                Stage::Publishing,
                cancel,
                &video.path.to_string_lossy(),
                |_| self.publish_with_refresh(job_id, &store, &video, &metadata, &refreshes),
            )
            .await?;
        run.store
            .store_json("publish", &published)
            .await
            .map_err(|e| internal(Stage::Publishing, e))?;
        run.last_artifact = Some(ArtifactLocation::Published {
            remote_id: published.remote_id.clone(),
            url: published.url.clone(),
        });
        run.publish = Some(published);

        Ok(())
    }

    fn resolve(&self, request: &JobRequest) -> PipelineResult<Resolved> {
        let locale = self.registry.resolve(&request.theme, &request.language)?.clone();

        let profile = self
            .registry
            .language(&request.language)
            .or_else(|| self.registry.language(&locale.language))
            .cloned()
            .ok_or_else(|| PipelineError::LocaleNotFound {
                theme: request.theme.clone(),
                language: request.language.clone(),
            })?;

        let content_type = locale.content_type_or_default(request.content_type.as_deref())?;

        let topic = match request.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => topic.to_string(),
            _ => self.sampler.next(&locale).ok_or_else(|| PipelineError::InvalidTheme {
                theme: request.theme.clone(),
                reason: "topic pool is empty".to_string(),
            })?,
        };

        let variables = PromptVariables::for_job(&locale, &profile, &topic, &content_type);
        let prompt = self
            .prompts
            .resolve(&request.theme, &request.language, &content_type, &variables)?;

        info!(topic = %topic, content_type = %content_type, "Job resolved");
        Ok(Resolved {
            locale,
            profile,
            content_type,
            topic,
            prompt,
        })
    }

    /// Publish, refreshing credentials at most once per job on expiry
    async fn publish_with_refresh(
        &self,
        job_id: Uuid,
        store: &JobStore,
        video: &VideoArtifact,
        metadata: &crate::domain::VideoMetadata,
        refreshes: &AtomicU32,
    ) -> PipelineResult<PublishResult> {
        let credentials = self.credentials.current().await.map_err(map_publish_error)?;

        match self.publisher.publish(job_id, video, metadata, &credentials).await {
            Err(PipelineError::AuthExpired(reason)) if refreshes.load(Ordering::SeqCst) == 0 => {
                refreshes.fetch_add(1, Ordering::SeqCst);
                warn!(reason = %reason, "Publish credentials expired, refreshing once");

                let fresh = self.credentials.refresh().await.map_err(map_publish_error)?;
                let event = Event::new(
                    job_id,
                    Some(Stage::Publishing),
                    EventType::CredentialsRefreshed,
                    format!("{}:publishing:refresh", job_id),
                    "Publish credentials refreshed".to_string(),
                );
                store.append(&event).await?;

                self.publisher.publish(job_id, video, metadata, &fresh).await
            }
            other => other,
        }
    }

    /// Run one stage: transition, timeout, bounded retries, events
    async fn run_stage<T, F, Fut>(
        &self,
        run: &mut JobRun,
        stage: Stage,
        cancel: &CancellationToken,
        input: &str,
        mut op: F,
    ) -> Result<T, StageFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        if cancel.is_cancelled() {
            return Err(cancelled(stage, 0));
        }

        run.job
            .transition(stage.status())
            .map_err(|e| internal(stage, e))?;

        let limits = self.stages.for_stage(stage);
        let key = generate_idempotency_key(run.job.id, stage.as_str(), input);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();

            let start_event = Event::new(
                run.job.id,
                Some(stage),
                EventType::StageStarted,
                key.clone(),
                format!("Stage '{}' attempt {}", stage, attempt),
            )
            .with_attempt(attempt);
            run.store
                .append(&start_event)
                .await
                .map_err(|e| internal(stage, e))?;

            let result = match tokio::time::timeout(limits.timeout(), op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::StageTimeout {
                    stage: stage.to_string(),
                    elapsed: limits.timeout(),
                }),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            // The stage was allowed to finish; its result is discarded
            if cancel.is_cancelled() {
                let err = PipelineError::Cancelled {
                    stage: stage.to_string(),
                };
                self.stage_failed(run, stage, &key, attempt, duration_ms, &err).await;
                return Err(StageFailure {
                    stage,
                    error: err,
                    attempts: attempt,
                });
            }

            match result {
                Ok(value) => {
                    let event = Event::new(
                        run.job.id,
                        Some(stage),
                        EventType::StageCompleted,
                        key,
                        format!("Stage '{}' completed in {}ms", stage, duration_ms),
                    )
                    .with_attempt(attempt)
                    .with_duration(duration_ms);
                    run.store.append(&event).await.map_err(|e| internal(stage, e))?;

                    info!(stage = %stage, attempt, duration_ms, "Stage completed");
                    return Ok(value);
                }
                Err(e) if e.class().is_retryable() && limits.retry.should_retry(attempt) => {
                    let delay = limits.retry.delay_for_attempt(attempt);

                    let event = Event::new(
                        run.job.id,
                        Some(stage),
                        EventType::StageRetrying,
                        format!("{}:retry:{}", key, attempt),
                        format!("Stage '{}' failed, retrying in {:?}", stage, delay),
                    )
                    .with_attempt(attempt)
                    .with_error(format!("{}: {}", e.code(), e));
                    run.store.append(&event).await.map_err(|e| internal(stage, e))?;

                    warn!(
                        stage = %stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage failed, retrying"
                    );

                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.stage_failed(run, stage, &key, attempt, duration_ms, &e).await;
                    error!(stage = %stage, attempt, error = %e, "Stage failed permanently");
                    return Err(StageFailure {
                        stage,
                        error: e,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    async fn stage_failed(
        &self,
        run: &JobRun,
        stage: Stage,
        key: &str,
        attempt: u32,
        duration_ms: u64,
        error: &PipelineError,
    ) {
        let event = Event::new(
            run.job.id,
            Some(stage),
            EventType::StageFailed,
            key.to_string(),
            format!("Stage '{}' failed after {} attempts", stage, attempt),
        )
        .with_attempt(attempt)
        .with_duration(duration_ms)
        .with_error(format!("{}: {}", error.code(), error));

        if let Err(e) = run.store.append(&event).await {
            warn!(error = %e, "Failed to record stage failure");
        }
    }

    /// Copy the finished video into the output directory
    async fn export_video(&self, job_id: Uuid, video: &VideoArtifact) {
        let target = self.output_dir.join(format!("{}.mp4", job_id));
        let result = async {
            tokio::fs::create_dir_all(&self.output_dir).await?;
            tokio::fs::copy(&video.path, &target).await
        }
        .await;

        if let Err(e) = result {
            warn!(target = %target.display(), error = %e, "Failed to export video");
        }
    }

    async fn complete(&self, mut run: JobRun) -> PipelineResult<JobResult> {
        run.job.transition(JobStatus::Done)?;

        let event = Event::new(
            run.job.id,
            None,
            EventType::JobCompleted,
            format!("{}:complete", run.job.id),
            format!("Job completed ({})", run.job.topic),
        );
        run.store.append(&event).await?;

        info!(job_id = %run.job.id, "Job completed successfully");
        Ok(self.result(run, None))
    }

    async fn fail(&self, mut run: JobRun, failure: StageFailure) -> PipelineResult<JobResult> {
        let StageFailure {
            stage,
            error,
            attempts,
        } = failure;

        // Only a failed upload of an existing video is partial
        let (status, event_type) = if error.class() == ErrorClass::Cancelled {
            (JobStatus::Failed, EventType::JobCancelled)
        } else if stage == Stage::Publishing && run.video.is_some() {
            (JobStatus::Partial, EventType::JobPartial)
        } else {
            (JobStatus::Failed, EventType::JobFailed)
        };

        if let Err(e) = run.job.transition(status) {
            warn!(error = %e, "Unexpected transition at finalization");
        }

        let event = Event::new(
            run.job.id,
            Some(stage),
            event_type,
            format!("{}:complete", run.job.id),
            format!("Job ended as {} at stage '{}'", status, stage),
        )
        .with_error(format!("{}: {}", error.code(), error));
        run.store.append(&event).await?;

        if status == JobStatus::Partial {
            warn!(job_id = %run.job.id, error = %error, "Job finished with a local video only");
        } else {
            error!(job_id = %run.job.id, stage = %stage, error = %error, "Job failed");
        }

        let report = FailureReport::from_error(stage, &error, attempts);
        Ok(self.result(run, Some(report)))
    }

    fn result(&self, run: JobRun, failure: Option<FailureReport>) -> JobResult {
        JobResult {
            job_id: run.job.id,
            status: run.job.status(),
            theme: run.job.theme,
            language: run.job.language,
            content_type: run.job.content_type,
            topic: run.job.topic,
            script: run.script,
            audio: run.audio,
            video: run.video,
            publish: run.publish,
            failure,
            last_artifact: run.last_artifact,
            refresh_attempts: run.refresh_attempts.load(Ordering::SeqCst),
            started_at: run.started_at,
            finished_at: Utc::now(),
        }
    }

    /// Run many independent jobs under the configured concurrency cap.
    ///
    /// Results come back in request order; execution order is unspecified.
    #[instrument(skip_all, fields(jobs = requests.len(), max_concurrent = self.batch.max_concurrent_jobs))]
    pub async fn run_batch(
        self: &Arc<Self>,
        requests: Vec<JobRequest>,
        cancel: &CancellationToken,
    ) -> Vec<JobResult> {
        let semaphore = Arc::new(Semaphore::new(self.batch.max_concurrent_jobs.max(1)));
        let mut tasks = JoinSet::new();

        for (index, request) in requests.iter().cloned().enumerate() {
            let orchestrator = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => orchestrator.run_job(request.clone(), &cancel).await,
                    Err(e) => Err(PipelineError::Store(format!("batch semaphore closed: {}", e))),
                };
                (index, outcome)
            });
        }

        let mut results: Vec<Option<JobResult>> = vec![None; requests.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(result))) => results[index] = Some(result),
                Ok((index, Err(e))) => {
                    error!(index, error = %e, "Job bookkeeping failed");
                    results[index] = Some(not_started(&requests[index], e));
                }
                Err(e) => error!(error = %e, "Job task aborted"),
            }
        }

        let finished: Vec<JobResult> = results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    not_started(
                        &requests[index],
                        PipelineError::Store("job task aborted".to_string()),
                    )
                })
            })
            .collect();

        let done = finished.iter().filter(|r| r.status == JobStatus::Done).count();
        info!(done, total = finished.len(), "Batch finished");
        finished
    }

    /// Status of one job, replayed from its event log
    pub async fn get_job_status(&self, job_id: Uuid) -> PipelineResult<Option<JobRecord>> {
        let Some(store) = JobStore::existing(&self.jobs_dir, job_id) else {
            return Ok(None);
        };
        let events = store.replay().await?;
        Ok(JobRecord::from_events(&events))
    }

    /// Most recent jobs first
    pub async fn list_jobs(&self, limit: usize) -> PipelineResult<Vec<JobRecord>> {
        let job_ids = JobStore::list_jobs(&self.jobs_dir).await?;
        let mut jobs = Vec::new();

        for job_id in job_ids {
            match self.get_job_status(job_id).await {
                Ok(Some(record)) => jobs.push(record),
                Ok(None) => {}
                Err(e) => warn!(%job_id, error = %e, "Skipping unreadable job"),
            }
        }

        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

fn internal(stage: Stage, error: PipelineError) -> StageFailure {
    StageFailure {
        stage,
        error,
        attempts: 1,
    }
}

fn cancelled(stage: Stage, attempts: u32) -> StageFailure {
    StageFailure {
        stage,
        error: PipelineError::Cancelled {
            stage: stage.to_string(),
        },
        attempts,
    }
}

/// Result for a job whose bookkeeping failed before it could report
fn not_started(request: &JobRequest, error: PipelineError) -> JobResult {
    let now = Utc::now();
    JobResult {
        job_id: Uuid::nil(),
        status: JobStatus::Failed,
        theme: request.theme.clone(),
        language: request.language.clone(),
        content_type: request.content_type.clone().unwrap_or_default(),
        topic: request.topic.clone().unwrap_or_default(),
        script: None,
        audio: None,
        video: None,
        publish: None,
        failure: Some(FailureReport::from_error(Stage::Resolving, &error, 0)),
        last_artifact: None,
        refresh_attempts: 0,
        started_at: now,
        finished_at: now,
    }
}
