//! Import engine
//!
//! One engine owns one monitor, one threshold policy, one reclaimer and one
//! execution pool. Each call owns its own result and shares only read-only
//! configuration with concurrent calls.
//!
//! Import flow:
//! 1. Admission: file size, kind and the current memory sample decide whether
//!    to proceed.
//! 2. Read: the streaming reader decodes and sanitizes, dispatching windows to
//!    the pool for large sheets.
//! 3. Every `reevaluate_every_chunks` windows the threshold policy looks at a
//!    fresh sample: warnings hint reclamation, critical usage forces it.

use crate::config::EngineConfig;
use crate::error::EngineError;
use sheetgate_codec::{
    ChunkExecutor, ChunkProgress, ImportOptions, ImportResult, Preview, Record, StreamingReader, StreamingWriter,
    ValidationReport,
};
use sheetgate_monitor::{
    AdmissionDecision, AdmissionEstimator, FileKind, MemoryAlert, MemoryProbe, MemorySample, ReclaimReport, Reclaimer,
    ResourceMonitor, SysinfoProbe, ThresholdPolicy,
};
use sheetgate_pool::{ExecutionPool, PoolStats};
use std::sync::Arc;

/// Import engine
pub struct ImportEngine {
    config: EngineConfig,
    monitor: Arc<ResourceMonitor>,
    policy: Arc<ThresholdPolicy>,
    reclaimer: Arc<Reclaimer>,
    estimator: AdmissionEstimator,
    reader: StreamingReader,
    writer: StreamingWriter,
    pool: ExecutionPool,
}

impl std::fmt::Debug for ImportEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportEngine")
            .field("monitor", &self.monitor)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ImportEngine {
    /// Create an engine over `probe`. Must run inside a tokio runtime.
    ///
    /// # Errors
    /// - `EngineError::Config` or `EngineError::Monitor` for invalid configuration
    /// - `EngineError::Pool` outside a tokio runtime
    pub fn new(config: EngineConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self, EngineError> {
        config.validate()?;

        let policy = Arc::new(ThresholdPolicy::new(config.thresholds)?);
        let reclaimer = Arc::new(Reclaimer::new(Arc::clone(&probe)));
        let monitor = Arc::new(ResourceMonitor::new(Arc::clone(&probe), config.monitor));
        let estimator = AdmissionEstimator::new(config.admission.clone());
        let pool = ExecutionPool::new(config.pool.clone())?;

        let executor: Arc<dyn ChunkExecutor> = Arc::new(pool.clone());
        let reader = StreamingReader::new(probe, Arc::clone(&reclaimer))
            .with_executor(executor, config.pool.parallel_row_threshold);
        let writer = StreamingWriter::new(Arc::clone(&reclaimer));

        tracing::info!(
            max_workers = pool.config().max_workers,
            parallel_row_threshold = config.pool.parallel_row_threshold,
            reevaluate_every_chunks = config.reevaluate_every_chunks,
            "import engine created"
        );

        Ok(Self {
            config,
            monitor,
            policy,
            reclaimer,
            estimator,
            reader,
            writer,
            pool,
        })
    }

    /// Create an engine over the process memory of this machine, capped at
    /// `memory_budget_bytes` when configured.
    ///
    /// # Errors
    /// Same as [`ImportEngine::new`]
    pub fn with_system_probe(config: EngineConfig) -> Result<Self, EngineError> {
        let probe = match config.memory_budget_bytes {
            Some(budget) => SysinfoProbe::new().with_budget(budget),
            None => SysinfoProbe::new(),
        };
        Self::new(config, Arc::new(probe))
    }

    /// Engine configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resource monitor
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Threshold policy and its alert log
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    /// Reclaimer
    #[inline]
    #[must_use]
    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Execution pool
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    /// Pool statistics
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Start interval sampling. Every retained sample is run through the
    /// threshold policy.
    ///
    /// # Errors
    /// `EngineError::Monitor` if sampling is already running
    pub fn start(&self) -> Result<(), EngineError> {
        let policy = Arc::clone(&self.policy);
        let reclaimer = Arc::clone(&self.reclaimer);
        self.monitor.start(move |sample| {
            respond_to_pressure(&policy, &reclaimer, &sample);
        })?;
        tracing::info!("memory monitoring started");
        Ok(())
    }

    /// Stop interval sampling. History is kept.
    pub fn stop(&self) {
        self.monitor.stop();
    }

    /// Stop sampling and shut the pool down
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.pool.shutdown();
        tracing::info!("import engine shut down");
    }

    /// Memory reading taken now
    #[must_use]
    pub fn current_sample(&self) -> MemorySample {
        self.monitor.current_sample()
    }

    /// Admission verdict for a file of `file_size` bytes against current memory
    #[must_use]
    pub fn admission(&self, file_size: u64, kind: FileKind) -> AdmissionDecision {
        self.estimator
            .can_process(file_size, kind, &self.monitor.current_sample())
    }

    /// Evaluate a fresh sample against the thresholds now
    pub fn reevaluate(&self) -> Option<MemoryAlert> {
        let sample = self.monitor.current_sample();
        respond_to_pressure(&self.policy, &self.reclaimer, &sample)
    }

    /// Drop every registered cache and hint reclamation
    pub fn force_reclaim(&self) -> ReclaimReport {
        self.reclaimer.force()
    }

    /// Import with the configured default options
    ///
    /// # Errors
    /// See [`ImportEngine::import_with`]
    pub async fn import(&self, buffer: &[u8], kind: FileKind) -> Result<ImportResult, EngineError> {
        self.import_with(buffer, kind, &self.config.import).await
    }

    /// Admit, read and sanitize `buffer`.
    ///
    /// # Errors
    /// - `EngineError::AdmissionRejected` if memory is insufficient
    /// - `EngineError::Codec` for file-level failures
    pub async fn import_with(
        &self,
        buffer: &[u8],
        kind: FileKind,
        options: &ImportOptions,
    ) -> Result<ImportResult, EngineError> {
        self.admit(buffer.len() as u64, kind)?;

        let every = self.config.reevaluate_every_chunks.max(1);
        let mut observer = |progress: ChunkProgress| {
            if (progress.index + 1) % every == 0 {
                tracing::debug!(
                    chunk = progress.index,
                    total = progress.total,
                    rows = progress.rows_processed,
                    "re-evaluating memory"
                );
                self.reevaluate();
            }
        };

        let result = self.reader.read_observed(buffer, kind, options, &mut observer).await?;
        tracing::info!(
            kind = %kind,
            rows = result.rows.len(),
            errors = result.errors.len(),
            total_rows = result.metadata.total_rows,
            chunks = result.metadata.chunks,
            dispatched = result.metadata.dispatched,
            elapsed_ms = result.metadata.processing_time_ms,
            "import finished"
        );
        Ok(result)
    }

    /// Check limits and headers without materializing rows
    #[must_use]
    pub fn validate(&self, buffer: &[u8], kind: FileKind) -> ValidationReport {
        self.validate_with(buffer, kind, &self.config.import)
    }

    /// [`validate`](Self::validate) with explicit options
    #[must_use]
    pub fn validate_with(&self, buffer: &[u8], kind: FileKind, options: &ImportOptions) -> ValidationReport {
        self.reader.validate(buffer, kind, options)
    }

    /// First `sample_size` sanitized rows
    ///
    /// # Errors
    /// `EngineError::Codec` for file-level failures
    pub fn preview(&self, buffer: &[u8], kind: FileKind, sample_size: usize) -> Result<Preview, EngineError> {
        Ok(self.reader.preview(buffer, kind, &self.config.import, sample_size)?)
    }

    /// Encode `rows` as XLSX on a blocking thread
    ///
    /// # Errors
    /// - `EngineError::Codec` for empty input or encoding failures
    /// - `EngineError::Background` if the blocking task panicked
    pub async fn export(&self, rows: Vec<Record>, sheet_name: &str) -> Result<Vec<u8>, EngineError> {
        let writer = self.writer.clone();
        let options = self.config.import.clone();
        let sheet_name = sheet_name.to_string();
        let bytes = tokio::task::spawn_blocking(move || writer.write(&rows, &sheet_name, &options))
            .await
            .map_err(|err| EngineError::Background(err.to_string()))??;
        Ok(bytes)
    }

    fn admit(&self, file_size: u64, kind: FileKind) -> Result<(), EngineError> {
        let decision = self.admission(file_size, kind);
        if !decision.can_process {
            let reason = decision
                .reason
                .unwrap_or_else(|| "insufficient memory".to_string());
            tracing::warn!(kind = %kind, file_size, %reason, "import rejected");
            return Err(EngineError::AdmissionRejected {
                reason,
                suggestions: decision.suggestions,
            });
        }
        for suggestion in &decision.suggestions {
            tracing::warn!(kind = %kind, file_size, %suggestion, "admitted with caveat");
        }
        Ok(())
    }
}

fn respond_to_pressure(policy: &ThresholdPolicy, reclaimer: &Reclaimer, sample: &MemorySample) -> Option<MemoryAlert> {
    policy.evaluate(
        sample,
        |_| reclaimer.suggest(),
        |_| {
            reclaimer.force();
        },
    )
}
