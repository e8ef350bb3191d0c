//! Shared engine context and collaborator traits
//!
//! Every component receives an [`EngineContext`] at construction instead of
//! reaching for globals. It carries the HTTP client, the configuration and the
//! pluggable collaborators (resolver, remuxer, prober, blacklist, error sink).

use crate::adblock::{AdBlacklist, AdFilter, FfprobeProber, FragmentProber, JsonBlacklist};
use crate::config::Config;
use crate::error::Result;
use crate::error_log::{ErrorEntry, ErrorLog};
use crate::fetcher::Fetcher;
use crate::remux::{FfmpegRemuxer, NoOpRemuxer, Remuxer};
use crate::types::{Resource, ResourceKind, Severity};
use async_trait::async_trait;
use std::sync::Arc;

/// Turns a task's seed url into a downloadable resource
///
/// Site-specific resolvers live outside this crate. Failures are attempt failures
/// and count against the task's retry budget.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `url` submitted under `source_key`
    async fn resolve(&self, source_key: &str, url: &str) -> Result<Resource>;
}

/// Resolver that hands back the seed url with its format inferred from the suffix
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectResolver;

#[async_trait]
impl Resolver for DirectResolver {
    async fn resolve(&self, _source_key: &str, url: &str) -> Result<Resource> {
        Ok(Resource::new(url, ResourceKind::Auto))
    }
}

/// Receives failures that must not be lost (callback errors, exhausted retries)
///
/// Reporting never fails.
pub trait ErrorSink: Send + Sync {
    /// Record one report
    fn report(&self, severity: Severity, title: &str, detail: &str);

    /// Retained reports, oldest first; empty for sinks that keep nothing
    fn entries(&self) -> Vec<ErrorEntry> {
        Vec::new()
    }
}

/// Error sink that only logs through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, severity: Severity, title: &str, detail: &str) {
        log_report(severity, title, detail);
    }
}

pub(crate) fn log_report(severity: Severity, title: &str, detail: &str) {
    match severity {
        Severity::Info => tracing::info!(title, detail, "Reported"),
        Severity::Warning => tracing::warn!(title, detail, "Reported"),
        Severity::Error | Severity::Critical => {
            tracing::error!(%severity, title, detail, "Reported")
        }
    }
}

/// Dependencies shared by every component of one engine (cheap to clone)
#[derive(Clone)]
pub struct EngineContext {
    /// HTTP client shared by all fetches
    pub client: reqwest::Client,
    /// Engine configuration
    pub config: Arc<Config>,
    /// Seed url resolver
    pub resolver: Arc<dyn Resolver>,
    /// Stream-copy remuxer for manifest downloads
    pub remuxer: Arc<dyn Remuxer>,
    /// Fragment prober; `None` disables ad filtering
    pub prober: Option<Arc<dyn FragmentProber>>,
    /// Known-ad hashes; `None` means live fingerprinting only
    pub blacklist: Option<Arc<dyn AdBlacklist>>,
    /// Destination for reports
    pub error_sink: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("remuxer", &self.remuxer.name())
            .field("has_prober", &self.prober.is_some())
            .field("has_blacklist", &self.blacklist.is_some())
            .finish()
    }
}

impl EngineContext {
    /// Context with external tools discovered from the configuration
    ///
    /// ffmpeg and ffprobe come from `tools.*_path` or, when `tools.search_path` is
    /// set, from PATH. A missing ffmpeg degrades to [`NoOpRemuxer`]; a missing
    /// ffprobe disables ad filtering. Reports go to an [`ErrorLog`] bounded by
    /// `errors.max_error_count`. No blacklist is attached; see
    /// [`from_config`](Self::from_config).
    pub fn new(config: Config, resolver: Arc<dyn Resolver>) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .user_agent(config.download.user_agent.clone())
            .build()?;

        let remuxer: Arc<dyn Remuxer> = if let Some(ref path) = config.tools.ffmpeg_path {
            Arc::new(FfmpegRemuxer::new(path.clone()))
        } else if config.tools.search_path {
            FfmpegRemuxer::from_path()
                .map(|r| Arc::new(r) as Arc<dyn Remuxer>)
                .unwrap_or_else(|| Arc::new(NoOpRemuxer))
        } else {
            Arc::new(NoOpRemuxer)
        };

        let prober: Option<Arc<dyn FragmentProber>> =
            if let Some(ref path) = config.tools.ffprobe_path {
                Some(Arc::new(FfprobeProber::new(path.clone())))
            } else if config.tools.search_path {
                FfprobeProber::from_path().map(|p| Arc::new(p) as Arc<dyn FragmentProber>)
            } else {
                None
            };

        tracing::info!(
            remuxer = remuxer.name(),
            ad_filter = prober.is_some() && config.ad_block.enabled,
            "Engine tools initialized"
        );

        let error_sink = Arc::new(ErrorLog::new(config.errors.max_error_count));
        Ok(Self {
            client,
            config: Arc::new(config),
            resolver,
            remuxer,
            prober,
            blacklist: None,
            error_sink,
        })
    }

    /// Like [`new`](Self::new), also loading `ad_block.blacklist_path` when set
    ///
    /// # Errors
    ///
    /// Fails when the blacklist file exists but cannot be read or parsed.
    pub async fn from_config(config: Config, resolver: Arc<dyn Resolver>) -> Result<Self> {
        let blacklist_path = config.ad_block.blacklist_path.clone();
        let ctx = Self::new(config, resolver)?;
        match blacklist_path {
            Some(path) => {
                let blacklist = JsonBlacklist::load(path).await?;
                Ok(ctx.with_blacklist(Arc::new(blacklist)))
            }
            None => Ok(ctx),
        }
    }

    /// Replace the remuxer
    pub fn with_remuxer(mut self, remuxer: Arc<dyn Remuxer>) -> Self {
        self.remuxer = remuxer;
        self
    }

    /// Replace (or set) the fragment prober
    pub fn with_prober(mut self, prober: Arc<dyn FragmentProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Attach a persisted ad blacklist
    pub fn with_blacklist(mut self, blacklist: Arc<dyn AdBlacklist>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    /// Replace the error sink
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Fetcher over the shared client
    pub fn fetcher(&self) -> Fetcher {
        Fetcher::new(self.client.clone())
    }

    /// Ad filter for one manifest pass, if filtering is enabled and a prober exists
    pub fn ad_filter(&self) -> Option<AdFilter> {
        if !self.config.ad_block.enabled {
            return None;
        }
        let prober = self.prober.clone()?;
        Some(AdFilter::new(
            prober,
            self.blacklist.clone(),
            self.config.ad_block.probe_workers,
        ))
    }
}
