use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use iptvrelay_core::config::HlsConfig;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::transcode::TranscoderLauncher;

const GENERATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Short warm-up media served before the first real segment exists.
#[derive(Debug, Clone)]
pub struct BootstrapSegment {
    pub data: Bytes,
    pub duration: Duration,
}

impl BootstrapSegment {
    pub async fn load(path: &Path, duration: Duration) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        Ok(Self {
            data: Bytes::from(data),
            duration,
        })
    }
}

/// Resolves the bootstrap segment once per process: from a file when one is
/// configured, otherwise rendered by the transcoder.
#[derive(Debug)]
pub struct BootstrapSource {
    path: Option<PathBuf>,
    duration: Duration,
    launcher: Option<Arc<dyn TranscoderLauncher>>,
    cell: OnceCell<Option<BootstrapSegment>>,
}

impl BootstrapSource {
    pub fn new(config: &HlsConfig, launcher: Arc<dyn TranscoderLauncher>) -> Self {
        Self {
            path: config.bootstrap_path.clone(),
            duration: Duration::from_secs_f64(config.bootstrap_seconds.max(0.1)),
            launcher: Some(launcher),
            cell: OnceCell::new(),
        }
    }

    /// Always serve `segment`.
    #[must_use]
    pub fn fixed(segment: BootstrapSegment) -> Self {
        Self {
            path: None,
            duration: segment.duration,
            launcher: None,
            cell: OnceCell::new_with(Some(Some(segment))),
        }
    }

    /// Never serve a bootstrap segment.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: None,
            duration: Duration::ZERO,
            launcher: None,
            cell: OnceCell::new_with(Some(None)),
        }
    }

    /// The cached segment, resolving it on first use. `None` when neither
    /// source produced one; sessions then start with an empty manifest.
    pub async fn get(&self) -> Option<BootstrapSegment> {
        self.cell
            .get_or_init(|| self.resolve())
            .await
            .clone()
    }

    async fn resolve(&self) -> Option<BootstrapSegment> {
        if let Some(path) = &self.path {
            match BootstrapSegment::load(path, self.duration).await {
                Ok(segment) if !segment.data.is_empty() => return Some(segment),
                Ok(_) => warn!(path = %path.display(), "Bootstrap segment file is empty"),
                Err(e) => warn!(path = %path.display(), "Failed to read bootstrap segment: {e}"),
            }
        }

        let launcher = self.launcher.as_ref()?;
        let mut command = launcher.bootstrap_command(self.duration)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(GENERATE_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() && !output.stdout.is_empty() => {
                info!(
                    bytes = output.stdout.len(),
                    duration_ms = self.duration.as_millis() as u64,
                    "Generated bootstrap segment"
                );
                Some(BootstrapSegment {
                    data: Bytes::from(output.stdout),
                    duration: self.duration,
                })
            }
            Ok(Ok(output)) => {
                warn!(status = %output.status, "Bootstrap generation produced no segment");
                None
            }
            Ok(Err(e)) => {
                warn!("Failed to run bootstrap generator: {e}");
                None
            }
            Err(_) => {
                warn!("Bootstrap generation timed out");
                None
            }
        }
    }
}
