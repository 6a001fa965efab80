// Acquisition state machine: locate the conversion binary, or fetch and extract it with consent.
use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AcquireState {
    Searching,
    Prompting,
    Downloading,
    Extracting,
    Verifying,
    Found,
    Aborted,
}

pub trait DownloadConsent {
    fn confirm_download(&self, binary_name: &str, source: &ArchiveSource) -> bool;
}

impl<F> DownloadConsent for F
where
    F: Fn(&str, &ArchiveSource) -> bool,
{
    fn confirm_download(&self, binary_name: &str, source: &ArchiveSource) -> bool {
        self(binary_name, source)
    }
}

pub struct BinaryAcquirer<'a> {
    config: &'a PipelineConfig,
    backend: &'a dyn ArchiveBackend,
    state: AcquireState,
}

impl<'a> BinaryAcquirer<'a> {
    pub fn new(config: &'a PipelineConfig, backend: &'a dyn ArchiveBackend) -> Self {
        Self {
            config,
            backend,
            state: AcquireState::Searching,
        }
    }

    pub fn state(&self) -> AcquireState {
        self.state
    }

    fn transition(&mut self, next: AcquireState) {
        if self.state != next {
            debug!("Acquisition {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    pub fn acquire(
        &mut self,
        consent: &dyn DownloadConsent,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<ExternalBinary> {
        let result = self.run(consent, sink, cancel);
        match &result {
            Ok(_) => self.transition(AcquireState::Found),
            Err(error) => {
                self.transition(AcquireState::Aborted);
                if error.is_cancelled() {
                    info!("Acquisition of {} cancelled", self.config.binary_name);
                } else {
                    error!("Acquisition of {} failed: {error}", self.config.binary_name);
                }
            }
        }
        result
    }

    fn run(
        &mut self,
        consent: &dyn DownloadConsent,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<ExternalBinary> {
        let config = self.config;
        self.transition(AcquireState::Searching);
        emit_stage(
            sink,
            Stage::Searching,
            &format!("Looking for {}", config.binary_name),
        );
        if let Some(path) = locate(&config.binary_file_name(), &config.search_dirs()) {
            return verify_binary(&config.binary_name, &path, config);
        }

        self.transition(AcquireState::Prompting);
        emit_stage(
            sink,
            Stage::Prompting,
            &format!("{} is missing, asking to download it", config.binary_name),
        );
        if !consent.confirm_download(&config.binary_name, &config.archive_source) {
            info!("Download of {} declined", config.binary_name);
            return Err(PipelineError::BinaryNotFound(config.binary_name.clone()));
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::UserCancelled);
        }

        self.transition(AcquireState::Downloading);
        let source = &config.archive_source;
        let source_url = ensure_trusted_https_url(&source.url)?;
        emit_stage_with_detail(
            sink,
            Stage::Downloading,
            "Downloading archive",
            source_url.host_str().map(str::to_string),
        );
        config.ensure_resource_dir()?;
        let expected_bytes = self.backend.probe_size(&source.url, cancel)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::UserCancelled);
        }
        if expected_bytes.is_none() {
            match config.size_probe_policy {
                SizeProbePolicy::Strict => {
                    return Err(PipelineError::DownloadFailed(
                        "Server did not report the archive size.".to_string(),
                    ));
                }
                SizeProbePolicy::Permissive => {
                    warn!("Archive size unknown, progress will be indeterminate");
                }
            }
        }

        let mut task = DownloadTask::new(&source.url, &config.archive_download_path(), expected_bytes);
        if self.backend.fetch(&mut task, sink, cancel)? == FetchOutcome::Cancelled {
            return Err(PipelineError::UserCancelled);
        }
        if let Some(expected_sha256) = source.sha256.as_deref() {
            if let Err(error) = verify_download_checksum(&task.destination_path, expected_sha256) {
                remove_file_if_exists(&task.destination_path);
                return Err(error);
            }
            debug!("Archive checksum verified");
        }
        if cancel.is_cancelled() {
            release_file_locks(config);
            remove_file_if_exists(&task.destination_path);
            return Err(PipelineError::UserCancelled);
        }

        self.transition(AcquireState::Extracting);
        emit_stage(
            sink,
            Stage::Extracting,
            &format!("Extracting {}", config.binary_file_name()),
        );
        let extracted = self.backend.extract(&task.destination_path, cancel)?;

        self.transition(AcquireState::Verifying);
        emit_stage(
            sink,
            Stage::Verifying,
            &format!("Verifying {}", config.binary_name),
        );
        if !extracted.is_file() {
            return Err(PipelineError::ExtractionFailed(format!(
                "{} is missing after extraction.",
                extracted.display()
            )));
        }
        verify_binary(&config.binary_name, &extracted, config)
    }
}
