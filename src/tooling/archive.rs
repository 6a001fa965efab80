// Archive download through curl and single-binary extraction into the resource directory.
use super::*;
use zip::ZipArchive;

const SIZE_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed,
    Cancelled,
}

pub trait ArchiveBackend {
    fn probe_size(&self, url: &str, cancel: &CancellationToken) -> PipelineResult<Option<u64>>;

    fn fetch(
        &self,
        task: &mut DownloadTask,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<FetchOutcome>;

    // Leaves the binary in the resource directory and removes the archive.
    fn extract(&self, archive_path: &Path, cancel: &CancellationToken) -> PipelineResult<PathBuf>;
}

pub struct SubprocessArchiveBackend<'a> {
    config: &'a PipelineConfig,
    http_tool: &'static str,
}

impl<'a> SubprocessArchiveBackend<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            http_tool: "curl",
        }
    }

    #[cfg(test)]
    fn with_http_tool(config: &'a PipelineConfig, http_tool: &'static str) -> Self {
        Self { config, http_tool }
    }

    fn curl(&self) -> PipelineResult<PathBuf> {
        locate_helper_tool(self.http_tool, self.config).ok_or_else(|| {
            PipelineError::DownloadFailed(format!(
                "{} was not found on this system.",
                self.http_tool
            ))
        })
    }

    fn discard_partial_download(&self, task: &DownloadTask) {
        release_file_locks(self.config);
        remove_file_if_exists(&task.destination_path);
        remove_file_if_exists(&self.config.resource_binary_path());
    }

    fn discard_partial_extraction(&self, archive_path: &Path) {
        release_file_locks(self.config);
        remove_file_if_exists(archive_path);
        remove_file_if_exists(&self.config.resource_binary_path());
    }

    fn extract_with_tool(
        &self,
        archive_path: &Path,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let kind = self.config.archive_source.kind;
        let tool_names: &[&str] = match kind {
            ArchiveKind::TarXz => &["tar"],
            ArchiveKind::SevenZip => &["7za", "7z"],
            ArchiveKind::Zip => &[],
        };
        let Some((tool_name, tool_path)) = tool_names
            .iter()
            .find_map(|name| locate_helper_tool(name, self.config).map(|path| (*name, path)))
        else {
            return Err(PipelineError::ExtractionFailed(format!(
                "No extraction tool found for .{} archives.",
                kind.download_extension()
            )));
        };

        let resource_dir = absolute_path(&self.config.resource_dir)?;
        let archive_path = absolute_path(archive_path)?;
        let mut command = hidden_command(&tool_path);
        command
            .args(extraction_args(
                kind,
                &archive_path,
                &resource_dir,
                &self.config.binary_file_name(),
            ))
            .current_dir(&resource_dir);
        let output = run_to_completion(
            tool_name,
            command,
            self.config.download_timeout,
            self.config.poll_interval,
            Some(cancel),
        )?;
        if !output.status.success() {
            return Err(PipelineError::ExtractionFailed(format!(
                "{tool_name} exited with {}: {}",
                output.status,
                output.stderr_tail(3)
            )));
        }
        Ok(())
    }

    fn extract_zip(&self, archive_path: &Path, cancel: &CancellationToken) -> PipelineResult<()> {
        let target = self.config.resource_binary_path();
        let staging = target.with_extension("tmp");
        let found = extract_zip_entry(
            archive_path,
            &self.config.binary_file_name(),
            &staging,
            cancel,
        );
        match found {
            Ok(true) => {
                fs::rename(&staging, &target)?;
                Ok(())
            }
            Ok(false) => Err(PipelineError::ExtractionFailed(format!(
                "{} was not found in the archive.",
                self.config.binary_file_name()
            ))),
            Err(error) => {
                remove_file_if_exists(&staging);
                Err(error)
            }
        }
    }
}

impl ArchiveBackend for SubprocessArchiveBackend<'_> {
    fn probe_size(&self, url: &str, cancel: &CancellationToken) -> PipelineResult<Option<u64>> {
        ensure_trusted_https_url(url)?;
        let curl = self.curl()?;
        let mut command = hidden_command(&curl);
        command.args(["-k", "-L", "-I", "-s"]).arg(url);
        let output = run_to_completion(
            "curl",
            command,
            Some(SIZE_PROBE_TIMEOUT),
            self.config.poll_interval,
            Some(cancel),
        )?;
        if !output.status.success() {
            warn!(
                "Size probe for {url} exited with {}: {}",
                output.status,
                output.stderr_tail(2)
            );
            return Ok(None);
        }
        let size = parse_content_length(&output.stdout);
        debug!("Size probe for {url}: {size:?}");
        Ok(size)
    }

    fn fetch(
        &self,
        task: &mut DownloadTask,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<FetchOutcome> {
        let source = ensure_trusted_https_url(&task.url)?;
        let curl = self.curl()?;
        if let Some(parent) = task.destination_path.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_file_if_exists(&task.destination_path);

        let mut command = hidden_command(&curl);
        command
            .arg(&task.url)
            .args(["-k", "-L", "-s", "-S", "--fail", "--output"])
            .arg(&task.destination_path);
        info!(
            "Downloading {} from {}",
            task.destination_path.display(),
            source.host_str().unwrap_or("unknown host")
        );

        let started_at = Instant::now();
        let mut last_reported: Option<u64> = None;
        let mut process = RunningProcess::spawn("curl", command)?;
        loop {
            if cancel.is_cancelled() {
                process.kill();
                info!("Download cancelled, discarding partial archive");
                self.discard_partial_download(task);
                return Ok(FetchOutcome::Cancelled);
            }

            let event = process.next_event(self.config.poll_interval)?;
            task.bytes_written = fs::metadata(&task.destination_path)
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            if last_reported != Some(task.bytes_written) {
                last_reported = Some(task.bytes_written);
                sink.emit(PipelineEvent::Download {
                    bytes_written: task.bytes_written,
                    expected_bytes: task.expected_bytes,
                });
            }

            match event {
                ProcessEvent::Exited(status) => {
                    let output = process.finish(status);
                    if cancel.is_cancelled() {
                        info!("Download cancelled, discarding partial archive");
                        self.discard_partial_download(task);
                        return Ok(FetchOutcome::Cancelled);
                    }
                    if !status.success() {
                        self.discard_partial_download(task);
                        return Err(PipelineError::DownloadFailed(format!(
                            "curl exited with {status}: {}",
                            output.stderr_tail(2)
                        )));
                    }
                    break;
                }
                ProcessEvent::Tick => {
                    let Some(limit) = self.config.download_timeout else {
                        continue;
                    };
                    if started_at.elapsed() >= limit {
                        process.kill();
                        self.discard_partial_download(task);
                        return Err(PipelineError::ProcessTimedOut {
                            program: "curl".to_string(),
                            timeout: limit,
                        });
                    }
                }
            }
        }

        if !task.destination_path.is_file() {
            return Err(PipelineError::DownloadFailed(
                "Download finished without writing the archive.".to_string(),
            ));
        }
        if let Some(expected) = task.expected_bytes {
            if expected != task.bytes_written {
                warn!(
                    "Downloaded {} bytes, server announced {expected}",
                    task.bytes_written
                );
            }
        }
        Ok(FetchOutcome::Completed)
    }

    fn extract(&self, archive_path: &Path, cancel: &CancellationToken) -> PipelineResult<PathBuf> {
        self.config.ensure_resource_dir()?;
        let result = match self.config.archive_source.kind {
            ArchiveKind::Zip => self.extract_zip(archive_path, cancel),
            ArchiveKind::TarXz | ArchiveKind::SevenZip => {
                self.extract_with_tool(archive_path, cancel)
            }
        };
        if let Err(error) = result {
            warn!("Extraction aborted: {error}");
            self.discard_partial_extraction(archive_path);
            return Err(error);
        }
        remove_file_if_exists(archive_path);
        Ok(self.config.resource_binary_path())
    }
}

// Status and length are taken from the last response after redirects.
pub(super) fn parse_content_length(headers: &str) -> Option<u64> {
    let mut status: Option<u16> = None;
    let mut length: Option<u64> = None;
    for line in headers.lines() {
        let line = line.trim();
        if line.starts_with("HTTP/") {
            status = line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse().ok());
            length = None;
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                length = value.trim().parse().ok();
            }
        }
    }
    match status {
        Some(200) => length,
        _ => None,
    }
}

pub(super) fn extraction_args(
    kind: ArchiveKind,
    archive_path: &Path,
    output_dir: &Path,
    binary_file_name: &str,
) -> Vec<OsString> {
    match kind {
        ArchiveKind::TarXz => vec![
            OsString::from("-xf"),
            archive_path.as_os_str().to_os_string(),
            OsString::from("--wildcards"),
            OsString::from("--no-anchored"),
            OsString::from(format!("*{binary_file_name}")),
            OsString::from("--strip-components"),
            OsString::from("1"),
        ],
        ArchiveKind::SevenZip => {
            let mut output_flag = OsString::from("-o");
            output_flag.push(output_dir.as_os_str());
            vec![
                OsString::from("e"),
                archive_path.as_os_str().to_os_string(),
                output_flag,
                OsString::from(binary_file_name),
                OsString::from("-r"),
                OsString::from("-y"),
            ]
        }
        ArchiveKind::Zip => Vec::new(),
    }
}

pub(super) fn extract_zip_entry(
    archive_path: &Path,
    binary_file_name: &str,
    output_path: &Path,
    cancel: &CancellationToken,
) -> PipelineResult<bool> {
    let file = fs::File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|error| PipelineError::ExtractionFailed(format!("Failed to read archive: {error}")))?;
    let wanted = binary_file_name.to_lowercase();
    let nested_suffix = format!("/{wanted}");

    for index in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(PipelineError::UserCancelled);
        }
        let mut entry = archive.by_index(index).map_err(|error| {
            PipelineError::ExtractionFailed(format!("Failed to read archive entry: {error}"))
        })?;
        if !entry.is_file() {
            continue;
        }
        let normalized_name = entry.name().replace('\\', "/").to_lowercase();
        if normalized_name != wanted && !normalized_name.ends_with(&nested_suffix) {
            continue;
        }
        debug!("Extracting {} from archive", entry.name());
        let mut output = fs::File::create(output_path)?;
        std::io::copy(&mut entry, &mut output)
            .map_err(|error| PipelineError::ExtractionFailed(format!("Failed to extract: {error}")))?;
        return Ok(true);
    }
    Ok(false)
}
