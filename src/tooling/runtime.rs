// Pipeline configuration, shared data model, trusted download helpers and common process primitives.
use super::*;
use sha2::{Digest, Sha256};
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::process::Child;
use std::sync::mpsc::RecvTimeoutError;
use url::Url;

pub(super) const RESOURCE_FOLDER_NAME: &str = "movie-import";
pub(super) const DEFAULT_BINARY_NAME: &str = "ffmpeg";
pub(super) const FFMPEG_LINUX_URL: &str =
    "https://johnvansickle.com/ffmpeg/builds/ffmpeg-git-amd64-static.tar.xz";
pub(super) const FFMPEG_MACOS_URL: &str = "https://evermeet.cx/ffmpeg/getrelease/7z";
pub(super) const FFMPEG_WINDOWS_URL: &str =
    "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";
pub(super) const TRUSTED_DOWNLOAD_HOSTS: [&str; 6] = [
    "johnvansickle.com",
    "evermeet.cx",
    "www.gyan.dev",
    "gyan.dev",
    "github.com",
    "objects.githubusercontent.com",
];
pub(super) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub(super) const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(1500);
pub(super) const DEFAULT_SELF_CHECK_TIMEOUT: Duration = Duration::from_millis(3000);
pub(super) const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub(super) const DEFAULT_LOCK_RELEASE_DELAY: Duration = Duration::from_millis(600);
#[cfg(target_os = "windows")]
pub(super) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub(super) fn hidden_command(program: impl AsRef<OsStr>) -> Command {
    let mut command = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    command
}

pub(super) fn platform_bin(name: &str) -> String {
    if cfg!(target_os = "windows") && !name.to_ascii_lowercase().ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SizeProbePolicy {
    // Missing length only loses the determinate progress bar.
    #[default]
    Permissive,
    // Missing length aborts the download before it starts.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArchiveKind {
    TarXz,
    SevenZip,
    Zip,
}

impl ArchiveKind {
    pub fn download_extension(&self) -> &'static str {
        match self {
            ArchiveKind::TarXz => "xz",
            ArchiveKind::SevenZip => "7z",
            ArchiveKind::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    pub url: String,
    pub kind: ArchiveKind,
    pub sha256: Option<String>,
}

impl ArchiveSource {
    pub fn new(url: impl Into<String>, kind: ArchiveKind) -> Self {
        Self {
            url: url.into(),
            kind,
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn for_current_platform() -> Self {
        if cfg!(target_os = "windows") {
            Self::new(FFMPEG_WINDOWS_URL, ArchiveKind::Zip)
        } else if cfg!(target_os = "macos") {
            Self::new(FFMPEG_MACOS_URL, ArchiveKind::SevenZip)
        } else {
            Self::new(FFMPEG_LINUX_URL, ArchiveKind::TarXz)
        }
    }
}

// Immutable settings for one pipeline run, threaded through every stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub binary_name: String,
    // Persistent directory holding the acquired binary and, transiently, its archive.
    pub resource_dir: PathBuf,
    // Parent of the per-run workspaces.
    pub temp_root: PathBuf,
    // Host-bundled directories searched after the resource directory and before `PATH`.
    pub extra_search_dirs: Vec<PathBuf>,
    pub archive_source: ArchiveSource,
    pub poll_interval: Duration,
    // Bound for short helper invocations such as `chmod`.
    pub start_timeout: Duration,
    pub self_check_timeout: Duration,
    pub probe_timeout: Duration,
    pub download_timeout: Option<Duration>,
    pub lock_release_delay: Duration,
    pub size_probe_policy: SizeProbePolicy,
}

impl PipelineConfig {
    pub fn new(resource_dir: impl Into<PathBuf>, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            resource_dir: resource_dir.into(),
            temp_root: temp_root.into(),
            extra_search_dirs: Vec::new(),
            archive_source: ArchiveSource::for_current_platform(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_timeout: DEFAULT_START_TIMEOUT,
            self_check_timeout: DEFAULT_SELF_CHECK_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            download_timeout: None,
            lock_release_delay: DEFAULT_LOCK_RELEASE_DELAY,
            size_probe_policy: SizeProbePolicy::default(),
        }
    }

    pub fn for_current_user() -> PipelineResult<Self> {
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Failed to resolve user data dir",
                ))
            })?;
        let resource_dir = data_dir.join(RESOURCE_FOLDER_NAME).join("resources");
        Ok(Self::new(resource_dir, std::env::temp_dir()))
    }

    pub fn binary_file_name(&self) -> String {
        platform_bin(&self.binary_name)
    }

    pub fn resource_binary_path(&self) -> PathBuf {
        self.resource_dir.join(self.binary_file_name())
    }

    pub fn archive_download_path(&self) -> PathBuf {
        self.resource_dir.join(format!(
            "{}_download.{}",
            self.binary_name,
            self.archive_source.kind.download_extension()
        ))
    }

    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.resource_dir.clone()];
        dirs.extend(self.extra_search_dirs.iter().cloned());
        dirs
    }

    // Helper tools run with the resource directory as cwd, so relative roots are pinned here.
    pub fn resolve_relative_dirs(&mut self) -> PipelineResult<()> {
        self.resource_dir = absolute_path(&self.resource_dir)?;
        self.temp_root = absolute_path(&self.temp_root)?;
        Ok(())
    }

    pub fn ensure_resource_dir(&self) -> PipelineResult<&Path> {
        fs::create_dir_all(&self.resource_dir)?;
        Ok(&self.resource_dir)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Searching,
    Prompting,
    Downloading,
    Extracting,
    Verifying,
    Probing,
    ConvertingVideo,
    ConvertingAudio,
    Importing,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    Stage {
        stage: Stage,
        message: String,
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Download {
        bytes_written: u64,
        expected_bytes: Option<u64>,
    },
    Conversion(ConversionProgress),
}

pub trait ProgressSink {
    fn emit(&self, event: PipelineEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(PipelineEvent),
{
    fn emit(&self, event: PipelineEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Stage {
                stage,
                message,
                detail,
            } => match detail {
                Some(detail) => info!("[{stage:?}] {message} ({detail})"),
                None => info!("[{stage:?}] {message}"),
            },
            PipelineEvent::Download {
                bytes_written,
                expected_bytes: Some(total),
            } if total > 0 => debug!(
                "Downloading: {:.1}/{:.1} MB",
                bytes_written as f64 / (1024.0 * 1024.0),
                total as f64 / (1024.0 * 1024.0)
            ),
            PipelineEvent::Download { bytes_written, .. } => debug!(
                "Downloading: {:.1} MB received",
                bytes_written as f64 / (1024.0 * 1024.0)
            ),
            PipelineEvent::Conversion(progress) => debug!(
                "Converting: {}/{}",
                progress.files_written, progress.files_expected
            ),
        }
    }
}

pub(super) fn emit_stage(sink: &dyn ProgressSink, stage: Stage, message: &str) {
    emit_stage_with_detail(sink, stage, message, None);
}

pub(super) fn emit_stage_with_detail(
    sink: &dyn ProgressSink,
    stage: Stage,
    message: &str,
    detail: Option<String>,
) {
    sink.emit(PipelineEvent::Stage {
        stage,
        message: message.to_string(),
        detail,
    });
}

// Only locator::verify_binary hands out a resolved instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalBinary {
    name: String,
    resolved_path: Option<PathBuf>,
    verified_executable: bool,
}

impl ExternalBinary {
    pub fn missing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            resolved_path: None,
            verified_executable: false,
        }
    }

    pub(super) fn verified(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            resolved_path: Some(path),
            verified_executable: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolved_path(&self) -> Option<&Path> {
        self.resolved_path.as_deref()
    }

    pub fn is_verified(&self) -> bool {
        self.verified_executable
    }

    pub fn executable(&self) -> PipelineResult<&Path> {
        match self.resolved_path.as_deref() {
            Some(path) if self.verified_executable => Ok(path),
            Some(path) => Err(PipelineError::BinaryNotExecutable(path.to_path_buf())),
            None => Err(PipelineError::BinaryNotFound(self.name.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub url: String,
    pub destination_path: PathBuf,
    pub expected_bytes: Option<u64>,
    pub bytes_written: u64,
}

impl DownloadTask {
    pub fn new(url: &str, destination_path: &Path, expected_bytes: Option<u64>) -> Self {
        Self {
            url: url.to_string(),
            destination_path: destination_path.to_path_buf(),
            expected_bytes,
            bytes_written: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieInfo {
    pub has_video: bool,
    pub has_audio: bool,
    pub frame_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    pub input_movie_path: PathBuf,
    pub work_dir: PathBuf,
    pub has_video: bool,
    pub has_audio: bool,
    pub expected_frame_count: u64,
    pub image_ext: String,
    pub audio_ext: String,
}

impl ConversionJob {
    pub fn new(
        input_movie_path: &Path,
        work_dir: &Path,
        info: &MovieInfo,
        preferences: &Preferences,
    ) -> Self {
        Self {
            input_movie_path: input_movie_path.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            has_video: info.has_video,
            has_audio: info.has_audio,
            expected_frame_count: info.frame_count,
            image_ext: preferences.image_extension.extension().to_string(),
            audio_ext: preferences.audio_extension.extension().to_string(),
        }
    }

    pub fn files_expected(&self) -> usize {
        self.expected_frame_count as usize + usize::from(self.has_audio)
    }

    pub fn output_stem(&self) -> String {
        output_stem_for(&self.input_movie_path)
    }

    pub fn image_pattern(&self) -> PathBuf {
        self.work_dir
            .join(format!("{}-%04d.{}", self.output_stem(), self.image_ext))
    }

    pub fn audio_output_path(&self) -> PathBuf {
        self.work_dir
            .join(format!("{}.{}", self.output_stem(), self.audio_ext))
    }

    pub fn output_extensions(&self) -> [&str; 2] {
        [self.image_ext.as_str(), self.audio_ext.as_str()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionProgress {
    pub files_written: usize,
    pub files_expected: usize,
    pub cancelled: bool,
}

impl ConversionProgress {
    pub fn ratio(&self) -> Option<f32> {
        if self.files_expected == 0 {
            return None;
        }
        Some((self.files_written as f32 / self.files_expected as f32).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub name: String,
    pub available: bool,
    pub source: String,
    pub path: Option<String>,
    pub version: Option<String>,
    pub message: Option<String>,
}

pub(super) fn trusted_host_match(host: &str, allowed_host: &str) -> bool {
    host.eq_ignore_ascii_case(allowed_host)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", allowed_host.to_ascii_lowercase()))
}

pub(super) fn ensure_trusted_https_url(url: &str) -> PipelineResult<Url> {
    let parsed = Url::parse(url)
        .map_err(|_| PipelineError::DownloadFailed(format!("Invalid source URL: {url}")))?;
    if parsed.scheme() != "https" {
        return Err(PipelineError::DownloadFailed(
            "Only HTTPS download sources are allowed.".to_string(),
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(PipelineError::DownloadFailed(
            "Source URL must not include credentials.".to_string(),
        ));
    }
    if parsed.port().is_some() {
        return Err(PipelineError::DownloadFailed(
            "Source URL must not include a custom port.".to_string(),
        ));
    }
    let host = parsed.host_str().ok_or_else(|| {
        PipelineError::DownloadFailed("Failed to resolve source domain.".to_string())
    })?;
    if TRUSTED_DOWNLOAD_HOSTS
        .iter()
        .any(|allowed| trusted_host_match(host, allowed))
    {
        return Ok(parsed);
    }
    Err(PipelineError::DownloadFailed(format!(
        "Untrusted download source: {host}"
    )))
}

pub(super) fn sha256_of_file(path: &Path) -> PipelineResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub(super) fn verify_download_checksum(path: &Path, expected_sha256: &str) -> PipelineResult<()> {
    let expected = expected_sha256.trim().to_ascii_lowercase();
    if expected.len() != 64 || !expected.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(PipelineError::DownloadFailed(
            "Invalid expected SHA256 format.".to_string(),
        ));
    }
    let actual = sha256_of_file(path)?;
    if actual != expected {
        return Err(PipelineError::DownloadFailed(format!(
            "Checksum mismatch. Expected {expected}, got {actual}."
        )));
    }
    Ok(())
}

pub(super) fn release_file_locks(config: &PipelineConfig) {
    if !config.lock_release_delay.is_zero() {
        thread::sleep(config.lock_release_delay);
    }
}

pub(super) fn absolute_path(path: &Path) -> PipelineResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

pub(super) fn remove_file_if_exists(path: &Path) {
    if !path.exists() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(error) => warn!("Failed to remove {}: {error}", path.display()),
    }
}

pub(super) enum ProcessEvent {
    Tick,
    Exited(ExitStatus),
}

#[derive(Debug)]
pub(super) struct ProcessOutput {
    pub(super) status: ExitStatus,
    pub(super) stdout: String,
    pub(super) stderr: String,
}

impl ProcessOutput {
    pub(super) fn stderr_tail(&self, lines: usize) -> String {
        let tail: Vec<&str> = self
            .stderr
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .rev()
            .take(lines)
            .collect();
        if tail.is_empty() {
            return "no diagnostic output".to_string();
        }
        let mut ordered = tail;
        ordered.reverse();
        ordered.join(" | ")
    }
}

// Completion arrives through the channel: both pipe readers hold a sender and
// drop it at EOF, so a disconnected receiver means the child closed its output.
pub(super) struct RunningProcess {
    program: String,
    child: Child,
    finished_rx: mpsc::Receiver<()>,
    pipes_closed: bool,
    stdout_handle: Option<thread::JoinHandle<String>>,
    stderr_handle: Option<thread::JoinHandle<String>>,
}

fn spawn_pipe_reader<R>(mut stream: R, finished_tx: mpsc::Sender<()>) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut raw = Vec::new();
        if let Err(error) = stream.read_to_end(&mut raw) {
            debug!("Process pipe closed with error: {error}");
        }
        drop(finished_tx);
        String::from_utf8_lossy(&raw).to_string()
    })
}

impl RunningProcess {
    pub(super) fn spawn(program: &str, mut command: Command) -> PipelineResult<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Starting {program}: {command:?}");
        let mut child = command
            .spawn()
            .map_err(|source| PipelineError::ProcessFailedToStart {
                program: program.to_string(),
                source,
            })?;

        let (finished_tx, finished_rx) = mpsc::channel::<()>();
        let stdout_handle = child
            .stdout
            .take()
            .map(|stream| spawn_pipe_reader(stream, finished_tx.clone()));
        let stderr_handle = child
            .stderr
            .take()
            .map(|stream| spawn_pipe_reader(stream, finished_tx.clone()));
        drop(finished_tx);

        Ok(Self {
            program: program.to_string(),
            child,
            finished_rx,
            pipes_closed: false,
            stdout_handle,
            stderr_handle,
        })
    }

    pub(super) fn program(&self) -> &str {
        &self.program
    }

    // Blocks for at most `tick`.
    pub(super) fn next_event(&mut self, tick: Duration) -> PipelineResult<ProcessEvent> {
        if self.pipes_closed {
            thread::sleep(tick);
        } else {
            match self.finished_rx.recv_timeout(tick) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => self.pipes_closed = true,
            }
        }
        match self.child.try_wait()? {
            Some(status) => Ok(ProcessEvent::Exited(status)),
            None => Ok(ProcessEvent::Tick),
        }
    }

    // Reader threads are detached: a grandchild may still hold the pipes open.
    pub(super) fn kill(mut self) {
        if let Err(error) = self.child.kill() {
            debug!("Kill of {} reported: {error}", self.program);
        }
        let _ = self.child.wait();
        self.stdout_handle.take();
        self.stderr_handle.take();
        debug!("{} terminated", self.program);
    }

    pub(super) fn finish(mut self, status: ExitStatus) -> ProcessOutput {
        let (stdout, stderr) = self.join_readers();
        debug!("{} exited with {status}", self.program);
        ProcessOutput {
            status,
            stdout,
            stderr,
        }
    }

    fn join_readers(&mut self) -> (String, String) {
        let stdout = self
            .stdout_handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr = self
            .stderr_handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        (stdout, stderr)
    }
}

pub(super) fn run_to_completion(
    program: &str,
    command: Command,
    timeout: Option<Duration>,
    tick: Duration,
    cancel: Option<&CancellationToken>,
) -> PipelineResult<ProcessOutput> {
    let started_at = Instant::now();
    let mut process = RunningProcess::spawn(program, command)?;
    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            process.kill();
            return Err(PipelineError::UserCancelled);
        }
        match process.next_event(tick)? {
            ProcessEvent::Exited(status) => {
                let output = process.finish(status);
                // A terminal interrupt reaches the child and the host together.
                if cancel.is_some_and(|token| token.is_cancelled()) {
                    return Err(PipelineError::UserCancelled);
                }
                return Ok(output);
            }
            ProcessEvent::Tick => {
                if let Some(limit) = timeout {
                    if started_at.elapsed() >= limit {
                        warn!("{} timed out after {}ms", process.program(), limit.as_millis());
                        process.kill();
                        return Err(PipelineError::ProcessTimedOut {
                            program: program.to_string(),
                            timeout: limit,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_urls_require_https_and_known_host() {
        assert!(ensure_trusted_https_url(FFMPEG_LINUX_URL).is_ok());
        assert!(ensure_trusted_https_url(FFMPEG_WINDOWS_URL).is_ok());
        assert!(ensure_trusted_https_url("https://cdn.evermeet.cx/ffmpeg/7z").is_ok());
        assert!(ensure_trusted_https_url("http://evermeet.cx/ffmpeg/getrelease/7z").is_err());
        assert!(ensure_trusted_https_url("https://user:pw@gyan.dev/ffmpeg.zip").is_err());
        assert!(ensure_trusted_https_url("https://gyan.dev:8443/ffmpeg.zip").is_err());
        assert!(ensure_trusted_https_url("https://evil.example/ffmpeg.zip").is_err());
    }

    #[test]
    fn config_paths_follow_binary_and_archive_kind() {
        let mut config = PipelineConfig::new("/res", "/tmp");
        config.archive_source = ArchiveSource::new(FFMPEG_LINUX_URL, ArchiveKind::TarXz);
        assert_eq!(
            config.archive_download_path(),
            PathBuf::from("/res").join("ffmpeg_download.xz")
        );
        assert_eq!(
            config.resource_binary_path(),
            PathBuf::from("/res").join(platform_bin("ffmpeg"))
        );
        assert_eq!(config.size_probe_policy, SizeProbePolicy::Permissive);
    }

    #[test]
    fn relative_dirs_resolve_against_working_directory() {
        let cwd = std::env::current_dir().unwrap();
        let mut config = PipelineConfig::new("resources", "scratch");
        config.resolve_relative_dirs().unwrap();
        assert_eq!(config.resource_dir, cwd.join("resources"));
        assert_eq!(config.temp_root, cwd.join("scratch"));
        assert!(config.archive_download_path().is_absolute());

        let mut pinned = PipelineConfig::new("/res", "/tmp");
        pinned.resolve_relative_dirs().unwrap();
        assert_eq!(pinned.resource_dir, PathBuf::from("/res"));
    }

    #[test]
    fn files_expected_counts_audio_as_one_file() {
        let info = MovieInfo {
            has_video: true,
            has_audio: true,
            frame_count: 240,
        };
        let job = ConversionJob::new(
            Path::new("/movies/my-clip.final.mov"),
            Path::new("/work"),
            &info,
            &Preferences::default(),
        );
        assert_eq!(job.files_expected(), 241);
        assert_eq!(
            job.image_pattern(),
            PathBuf::from("/work").join("my_clip_final-%04d.tga")
        );
        assert_eq!(job.audio_output_path(), PathBuf::from("/work").join("my_clip_final.wav"));

        let silent = ConversionJob {
            has_audio: false,
            ..job
        };
        assert_eq!(silent.files_expected(), 240);
    }

    #[test]
    fn unresolved_binary_is_not_executable() {
        let binary = ExternalBinary::missing("ffmpeg");
        assert!(!binary.is_verified());
        assert!(matches!(
            binary.executable(),
            Err(PipelineError::BinaryNotFound(name)) if name == "ffmpeg"
        ));
    }

    #[test]
    fn checksum_mismatch_is_a_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        fs::write(&path, b"abc").unwrap();
        let digest = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_download_checksum(&path, digest).is_ok());
        assert!(verify_download_checksum(&path, &digest.to_uppercase()).is_ok());
        let wrong = "0".repeat(64);
        assert!(matches!(
            verify_download_checksum(&path, &wrong),
            Err(PipelineError::DownloadFailed(_))
        ));
        assert!(verify_download_checksum(&path, "not-a-digest").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn run_to_completion_collects_both_streams() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo out; echo err 1>&2");
        let output = run_to_completion(
            "sh",
            command,
            Some(Duration::from_secs(10)),
            Duration::from_millis(10),
            None,
        )
        .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr_tail(4), "err");
    }

    #[cfg(unix)]
    #[test]
    fn run_to_completion_times_out_and_kills() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 5");
        let started = Instant::now();
        let result = run_to_completion(
            "sleep",
            command,
            Some(Duration::from_millis(100)),
            Duration::from_millis(10),
            None,
        );
        assert!(matches!(result, Err(PipelineError::ProcessTimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn run_to_completion_honours_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 5");
        let result = run_to_completion("sleep", command, None, Duration::from_millis(10), Some(&token));
        assert!(matches!(result, Err(PipelineError::UserCancelled)));
    }

    #[cfg(unix)]
    #[test]
    fn kill_does_not_wait_for_forked_helpers() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 4; echo done");
        let started = Instant::now();
        let result = run_to_completion(
            "sh",
            command,
            None,
            Duration::from_millis(10),
            Some(&token),
        );
        canceller.join().unwrap();
        assert!(matches!(result, Err(PipelineError::UserCancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn missing_program_fails_to_start() {
        let command = Command::new("/definitely/not/a/real/program");
        let result = run_to_completion("ghost", command, None, Duration::from_millis(10), None);
        assert!(matches!(result, Err(PipelineError::ProcessFailedToStart { .. })));
    }
}
