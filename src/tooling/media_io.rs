// Movie probing through the null muxer, output naming and workspace output listing.
use super::*;
use regex::Regex;

const FRAME_PATTERN: &str = r"frame=\s*(\d+)\s*fps=";
const AUDIO_STREAM_PATTERN: &str = r"Stream #\d+:\d+(?:\[0x[0-9a-fA-F]+\])?(?:\([^)]*\))?: Audio";
const VIDEO_STREAM_PATTERN: &str = r"Stream #\d+:\d+(?:\[0x[0-9a-fA-F]+\])?(?:\([^)]*\))?: Video";

pub(super) fn absolute_movie_path(movie: &Path) -> PipelineResult<PathBuf> {
    let path = absolute_path(movie)?;
    if !path.is_file() {
        return Err(PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Movie not found: {}", path.display()),
        )));
    }
    Ok(path)
}

pub fn probe_movie(
    binary: &ExternalBinary,
    movie: &Path,
    config: &PipelineConfig,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> PipelineResult<MovieInfo> {
    let executable = binary.executable()?;
    let movie_path = absolute_movie_path(movie)?;
    emit_stage_with_detail(
        sink,
        Stage::Probing,
        "Determining movie frame count",
        Some(movie_path.display().to_string()),
    );

    let mut command = hidden_command(executable);
    command
        .arg("-i")
        .arg(&movie_path)
        .args(["-map", "0:v:0", "-c", "copy", "-f", "null", "-"]);
    let output = run_to_completion(
        binary.name(),
        command,
        Some(config.probe_timeout),
        config.poll_interval,
        Some(cancel),
    )?;
    if !output.status.success() {
        warn!(
            "Probe of {} exited with {}: {}",
            movie_path.display(),
            output.status,
            output.stderr_tail(2)
        );
    }

    let diagnostics = format!("{}\n{}", output.stderr, output.stdout);
    let info = parse_probe_output(&diagnostics, &movie_path)?;
    info!(
        "Probed {}: video={} audio={} frames={}",
        movie_path.display(),
        info.has_video,
        info.has_audio,
        info.frame_count
    );
    Ok(info)
}

pub(super) fn parse_probe_output(diagnostics: &str, movie: &Path) -> PipelineResult<MovieInfo> {
    let compile = |pattern: &str| {
        Regex::new(pattern).map_err(|error| {
            error!("Invalid probe pattern {pattern}: {error}");
            PipelineError::ProbeParseFailed(movie.to_path_buf())
        })
    };
    let frame_re = compile(FRAME_PATTERN)?;
    let audio_re = compile(AUDIO_STREAM_PATTERN)?;
    let video_re = compile(VIDEO_STREAM_PATTERN)?;

    // Progress lines repeat; the last one carries the total.
    let frame_count = frame_re
        .captures_iter(diagnostics)
        .filter_map(|captures| captures.get(1))
        .filter_map(|count| count.as_str().parse::<u64>().ok())
        .last()
        .ok_or_else(|| PipelineError::ProbeParseFailed(movie.to_path_buf()))?;

    Ok(MovieInfo {
        has_video: video_re.is_match(diagnostics),
        has_audio: audio_re.is_match(diagnostics),
        frame_count,
    })
}

pub(super) fn output_stem_for(movie: &Path) -> String {
    let stem = movie
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    let normalized: String = stem
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if normalized.trim_matches('_').is_empty() {
        "movie".to_string()
    } else {
        normalized
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(&ext)))
}

pub(super) fn list_output_files(dir: &Path, extensions: &[&str]) -> PipelineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if has_extension(&path, extensions) {
            files.push(path);
        }
    }
    Ok(files)
}

pub(super) fn count_output_files(dir: &Path, extensions: &[&str]) -> PipelineResult<usize> {
    Ok(list_output_files(dir, extensions)?.len())
}

// Numbered frames sort by their number so -10000 follows -9999.
fn frame_sort_key(path: &Path) -> (Option<u64>, String) {
    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    let number = stem
        .rsplit_once('-')
        .and_then(|(_, digits)| digits.parse::<u64>().ok());
    (number, stem)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportHandoff {
    pub images: Vec<PathBuf>,
    pub audio: Option<PathBuf>,
}

impl ImportHandoff {
    pub fn from_workspace(job: &ConversionJob) -> PipelineResult<Self> {
        let mut images = if job.has_video {
            list_output_files(&job.work_dir, &[job.image_ext.as_str()])?
        } else {
            Vec::new()
        };
        images.sort_by_key(|path| frame_sort_key(path));

        let audio_path = job.audio_output_path();
        let audio = (job.has_audio && audio_path.is_file()).then_some(audio_path);
        Ok(Self { images, audio })
    }

    pub fn joined_image_list(&self) -> String {
        self.images
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.audio.is_none()
    }
}
