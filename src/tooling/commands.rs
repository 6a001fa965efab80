// Public pipeline entry points exported to hosts and the command-line front end.
use super::*;

pub trait ImportCollaborator {
    fn import(&self, handoff: &ImportHandoff) -> PipelineResult<()>;
}

impl<F> ImportCollaborator for F
where
    F: Fn(&ImportHandoff) -> PipelineResult<()>,
{
    fn import(&self, handoff: &ImportHandoff) -> PipelineResult<()> {
        self(handoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub movie: MovieInfo,
    pub frames_imported: usize,
    pub audio_imported: bool,
    pub workspace_cleaned: bool,
    pub leftover_workspace: Option<PathBuf>,
}

pub fn acquire_conversion_binary(
    config: &PipelineConfig,
    consent: &dyn DownloadConsent,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> PipelineResult<ExternalBinary> {
    let backend = SubprocessArchiveBackend::new(config);
    BinaryAcquirer::new(config, &backend).acquire(consent, sink, cancel)
}

pub fn inspect_conversion_binary(config: &PipelineConfig) -> ToolStatus {
    inspect_tool(
        resolve_conversion_binary(config),
        &config.binary_name,
        "-version",
        config.self_check_timeout,
    )
}

pub fn import_movie(
    config: &PipelineConfig,
    movie: &Path,
    preferences: &Preferences,
    consent: &dyn DownloadConsent,
    collaborator: &dyn ImportCollaborator,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> PipelineResult<ImportReport> {
    let binary = acquire_conversion_binary(config, consent, sink, cancel)?;
    import_movie_with_binary(&binary, config, movie, preferences, collaborator, sink, cancel)
}

pub fn import_movie_with_binary(
    binary: &ExternalBinary,
    config: &PipelineConfig,
    movie: &Path,
    preferences: &Preferences,
    collaborator: &dyn ImportCollaborator,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> PipelineResult<ImportReport> {
    let movie_path = absolute_movie_path(movie)?;
    let workspace = Workspace::create(&config.temp_root)?;
    let result = run_import(
        binary,
        config,
        &movie_path,
        preferences,
        workspace.path(),
        collaborator,
        sink,
        cancel,
    );

    emit_stage(sink, Stage::Cleanup, "Removing temporary files");
    let cleanup = workspace.teardown();
    match result {
        Ok(mut report) => {
            match cleanup {
                Ok(()) => report.workspace_cleaned = true,
                Err(PipelineError::WorkspaceCleanupFailed { path, .. }) => {
                    report.leftover_workspace = Some(path);
                }
                Err(error) => error!("Workspace cleanup failed: {error}"),
            }
            Ok(report)
        }
        Err(error) => {
            if let Err(cleanup_error) = cleanup {
                error!("Workspace cleanup after failed import also failed: {cleanup_error}");
            }
            if error.is_cancelled() {
                info!("Import of {} cancelled", movie_path.display());
            } else {
                error!("Import of {} failed: {error}", movie_path.display());
            }
            Err(error)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_import(
    binary: &ExternalBinary,
    config: &PipelineConfig,
    movie_path: &Path,
    preferences: &Preferences,
    work_dir: &Path,
    collaborator: &dyn ImportCollaborator,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> PipelineResult<ImportReport> {
    let info = probe_movie(binary, movie_path, config, sink, cancel)?;
    let job = ConversionJob::new(movie_path, work_dir, &info, preferences);
    debug!(
        "Converting into {} expecting {} files",
        work_dir.display(),
        job.files_expected()
    );

    convert_movie(binary, &job, config, sink, cancel)?.into_result()?;
    if cancel.is_cancelled() {
        return Err(PipelineError::UserCancelled);
    }

    let handoff = ImportHandoff::from_workspace(&job)?;
    emit_stage_with_detail(
        sink,
        Stage::Importing,
        "Importing converted files",
        Some(format!(
            "{} images{}",
            handoff.images.len(),
            if handoff.audio.is_some() { ", 1 audio" } else { "" }
        )),
    );
    collaborator.import(&handoff)?;

    Ok(ImportReport {
        movie: info,
        frames_imported: handoff.images.len(),
        audio_imported: handoff.audio.is_some(),
        workspace_cleaned: false,
        leftover_workspace: None,
    })
}

pub fn default_preferences_file() -> Option<PathBuf> {
    default_preferences_path()
}

pub fn load_preferences(path: &Path) -> PipelineResult<Preferences> {
    load_preferences_from(path)
}

pub fn save_preferences(path: &Path, preferences: &Preferences) -> PipelineResult<()> {
    save_preferences_to(path, preferences)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn fake_ffmpeg(dir: &Path) -> ExternalBinary {
        let script = r#"if [ "$8" = "null" ]; then
  echo "  Stream #0:0: Video: h264, yuv420p, 320x240, 24 fps" >&2
  echo "  Stream #0:1: Audio: aac, 48000 Hz, stereo" >&2
  echo "frame=    3 fps=0.0 q=-1.0 Lsize=N/A" >&2
  exit 0
fi
out="$4"
case "$out" in
  *%04d*) for i in 1 2 3; do : > "$(printf "$out" $i)"; done ;;
  *) : > "$out" ;;
esac"#;
        let path = test_support::write_script(dir, "ffmpeg", script);
        ExternalBinary::verified("ffmpeg", path)
    }

    #[test]
    fn import_hands_off_files_before_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let movie = dir.path().join("clip.mov");
        fs::write(&movie, b"movie").unwrap();
        let binary = fake_ffmpeg(dir.path());
        let config = PipelineConfig::new(dir.path().join("res"), dir.path().join("tmp"));
        let seen = RefCell::new(None);
        let collaborator = |handoff: &ImportHandoff| -> PipelineResult<()> {
            assert!(handoff.images.iter().all(|image| image.is_file()));
            *seen.borrow_mut() = Some(handoff.clone());
            Ok(())
        };

        let report = import_movie_with_binary(
            &binary,
            &config,
            &movie,
            &Preferences::default(),
            &collaborator,
            &LogProgressSink,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(report.frames_imported, 3);
        assert!(report.audio_imported);
        assert!(report.workspace_cleaned);
        let handoff = seen.into_inner().unwrap();
        assert_eq!(handoff.images.len(), 3);
        assert!(handoff.joined_image_list().ends_with("clip-0003.tga"));
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn collaborator_failure_still_tears_down_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let movie = dir.path().join("clip.mov");
        fs::write(&movie, b"movie").unwrap();
        let binary = fake_ffmpeg(dir.path());
        let config = PipelineConfig::new(dir.path().join("res"), dir.path().join("tmp"));
        let collaborator = |_: &ImportHandoff| -> PipelineResult<()> {
            Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "host refused the import",
            )))
        };

        let result = import_movie_with_binary(
            &binary,
            &config,
            &movie,
            &Preferences::default(),
            &collaborator,
            &LogProgressSink,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(PipelineError::Io(_))));
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn missing_movie_fails_before_workspace_creation() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_ffmpeg(dir.path());
        let config = PipelineConfig::new(dir.path().join("res"), dir.path().join("tmp"));
        let collaborator = |_: &ImportHandoff| -> PipelineResult<()> { Ok(()) };

        let result = import_movie_with_binary(
            &binary,
            &config,
            &dir.path().join("absent.mov"),
            &Preferences::default(),
            &collaborator,
            &LogProgressSink,
            &CancellationToken::new(),
        );
        assert!(result.is_err());
        assert!(!dir.path().join("tmp").exists());
    }
}
