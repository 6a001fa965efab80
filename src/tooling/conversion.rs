// Runs the video and audio conversions while polling the workspace for progress.
use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionOutcome {
    Completed(ConversionProgress),
    Cancelled(ConversionProgress),
    Incomplete(ConversionProgress),
}

impl ConversionOutcome {
    pub fn progress(&self) -> ConversionProgress {
        match self {
            ConversionOutcome::Completed(progress)
            | ConversionOutcome::Cancelled(progress)
            | ConversionOutcome::Incomplete(progress) => *progress,
        }
    }

    pub fn into_result(self) -> PipelineResult<ConversionProgress> {
        match self {
            ConversionOutcome::Completed(progress) => Ok(progress),
            ConversionOutcome::Cancelled(_) => Err(PipelineError::UserCancelled),
            ConversionOutcome::Incomplete(progress) => Err(PipelineError::PartialConversion {
                written: progress.files_written,
                expected: progress.files_expected,
            }),
        }
    }
}

// Samples never move backwards; a failed listing keeps the previous value.
struct ProgressPoller<'a> {
    job: &'a ConversionJob,
    current: ConversionProgress,
}

impl<'a> ProgressPoller<'a> {
    fn new(job: &'a ConversionJob) -> Self {
        Self {
            job,
            current: ConversionProgress {
                files_written: 0,
                files_expected: job.files_expected(),
                cancelled: false,
            },
        }
    }

    fn sample(&mut self) -> Option<ConversionProgress> {
        let counted = match count_output_files(&self.job.work_dir, &self.job.output_extensions()) {
            Ok(counted) => counted,
            Err(error) => {
                warn!("Progress listing failed: {error}");
                return None;
            }
        };
        if counted <= self.current.files_written {
            return None;
        }
        self.current.files_written = counted;
        Some(self.current)
    }

    fn cancelled(&mut self) -> ConversionProgress {
        self.current.cancelled = true;
        self.current
    }

    fn recount(&mut self) -> PipelineResult<ConversionProgress> {
        self.current.files_written =
            count_output_files(&self.job.work_dir, &self.job.output_extensions())?;
        Ok(self.current)
    }
}

fn conversion_phases(job: &ConversionJob) -> Vec<(Stage, &'static str, PathBuf)> {
    let mut phases = Vec::new();
    if job.has_video {
        phases.push((Stage::ConvertingVideo, "Converting video", job.image_pattern()));
    }
    if job.has_audio {
        phases.push((Stage::ConvertingAudio, "Converting audio", job.audio_output_path()));
    }
    phases
}

pub fn convert_movie(
    binary: &ExternalBinary,
    job: &ConversionJob,
    config: &PipelineConfig,
    sink: &dyn ProgressSink,
    cancel: &CancellationToken,
) -> PipelineResult<ConversionOutcome> {
    let executable = binary.executable()?;
    fs::create_dir_all(&job.work_dir)?;
    let mut poller = ProgressPoller::new(job);

    for (stage, message, output_path) in conversion_phases(job) {
        if cancel.is_cancelled() {
            let progress = poller.cancelled();
            sink.emit(PipelineEvent::Conversion(progress));
            return Ok(ConversionOutcome::Cancelled(progress));
        }
        emit_stage_with_detail(
            sink,
            stage,
            message,
            Some(output_path.display().to_string()),
        );

        let mut command = hidden_command(executable);
        command
            .arg("-y")
            .arg("-i")
            .arg(&job.input_movie_path)
            .arg(&output_path);
        let mut process = RunningProcess::spawn(binary.name(), command)?;
        loop {
            if cancel.is_cancelled() {
                process.kill();
                let progress = poller.cancelled();
                sink.emit(PipelineEvent::Conversion(progress));
                info!(
                    "Conversion cancelled at {}/{} files",
                    progress.files_written, progress.files_expected
                );
                return Ok(ConversionOutcome::Cancelled(progress));
            }

            let event = process.next_event(config.poll_interval)?;
            if let Some(progress) = poller.sample() {
                sink.emit(PipelineEvent::Conversion(progress));
            }
            if let ProcessEvent::Exited(status) = event {
                let output = process.finish(status);
                if !status.success() {
                    warn!(
                        "{message} exited with {status}: {}",
                        output.stderr_tail(3)
                    );
                }
                break;
            }
        }
    }

    if cancel.is_cancelled() {
        let progress = poller.cancelled();
        sink.emit(PipelineEvent::Conversion(progress));
        return Ok(ConversionOutcome::Cancelled(progress));
    }

    let progress = poller.recount()?;
    sink.emit(PipelineEvent::Conversion(progress));
    if progress.files_written < progress.files_expected {
        warn!(
            "Conversion incomplete: {}/{} files written",
            progress.files_written, progress.files_expected
        );
        return Ok(ConversionOutcome::Incomplete(progress));
    }
    if progress.files_written > progress.files_expected {
        debug!(
            "Conversion wrote {} files, probe announced {}",
            progress.files_written, progress.files_expected
        );
    }
    info!("Conversion finished with {} files", progress.files_written);
    Ok(ConversionOutcome::Completed(progress))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_pipeline_errors() {
        let progress = ConversionProgress {
            files_written: 3,
            files_expected: 5,
            cancelled: false,
        };
        assert_eq!(
            ConversionOutcome::Completed(progress).into_result().unwrap(),
            progress
        );
        assert!(matches!(
            ConversionOutcome::Cancelled(progress).into_result(),
            Err(PipelineError::UserCancelled)
        ));
        assert!(matches!(
            ConversionOutcome::Incomplete(progress).into_result(),
            Err(PipelineError::PartialConversion {
                written: 3,
                expected: 5
            })
        ));
    }

    #[test]
    fn progress_ratio_is_clamped() {
        let over = ConversionProgress {
            files_written: 12,
            files_expected: 10,
            cancelled: false,
        };
        assert_eq!(over.ratio(), Some(1.0));
        assert_eq!(ConversionProgress::default().ratio(), None);
    }

    #[cfg(unix)]
    mod with_fake_binary {
        use super::*;

        // Writes `frames` numbered images for the pattern output, one empty file otherwise.
        fn fake_converter(dir: &Path, frames: usize, frame_delay: &str, tail: &str) -> ExternalBinary {
            let log = dir.join("phases.log");
            let script = format!(
                r#"out="$4"
echo "start $out" >> '{log}'
case "$out" in
  *%04d*)
    i=1
    while [ $i -le {frames} ]; do
      f=$(printf "$out" $i)
      : > "$f"
      sleep {frame_delay}
      i=$((i+1))
    done
    {tail}
    ;;
  *)
    : > "$out"
    ;;
esac
echo "end $out" >> '{log}'"#,
                log = log.display(),
            );
            let path = test_support::write_script(dir, "ffmpeg", &script);
            ExternalBinary::verified("ffmpeg", path)
        }

        fn job(dir: &Path, frames: u64, has_audio: bool) -> ConversionJob {
            let movie = dir.join("clip-take.mov");
            fs::write(&movie, b"movie").unwrap();
            ConversionJob::new(
                &movie,
                &dir.join("work"),
                &MovieInfo {
                    has_video: true,
                    has_audio,
                    frame_count: frames,
                },
                &Preferences::default(),
            )
        }

        fn config(dir: &Path) -> PipelineConfig {
            let mut config = PipelineConfig::new(dir, dir);
            config.poll_interval = Duration::from_millis(5);
            config
        }

        #[test]
        fn exact_output_with_audio_completes() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_converter(dir.path(), 4, "0", "");
            let job = job(dir.path(), 4, true);

            let outcome = convert_movie(
                &binary,
                &job,
                &config(dir.path()),
                &LogProgressSink,
                &CancellationToken::new(),
            )
            .unwrap();
            assert_eq!(
                outcome,
                ConversionOutcome::Completed(ConversionProgress {
                    files_written: 5,
                    files_expected: 5,
                    cancelled: false,
                })
            );
            assert!(job.work_dir.join("clip_take-0001.tga").is_file());
            assert!(job.work_dir.join("clip_take.wav").is_file());
        }

        #[test]
        fn surplus_frames_are_tolerated() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_converter(dir.path(), 12, "0", "");
            let job = job(dir.path(), 10, false);

            let outcome = convert_movie(
                &binary,
                &job,
                &config(dir.path()),
                &LogProgressSink,
                &CancellationToken::new(),
            )
            .unwrap();
            assert!(matches!(outcome, ConversionOutcome::Completed(progress) if progress.files_written == 12));
        }

        #[test]
        fn missing_frames_are_incomplete() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_converter(dir.path(), 9, "0", "exit 1");
            let job = job(dir.path(), 10, false);

            let outcome = convert_movie(
                &binary,
                &job,
                &config(dir.path()),
                &LogProgressSink,
                &CancellationToken::new(),
            )
            .unwrap();
            assert_eq!(
                outcome,
                ConversionOutcome::Incomplete(ConversionProgress {
                    files_written: 9,
                    files_expected: 10,
                    cancelled: false,
                })
            );
        }

        #[test]
        fn progress_samples_never_decrease() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_converter(dir.path(), 15, "0.01", "");
            let job = job(dir.path(), 15, true);
            let samples = std::sync::Mutex::new(Vec::new());
            let sink = |event: PipelineEvent| {
                if let PipelineEvent::Conversion(progress) = event {
                    samples.lock().unwrap().push(progress.files_written);
                }
            };

            convert_movie(&binary, &job, &config(dir.path()), &sink, &CancellationToken::new())
                .unwrap();
            let samples = samples.into_inner().unwrap();
            assert!(samples.len() > 1);
            assert!(samples.windows(2).all(|pair| pair[0] <= pair[1]));
            assert_eq!(samples.last(), Some(&16));
        }

        #[test]
        fn video_finishes_before_audio_starts() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_converter(dir.path(), 3, "0.01", "");
            let job = job(dir.path(), 3, true);

            convert_movie(
                &binary,
                &job,
                &config(dir.path()),
                &LogProgressSink,
                &CancellationToken::new(),
            )
            .unwrap();
            let log = fs::read_to_string(dir.path().join("phases.log")).unwrap();
            let phases: Vec<&str> = log
                .lines()
                .filter_map(|line| line.split_whitespace().next())
                .collect();
            assert_eq!(phases, ["start", "end", "start", "end"]);
            assert!(log.lines().nth(1).unwrap().contains("%04d"));
            assert!(log.lines().nth(2).unwrap().ends_with(".wav"));
        }

        #[test]
        fn cancellation_kills_conversion_and_skips_audio() {
            let dir = tempfile::tempdir().unwrap();
            let binary = fake_converter(dir.path(), 2, "0", "exec sleep 10");
            let job = job(dir.path(), 50, true);
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let sink = move |event: PipelineEvent| {
                if let PipelineEvent::Conversion(progress) = event {
                    if progress.files_written >= 2 {
                        trigger.cancel();
                    }
                }
            };

            let started = Instant::now();
            let outcome =
                convert_movie(&binary, &job, &config(dir.path()), &sink, &cancel).unwrap();
            assert!(started.elapsed() < Duration::from_secs(8));
            assert!(matches!(outcome, ConversionOutcome::Cancelled(progress) if progress.cancelled));
            assert!(!job.audio_output_path().exists());
        }
    }
}
