use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, PipelineResult};

mod archive;
mod commands;
mod conversion;
mod install;
mod locator;
mod media_io;
mod preferences;
mod runtime;
mod workspace;

use archive::*;
use conversion::*;
use install::*;
use locator::*;
use media_io::*;
use preferences::*;
use runtime::*;
use workspace::*;

pub use archive::{ArchiveBackend, FetchOutcome, SubprocessArchiveBackend};
pub use commands::*;
pub use conversion::{convert_movie, ConversionOutcome};
pub use install::{AcquireState, BinaryAcquirer, DownloadConsent};
pub use locator::{ensure_executable, locate};
pub use media_io::{probe_movie, ImportHandoff};
pub use preferences::{AudioExtension, ImageExtension, Preferences};
pub use runtime::{
    ArchiveKind, ArchiveSource, CancellationToken, ConversionJob, ConversionProgress,
    DownloadTask, ExternalBinary, LogProgressSink, MovieInfo, PipelineConfig, PipelineEvent,
    ProgressSink, SizeProbePolicy, Stage, ToolStatus,
};
pub use workspace::Workspace;
