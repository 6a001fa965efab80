// Conversion binary lookup, executable-bit repair, self-check and helper tool resolution.
use super::*;
use which::which;

const HELPER_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn locate(binary_name: &str, extra_search_dirs: &[PathBuf]) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH");
    locate_in(binary_name, extra_search_dirs, path_var.as_deref())
}

// Extra dirs first, then the entries of `path_var` in declared order.
pub(super) fn locate_in(
    binary_name: &str,
    extra_search_dirs: &[PathBuf],
    path_var: Option<&OsStr>,
) -> Option<PathBuf> {
    let search_path: Vec<PathBuf> = path_var
        .map(|value| std::env::split_paths(value).collect())
        .unwrap_or_default();
    let found = extra_search_dirs
        .iter()
        .chain(search_path.iter())
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(binary_name))
        .find(|candidate| candidate.is_file());
    match &found {
        Some(path) => debug!("Located {binary_name} at {}", path.display()),
        None => debug!("{binary_name} not found in search path"),
    }
    found
}

#[cfg(unix)]
fn is_marked_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(unix)]
pub fn ensure_executable(path: &Path, start_timeout: Duration) -> bool {
    ensure_executable_with(path, start_timeout, Path::new("chmod"))
}

#[cfg(unix)]
pub(super) fn ensure_executable_with(path: &Path, start_timeout: Duration, chmod: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    if is_marked_executable(path) {
        return true;
    }

    let mut command = hidden_command(chmod);
    command.arg("+x").arg(path);
    match run_to_completion(
        "chmod",
        command,
        Some(start_timeout),
        HELPER_POLL_INTERVAL,
        None,
    ) {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            warn!(
                "chmod +x {} failed: {}",
                path.display(),
                output.stderr_tail(2)
            );
            return false;
        }
        Err(error) => {
            warn!("chmod +x {} failed: {error}", path.display());
            return false;
        }
    }
    is_marked_executable(path)
}

#[cfg(not(unix))]
pub fn ensure_executable(path: &Path, _start_timeout: Duration) -> bool {
    path.is_file()
}

pub(super) fn run_version(
    binary: &Path,
    arg: &str,
    timeout: Duration,
) -> PipelineResult<Option<String>> {
    let mut command = hidden_command(binary);
    command.arg(arg);
    let output = run_to_completion(
        &binary.to_string_lossy(),
        command,
        Some(timeout),
        HELPER_POLL_INTERVAL,
        None,
    )?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(output
        .stdout
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string()))
}

pub(super) fn verify_binary(
    name: &str,
    path: &Path,
    config: &PipelineConfig,
) -> PipelineResult<ExternalBinary> {
    if !path.is_file() {
        return Err(PipelineError::BinaryNotFound(name.to_string()));
    }
    if !ensure_executable(path, config.start_timeout) {
        return Err(PipelineError::BinaryNotExecutable(path.to_path_buf()));
    }
    match run_version(path, "-version", config.self_check_timeout)? {
        Some(version) => {
            info!("Using {name} at {} ({version})", path.display());
            Ok(ExternalBinary::verified(name, path.to_path_buf()))
        }
        None => {
            warn!("{} did not answer -version", path.display());
            Err(PipelineError::BinaryNotExecutable(path.to_path_buf()))
        }
    }
}

// Helper tools (curl, tar, 7za) may ship next to the binary or with the host.
pub(super) fn locate_helper_tool(name: &str, config: &PipelineConfig) -> Option<PathBuf> {
    let executable = platform_bin(name);
    locate_in(&executable, &config.search_dirs(), None).or_else(|| which(name).ok())
}

pub(super) fn resolve_conversion_binary(config: &PipelineConfig) -> Option<(PathBuf, String)> {
    let executable = config.binary_file_name();
    if let Some(path) = locate_in(&executable, &[config.resource_dir.clone()], None) {
        return Some((path, "resource".to_string()));
    }
    if let Some(path) = locate_in(&executable, &config.extra_search_dirs, None) {
        return Some((path, "bundled".to_string()));
    }
    locate(&executable, &[]).map(|path| (path, "system".to_string()))
}

pub(super) fn inspect_tool(
    path_with_source: Option<(PathBuf, String)>,
    name: &str,
    version_arg: &str,
    timeout: Duration,
) -> ToolStatus {
    match path_with_source {
        Some((path, source)) => {
            let (version, message) = match run_version(&path, version_arg, timeout) {
                Ok(Some(version)) => (Some(version), None),
                Ok(None) => (None, Some("Version check failed.".to_string())),
                Err(error) => (None, Some(error.to_string())),
            };
            ToolStatus {
                name: name.to_string(),
                available: version.is_some(),
                source,
                path: Some(path.to_string_lossy().to_string()),
                version,
                message,
            }
        }
        None => ToolStatus {
            name: name.to_string(),
            available: false,
            source: "missing".to_string(),
            path: None,
            version: None,
            message: Some("Tool not found.".to_string()),
        },
    }
}
