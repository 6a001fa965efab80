// Persisted output-format preferences and last-used import directory.
use super::*;

pub(super) const PREFERENCES_FILE_NAME: &str = "movie-import-preferences.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageExtension {
    Jpeg,
    Png,
    #[default]
    Tga,
}

impl ImageExtension {
    pub const ALL: [ImageExtension; 3] = [
        ImageExtension::Jpeg,
        ImageExtension::Png,
        ImageExtension::Tga,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ImageExtension::Jpeg => "jpeg",
            ImageExtension::Png => "png",
            ImageExtension::Tga => "tga",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().trim_start_matches('.').to_lowercase();
        match normalized.as_str() {
            "jpeg" | "jpg" => Some(ImageExtension::Jpeg),
            "png" => Some(ImageExtension::Png),
            "tga" => Some(ImageExtension::Tga),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioExtension {
    Mp3,
    #[default]
    Wav,
}

impl AudioExtension {
    pub const ALL: [AudioExtension; 2] = [AudioExtension::Mp3, AudioExtension::Wav];

    pub fn extension(&self) -> &'static str {
        match self {
            AudioExtension::Mp3 => "mp3",
            AudioExtension::Wav => "wav",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().trim_start_matches('.').to_lowercase();
        match normalized.as_str() {
            "mp3" => Some(AudioExtension::Mp3),
            "wav" => Some(AudioExtension::Wav),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub image_extension: ImageExtension,
    pub audio_extension: AudioExtension,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_import_directory: Option<String>,
}

// Wire shape before normalization; unknown values fall back field by field.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredPreferences {
    image_extension: Option<String>,
    audio_extension: Option<String>,
    last_import_directory: Option<String>,
}

pub(super) fn sanitize_optional_path(value: Option<String>) -> Option<String> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 512 || trimmed.chars().any(|ch| ch.is_control()) {
        return None;
    }
    Some(trimmed.to_string())
}

fn normalize_preferences(stored: StoredPreferences) -> Preferences {
    let image_extension = stored
        .image_extension
        .as_deref()
        .and_then(ImageExtension::parse)
        .unwrap_or_default();
    let audio_extension = stored
        .audio_extension
        .as_deref()
        .and_then(AudioExtension::parse)
        .unwrap_or_default();
    Preferences {
        image_extension,
        audio_extension,
        last_import_directory: sanitize_optional_path(stored.last_import_directory),
    }
}

impl Preferences {
    pub fn from_blob(blob: &str) -> Self {
        if blob.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<StoredPreferences>(blob) {
            Ok(stored) => normalize_preferences(stored),
            Err(error) => {
                warn!("Ignoring malformed preferences: {error}");
                Self::default()
            }
        }
    }

    pub fn to_blob(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn remember_import_directory(&mut self, movie: &Path) {
        let parent = movie
            .parent()
            .map(|dir| dir.to_string_lossy().to_string());
        if let Some(dir) = sanitize_optional_path(parent) {
            self.last_import_directory = Some(dir);
        }
    }

    pub fn last_import_dir_or_home(&self) -> Option<PathBuf> {
        self.last_import_directory
            .as_ref()
            .map(PathBuf::from)
            .filter(|path| path.is_dir())
            .or_else(dirs::home_dir)
    }
}

pub(super) fn default_preferences_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .map(|dir| dir.join(RESOURCE_FOLDER_NAME).join(PREFERENCES_FILE_NAME))
}

pub(super) fn load_preferences_from(path: &Path) -> PipelineResult<Preferences> {
    if !path.exists() {
        return Ok(Preferences::default());
    }
    let raw = fs::read_to_string(path)?;
    Ok(Preferences::from_blob(&raw))
}

pub(super) fn save_preferences_to(path: &Path, preferences: &Preferences) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(preferences)?;
    fs::write(path, payload)?;
    debug!("Saved preferences to {}", path.display());
    Ok(())
}
