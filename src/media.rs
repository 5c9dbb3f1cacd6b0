use mime_guess::mime;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Upload type resolved from the declared filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub extension: String,
    pub mime: String,
    pub kind: MediaKind,
}

/// Lower-cased extension after the last dot, empty when there is none
pub fn file_extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Classify `filename` against the allow-list. Only extensions whose MIME type
/// is an image or a video are accepted.
pub fn classify(filename: &str, allowed: &[String]) -> Option<MediaType> {
    let extension = file_extension(filename);
    if extension.is_empty()
        || !allowed
            .iter()
            .any(|a| a.trim().trim_start_matches('.').eq_ignore_ascii_case(&extension))
    {
        return None;
    }

    let guessed = mime_guess::from_ext(&extension).first()?;
    let kind = if guessed.type_() == mime::IMAGE {
        MediaKind::Image
    } else if guessed.type_() == mime::VIDEO {
        MediaKind::Video
    } else {
        return None;
    };

    Some(MediaType {
        extension,
        mime: guessed.essence_str().to_string(),
        kind,
    })
}

/// Strip directory components and replace anything outside `[A-Za-z0-9._-]`
pub fn sanitize_filename(filename: &str) -> String {
    let base = Path::new(&filename.replace('\\', "/"))
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
