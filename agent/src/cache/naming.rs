//! Local filenames for media assets
//!
//! A cached file is named `{mediaId}{extension}`. The extension is the only
//! part that needs deriving: videos use a fixed table keyed on the content
//! type, everything else takes the suffix of the asset URL and falls back to
//! a MIME lookup.

use url::Url;

use crate::models::group::MediaAsset;

/// Extension used when nothing better is known
const FALLBACK_EXTENSION: &str = ".jpg";

fn video_extension(content_type: &str) -> &'static str {
    match content_type {
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        _ => ".mp4",
    }
}

/// Preferred extension for a MIME type
pub fn mime_extension(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    let extension = match essence.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "image/bmp" => ".bmp",
        "image/avif" => ".avif",
        "image/tiff" => ".tif",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        _ => return None,
    };
    Some(extension)
}

/// Suffix of the last path segment of `url`, query and fragment excluded
pub fn url_extension(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let file_name = path.rsplit('/').next().unwrap_or_default();
    let stem_len = file_name.trim_start_matches('.').len();
    let dot = file_name.rfind('.')?;
    // a leading dot names a hidden file, not an extension
    if dot < file_name.len() - stem_len {
        return None;
    }

    let extension = &file_name[dot + 1..];
    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", extension.to_ascii_lowercase()))
}

/// Extension of the cached file backing `asset`
pub fn derive_extension(asset: &MediaAsset) -> String {
    let content_type = asset.content_type();
    if asset.is_video() {
        return video_extension(content_type).to_string();
    }

    let extension = url_extension(&asset.url)
        .filter(|ext| ext != ".jpe")
        .or_else(|| mime_extension(content_type).map(str::to_string))
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());

    if extension == ".jpe" {
        FALLBACK_EXTENSION.to_string()
    } else {
        extension
    }
}

/// Name of the cached file backing `asset`
pub fn derive_filename(asset: &MediaAsset) -> String {
    format!("{}{}", asset.id, derive_extension(asset))
}

/// Whether `name` stays inside the flat cache directory
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}
