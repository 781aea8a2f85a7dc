//! Media type guessing for shared files

use std::path::Path;

const FALLBACK: &str = "application/octet-stream";

/// Known extension and media type pairs; the first extension listed for a
/// type is the one used when naming files of that type
const TABLE: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("ogg", "audio/ogg"),
    ("oga", "audio/ogg"),
    ("opus", "audio/opus"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("flac", "audio/flac"),
    ("m4a", "audio/mp4"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("json", "application/json"),
];

/// Media type for a file name, from its extension
pub fn from_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            TABLE
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(ext))
                .map(|(_, media_type)| *media_type)
        })
        .unwrap_or(FALLBACK)
}

/// Preferred file extension for a media type
pub fn extension_for(media_type: &str) -> &'static str {
    let essence = media_type.split(';').next().unwrap_or_default().trim();
    TABLE
        .iter()
        .find(|(_, known)| known.eq_ignore_ascii_case(essence))
        .map_or("bin", |(ext, _)| *ext)
}

pub fn is_image(media_type: &str) -> bool {
    media_type.starts_with("image/")
}
