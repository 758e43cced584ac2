pub fn extension_from_mime(mime: &str) -> &str {
    match mime {
        // Images
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",

        // Audio
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        "audio/webm" => "weba",
        "audio/aac" => "aac",
        "audio/flac" => "flac",
        "audio/mp4" => "m4a",

        // Video
        "video/mp4" => "mp4",
        "video/webm" => "webm",

        // Documents
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",

        // Code / text
        "application/json" => "json",
        "text/plain" => "txt",
        "text/html" => "html",
        "application/xml" | "text/xml" => "xml",
        "text/csv" => "csv",
        "text/markdown" => "md",
        "application/x-yaml" | "text/yaml" => "yaml",

        // Default
        _ => "bin",
    }
}

/// Reverse of [`extension_from_mime`], used to sniff uploads and URLs.
pub fn mime_from_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "weba" => "audio/webm",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "json" => "application/json",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "yaml" | "yml" => "application/x-yaml",
        _ => return None,
    };
    Some(mime)
}

/// Guess a MIME type from the last path segment of a path or URL.
pub fn mime_from_path(path: &str) -> Option<&'static str> {
    let without_query = path.split(['?', '#']).next().unwrap_or(path);
    let last = without_query.rsplit('/').next().unwrap_or(without_query);
    let (_, ext) = last.rsplit_once('.')?;
    mime_from_extension(ext)
}

/// Shorten long values for logs and trace entries.
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
