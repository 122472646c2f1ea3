//! Relay validator: the pure gate in front of every publish.
//!
//! Takes raw archive bytes, walks the container, and either rejects on the
//! first violation or produces the normalized file set plus its canonical
//! content digest. No network or credential access happens here - the
//! validator is safe to run before any installation is resolved.
//!
//! Rule order (short-circuit):
//! 1. archive-level limits (size, entry count)
//! 2. per entry: path safety, banned/allowed format, sniffed-type match
//! 3. external resource URLs against the host allow-list
//! 4. canonical digest over the sorted file set

use std::collections::BTreeSet;
use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use zip::ZipArchive;

use pixelport_store::ContentDigest;

use crate::config::ValidationLimits;

// ---------------------------------------------------------------------------
// Verdict types
// ---------------------------------------------------------------------------

/// Which rule an archive violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayRule {
    /// The container itself could not be read.
    Container,
    /// Archive- or entry-level size/count limits.
    ArchiveLimits,
    /// Traversal, absolute, or otherwise unsafe entry path.
    EntryPath,
    /// Declared format banned or not on the allow list.
    BannedFormat,
    /// Sniffed content type contradicts the declared one.
    TypeMismatch,
    /// External resource URL pointing off the host allow-list.
    ExternalLink,
}

/// A single rule violation; validation stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayViolation {
    pub rule: RelayRule,
    /// Offending entry path, when the violation is entry-scoped.
    pub entry: Option<String>,
    /// Human-readable explanation.
    pub reason: String,
}

impl RelayViolation {
    fn archive(rule: RelayRule, reason: impl Into<String>) -> Self {
        Self {
            rule,
            entry: None,
            reason: reason.into(),
        }
    }

    fn entry(rule: RelayRule, path: &str, reason: impl Into<String>) -> Self {
        Self {
            rule,
            entry: Some(path.to_string()),
            reason: reason.into(),
        }
    }
}

/// One validated, normalized file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFile {
    /// Repository-relative path.
    pub path: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Content type declared by the file extension.
    pub declared_type: String,
    /// Content type sniffed from the leading bytes.
    pub sniffed_type: String,
    pub content: Vec<u8>,
}

/// Outcome of validating one archive. Ephemeral: owned by a single publish
/// attempt and never persisted on its own.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Normalized file set, sorted by path. Empty on rejection.
    pub files: Vec<RelayFile>,
    /// Total uncompressed bytes across the set.
    pub total_bytes: u64,
    /// Canonical digest of the file set. `None` on rejection.
    pub digest: Option<ContentDigest>,
    /// First violation found, if any.
    pub violation: Option<RelayViolation>,
}

impl ValidationResult {
    pub fn accepted(&self) -> bool {
        self.violation.is_none()
    }

    fn reject(violation: RelayViolation) -> Self {
        Self {
            files: Vec::new(),
            total_bytes: 0,
            digest: None,
            violation: Some(violation),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate an uploaded archive against the configured limits.
pub fn validate(archive_bytes: &[u8], limits: &ValidationLimits) -> ValidationResult {
    if archive_bytes.len() as u64 > limits.max_archive_bytes {
        return ValidationResult::reject(RelayViolation::archive(
            RelayRule::ArchiveLimits,
            format!(
                "archive is {} bytes, limit is {}",
                archive_bytes.len(),
                limits.max_archive_bytes
            ),
        ));
    }

    let mut archive = match ZipArchive::new(Cursor::new(archive_bytes)) {
        Ok(archive) => archive,
        Err(err) => {
            return ValidationResult::reject(RelayViolation::archive(
                RelayRule::Container,
                format!("not a readable archive: {err}"),
            ));
        }
    };

    if archive.len() > limits.max_entries {
        return ValidationResult::reject(RelayViolation::archive(
            RelayRule::ArchiveLimits,
            format!(
                "{} entries, limit is {}",
                archive.len(),
                limits.max_entries
            ),
        ));
    }

    let mut files = Vec::new();
    let mut seen_paths = BTreeSet::new();
    let mut total_bytes = 0u64;

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                return ValidationResult::reject(RelayViolation::archive(
                    RelayRule::Container,
                    format!("unreadable entry {index}: {err}"),
                ));
            }
        };
        if entry.is_dir() {
            continue;
        }

        let path = entry.name().to_string();
        if let Some(reason) = unsafe_path(&path) {
            return ValidationResult::reject(RelayViolation::entry(
                RelayRule::EntryPath,
                &path,
                reason,
            ));
        }
        if !seen_paths.insert(path.clone()) {
            return ValidationResult::reject(RelayViolation::entry(
                RelayRule::EntryPath,
                &path,
                "duplicate entry path",
            ));
        }

        // Read with a hard cap; the declared size in the central directory
        // is untrusted.
        let mut content = Vec::new();
        let read = entry
            .by_ref()
            .take(limits.max_entry_bytes + 1)
            .read_to_end(&mut content);
        if let Err(err) = read {
            return ValidationResult::reject(RelayViolation::entry(
                RelayRule::Container,
                &path,
                format!("failed to read entry: {err}"),
            ));
        }
        if content.len() as u64 > limits.max_entry_bytes {
            return ValidationResult::reject(RelayViolation::entry(
                RelayRule::ArchiveLimits,
                &path,
                format!("entry exceeds {} bytes", limits.max_entry_bytes),
            ));
        }
        total_bytes += content.len() as u64;
        if total_bytes > limits.max_total_bytes {
            return ValidationResult::reject(RelayViolation::archive(
                RelayRule::ArchiveLimits,
                format!("uncompressed size exceeds {} bytes", limits.max_total_bytes),
            ));
        }

        if let Some(violation) = check_entry_format(&path, &content, limits) {
            return ValidationResult::reject(violation);
        }

        let extension = extension_of(&path).unwrap_or_default();
        let declared_type = mime_guess::from_path(&path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();
        let sniffed_type = sniff(&content).label(&extension).to_string();

        files.push(RelayFile {
            size: content.len() as u64,
            path,
            declared_type,
            sniffed_type,
            content,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    let digest = file_set_digest(&files);

    ValidationResult {
        files,
        total_bytes,
        digest: Some(digest),
        violation: None,
    }
}

/// Canonical digest over a file set: per-file content digests folded in
/// path order, so the result is independent of archive entry order.
pub fn file_set_digest(files: &[RelayFile]) -> ContentDigest {
    let mut sorted: Vec<&RelayFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(ContentDigest::from_bytes(&file.content).as_str().as_bytes());
        hasher.update([0u8]);
    }
    ContentDigest::from_bytes(hasher.finalize().as_slice())
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

/// Reason a path is unsafe, or `None` when acceptable.
fn unsafe_path(path: &str) -> Option<&'static str> {
    if path.is_empty() {
        return Some("empty entry path");
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Some("absolute entry path");
    }
    if path.contains('\\') {
        return Some("backslash in entry path");
    }
    if path.contains('\0') {
        return Some("NUL byte in entry path");
    }
    if path.split('/').any(|component| component == "..") {
        return Some("path traversal in entry path");
    }
    if path.split('/').any(|component| component.is_empty()) {
        return Some("empty path component");
    }
    if path.contains(':') {
        return Some("drive or scheme prefix in entry path");
    }
    None
}

// ---------------------------------------------------------------------------
// Format gate
// ---------------------------------------------------------------------------

/// Content classes the sniffer can distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniffed {
    Raster(&'static str),
    Svg,
    Text,
    Binary,
}

impl Sniffed {
    fn label(&self, extension: &str) -> &'static str {
        match self {
            Sniffed::Raster(mime) => mime,
            Sniffed::Svg => "image/svg+xml",
            Sniffed::Text => text_mime(extension),
            Sniffed::Binary => "application/octet-stream",
        }
    }
}

fn text_mime(extension: &str) -> &'static str {
    match extension {
        "html" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "md" => "text/markdown",
        _ => "text/plain",
    }
}

/// Sniff the actual content class from leading bytes.
fn sniff(content: &[u8]) -> Sniffed {
    if let Ok(image_type) = imagesize::image_type(content) {
        if let Some(mime) = raster_mime(image_type) {
            return Sniffed::Raster(mime);
        }
    }
    if looks_like_svg(content) {
        return Sniffed::Svg;
    }
    if std::str::from_utf8(content).is_ok() {
        return Sniffed::Text;
    }
    Sniffed::Binary
}

fn raster_mime(image_type: imagesize::ImageType) -> Option<&'static str> {
    use imagesize::ImageType;
    match image_type {
        ImageType::Png => Some("image/png"),
        ImageType::Gif => Some("image/gif"),
        ImageType::Jpeg => Some("image/jpeg"),
        ImageType::Webp => Some("image/webp"),
        ImageType::Bmp => Some("image/bmp"),
        ImageType::Ico => Some("image/x-icon"),
        _ => None,
    }
}

/// Raster mime expected for an allow-listed image extension.
fn expected_raster(extension: &str) -> Option<&'static str> {
    match extension {
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "ico" => Some("image/x-icon"),
        _ => None,
    }
}

fn looks_like_svg(content: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(content) else {
        return false;
    };
    let trimmed = text.trim_start();
    trimmed.starts_with("<svg")
        || (trimmed.starts_with("<?xml") && trimmed.contains("<svg"))
}

fn extension_of(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Format and link checks for one entry. Returns the first violation found.
fn check_entry_format(
    path: &str,
    content: &[u8],
    limits: &ValidationLimits,
) -> Option<RelayViolation> {
    let Some(extension) = extension_of(path) else {
        return Some(RelayViolation::entry(
            RelayRule::BannedFormat,
            path,
            "entry has no file extension",
        ));
    };

    if limits.banned_extensions.contains(&extension) {
        return Some(RelayViolation::entry(
            RelayRule::BannedFormat,
            path,
            format!("extension .{extension} is banned"),
        ));
    }
    if !limits.allowed_extensions.contains(&extension) {
        return Some(RelayViolation::entry(
            RelayRule::BannedFormat,
            path,
            format!("extension .{extension} is not on the allowed list"),
        ));
    }

    let sniffed = sniff(content);

    // Vector image content is banned no matter what the name claims.
    if sniffed == Sniffed::Svg {
        return Some(RelayViolation::entry(
            RelayRule::BannedFormat,
            path,
            "content sniffed as a vector image format",
        ));
    }

    match expected_raster(&extension) {
        Some(expected) => match sniffed {
            Sniffed::Raster(actual) if actual == expected => {}
            Sniffed::Raster(actual) => {
                return Some(RelayViolation::entry(
                    RelayRule::TypeMismatch,
                    path,
                    format!("declared {expected} but content is {actual}"),
                ));
            }
            _ => {
                return Some(RelayViolation::entry(
                    RelayRule::TypeMismatch,
                    path,
                    format!("declared {expected} but content is not a raster image"),
                ));
            }
        },
        None => {
            // Document extensions must hold text, not disguised binaries.
            match sniffed {
                Sniffed::Text => {
                    if let Some(violation) = check_links(path, content, limits) {
                        return Some(violation);
                    }
                }
                _ => {
                    return Some(RelayViolation::entry(
                        RelayRule::TypeMismatch,
                        path,
                        format!("declared .{extension} document holds non-text content"),
                    ));
                }
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// External link gate
// ---------------------------------------------------------------------------

/// Scan text content for absolute URLs and reject hosts off the allow-list.
fn check_links(path: &str, content: &[u8], limits: &ValidationLimits) -> Option<RelayViolation> {
    let text = std::str::from_utf8(content).ok()?;

    for candidate in extract_urls(text) {
        let Ok(parsed) = Url::parse(&candidate) else {
            continue;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            continue;
        }
        let Some(host) = parsed.host_str() else {
            continue;
        };
        if !limits.host_allowed(host) {
            return Some(RelayViolation::entry(
                RelayRule::ExternalLink,
                path,
                format!("external resource host '{host}' is not allowed"),
            ));
        }
    }
    None
}

/// Pull `http(s)://…` substrings out of text, ending at the first
/// delimiter character.
fn extract_urls(text: &str) -> Vec<String> {
    const DELIMITERS: &[char] = &[
        ' ', '\t', '\r', '\n', '"', '\'', '<', '>', '(', ')', '[', ']', '{', '}',
    ];

    let mut urls = Vec::new();
    for (start, _) in text.match_indices("http") {
        let rest = &text[start..];
        if !rest.starts_with("http://") && !rest.starts_with("https://") {
            continue;
        }
        let end = rest.find(DELIMITERS).unwrap_or(rest.len());
        urls.push(rest[..end].to_string());
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Minimal PNG header (magic + IHDR chunk start).
    const PNG_BYTES: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
    ];
    const GIF_BYTES: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00";

    fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(name.to_string(), options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn limits() -> ValidationLimits {
        ValidationLimits::default()
    }

    #[test]
    fn accepts_a_small_pixel_archive() {
        let archive = make_zip(&[
            ("index.html", b"<html><body>sprites</body></html>"),
            ("art/hero.png", PNG_BYTES),
        ]);
        let result = validate(&archive, &limits());

        assert!(result.accepted(), "violation: {:?}", result.violation);
        assert_eq!(result.files.len(), 2);
        assert!(result.digest.is_some());
        // Normalized set is sorted by path.
        assert_eq!(result.files[0].path, "art/hero.png");
        assert_eq!(result.files[0].sniffed_type, "image/png");
        assert_eq!(result.files[1].declared_type, "text/html");
    }

    #[test]
    fn digest_is_order_independent() {
        let forward = make_zip(&[("a.png", PNG_BYTES), ("b.html", b"<html></html>")]);
        let backward = make_zip(&[("b.html", b"<html></html>"), ("a.png", PNG_BYTES)]);

        let first = validate(&forward, &limits());
        let second = validate(&backward, &limits());
        assert!(first.accepted() && second.accepted());
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn digest_changes_with_content() {
        let one = make_zip(&[("a.html", b"<html>one</html>")]);
        let two = make_zip(&[("a.html", b"<html>two</html>")]);

        assert_ne!(
            validate(&one, &limits()).digest,
            validate(&two, &limits()).digest
        );
    }

    #[test]
    fn rejects_path_traversal() {
        let archive = make_zip(&[("../escape.html", b"<html></html>")]);
        let result = validate(&archive, &limits());

        let violation = result.violation.expect("rejected");
        assert_eq!(violation.rule, RelayRule::EntryPath);
        assert!(result.files.is_empty());
        assert!(result.digest.is_none());
    }

    #[test]
    fn rejects_absolute_paths() {
        let archive = make_zip(&[("/etc/passwd.txt", b"root")]);
        let result = validate(&archive, &limits());
        assert_eq!(result.violation.unwrap().rule, RelayRule::EntryPath);
    }

    #[test]
    fn rejects_nested_traversal() {
        let archive = make_zip(&[("art/../../escape.png", PNG_BYTES)]);
        let result = validate(&archive, &limits());
        assert_eq!(result.violation.unwrap().rule, RelayRule::EntryPath);
    }

    #[test]
    fn rejects_banned_vector_extension() {
        let archive = make_zip(&[("logo.svg", b"<svg xmlns='http://www.w3.org/2000/svg'/>")]);
        let result = validate(&archive, &limits());

        let violation = result.violation.unwrap();
        assert_eq!(violation.rule, RelayRule::BannedFormat);
        assert!(violation.reason.contains("banned"));
    }

    #[test]
    fn rejects_vector_content_behind_benign_extension() {
        let archive = make_zip(&[(
            "innocent.png",
            b"<?xml version=\"1.0\"?><svg xmlns=\"http://www.w3.org/2000/svg\"></svg>" as &[u8],
        )]);
        let result = validate(&archive, &limits());

        let violation = result.violation.unwrap();
        assert_eq!(violation.rule, RelayRule::BannedFormat);
        assert!(violation.reason.contains("vector"));
    }

    #[test]
    fn rejects_raster_type_mismatch() {
        // GIF bytes wearing a .png name.
        let archive = make_zip(&[("sprite.png", GIF_BYTES)]);
        let result = validate(&archive, &limits());

        let violation = result.violation.unwrap();
        assert_eq!(violation.rule, RelayRule::TypeMismatch);
        assert!(violation.reason.contains("image/gif"));
    }

    #[test]
    fn rejects_binary_disguised_as_document() {
        let archive = make_zip(&[("notes.txt", &[0xFFu8, 0xFE, 0x00, 0x01, 0x02] as &[u8])]);
        let result = validate(&archive, &limits());
        assert_eq!(result.violation.unwrap().rule, RelayRule::TypeMismatch);
    }

    #[test]
    fn rejects_unlisted_extension() {
        let archive = make_zip(&[("tool.exe", b"MZ\x90\x00")]);
        let result = validate(&archive, &limits());
        assert_eq!(result.violation.unwrap().rule, RelayRule::BannedFormat);
    }

    #[test]
    fn rejects_oversized_entries() {
        let mut small = limits();
        small.max_entry_bytes = 16;
        let archive = make_zip(&[("big.txt", b"this text is much longer than sixteen bytes")]);
        let result = validate(&archive, &small);
        assert_eq!(result.violation.unwrap().rule, RelayRule::ArchiveLimits);
    }

    #[test]
    fn rejects_too_many_entries() {
        let mut small = limits();
        small.max_entries = 1;
        let archive = make_zip(&[("a.txt", b"a"), ("b.txt", b"b")]);
        let result = validate(&archive, &small);
        assert_eq!(result.violation.unwrap().rule, RelayRule::ArchiveLimits);
    }

    #[test]
    fn rejects_garbage_container() {
        let result = validate(b"definitely not a zip", &limits());
        assert_eq!(result.violation.unwrap().rule, RelayRule::Container);
    }

    #[test]
    fn rejects_offsite_resource_links() {
        let archive = make_zip(&[(
            "index.html",
            b"<img src=\"https://evil.example.com/tracker.png\">" as &[u8],
        )]);
        let result = validate(&archive, &limits());

        let violation = result.violation.unwrap();
        assert_eq!(violation.rule, RelayRule::ExternalLink);
        assert!(violation.reason.contains("evil.example.com"));
    }

    #[test]
    fn allows_links_to_provider_hosts() {
        let archive = make_zip(&[(
            "index.html",
            b"<img src=\"https://raw.githubusercontent.com/alice/pixels/main/a.png\">\
              <a href=\"https://alice.github.io/pixels\">site</a>" as &[u8],
        )]);
        let result = validate(&archive, &limits());
        assert!(result.accepted(), "violation: {:?}", result.violation);
    }

    #[test]
    fn relative_links_are_fine() {
        let archive = make_zip(&[("index.html", b"<img src=\"art/hero.png\">")]);
        assert!(validate(&archive, &limits()).accepted());
    }

    #[test]
    fn url_extraction_stops_at_delimiters() {
        let urls = extract_urls("see https://a.example/x\"and(http://b.example/y)");
        assert_eq!(urls, vec!["https://a.example/x", "http://b.example/y"]);
    }
}
