use std::fmt::Write;
use std::time::Duration;
use url::Url;

/// Map an artifact name onto something safe to use as a file stem.
///
/// Characters that are unsafe in file names, a leading dot, leading or
/// trailing whitespace and `%` itself become `%XX` escapes of their UTF-8
/// bytes, so distinct names never share a stem.
pub fn sanitize_filename(input: &str) -> String {
    let last = input.chars().count().saturating_sub(1);
    let mut stem = String::with_capacity(input.len());

    for (i, c) in input.chars().enumerate() {
        let escape = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '%' => true,
            '.' => i == 0,
            c if c.is_whitespace() && (i == 0 || i == last) => true,
            c => c.is_control(),
        };

        if escape {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(stem, "%{byte:02X}");
            }
        } else {
            stem.push(c);
        }
    }

    stem
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Parse an absolute http(s) URL.
pub fn validate_url(url: &str) -> Result<Url, String> {
    let parsed = Url::parse(url).map_err(|e| e.to_string())?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(format!("unsupported url scheme '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("ebdk"), "ebdk");
        assert_eq!(sanitize_filename("site/home"), "site%2Fhome");
        assert_eq!(sanitize_filename("a:b?c"), "a%3Ab%3Fc");
        assert_eq!(sanitize_filename("../escape"), "%2E.%2Fescape");
        assert_eq!(sanitize_filename(".hidden"), "%2Ehidden");
        assert_eq!(sanitize_filename("100%"), "100%25");
        assert_eq!(sanitize_filename(" padded "), "%20padded%20");
        assert_eq!(sanitize_filename("tab\tname"), "tab%09name");
    }

    #[test]
    fn test_sanitize_filename_keeps_names_apart() {
        let names = ["a/b", "a_b", "a%2Fb", ".x", "x", "%2Ex", "a b", " ab"];
        let stems: std::collections::HashSet<_> =
            names.iter().map(|name| sanitize_filename(name)).collect();
        assert_eq!(stems.len(), names.len());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.test/path?q=1").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("invalid-url").is_err());
        assert!(validate_url("").is_err());
    }
}
