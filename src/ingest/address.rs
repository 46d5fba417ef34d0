//! Network address normalization.
//!
//! Phone and IP camera apps expose the same feed under a handful of paths:
//! `/video`, `/videofeed` and `/stream` for MJPEG, `/shot.jpg` for a single
//! JPEG. Users paste whichever one they see, often without a scheme.

/// Path of the single-image endpoint.
pub const SNAPSHOT_SUFFIX: &str = "/shot.jpg";
/// Path substituted for the snapshot path when a stream is needed.
pub const STREAM_SUFFIX: &str = "/video";

// Longest first so `/videofeed` is not mistaken for `/video`.
const STREAM_SUFFIXES: [&str; 3] = ["/videofeed", "/stream", "/video"];

/// Endpoints derived from one configured address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkEndpoints {
    /// Single-image endpoint, when one can be derived.
    pub snapshot: Option<String>,
    /// Streaming endpoint.
    pub stream: String,
}

impl NetworkEndpoints {
    /// The canonical form of the address: the snapshot endpoint when derivable.
    pub fn canonical(&self) -> &str {
        self.snapshot.as_deref().unwrap_or(&self.stream)
    }
}

/// Normalize a user-supplied network address.
///
/// `"1.2.3.4:8080/video"` becomes snapshot `http://1.2.3.4:8080/shot.jpg` with
/// stream `http://1.2.3.4:8080/video`.
pub fn normalize(address: &str) -> NetworkEndpoints {
    let trimmed = address.trim();
    let url = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let scheme = url.split("://").next().unwrap_or("").to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return NetworkEndpoints {
            snapshot: None,
            stream: url,
        };
    }

    if let Some(base) = url.strip_suffix(SNAPSHOT_SUFFIX) {
        return NetworkEndpoints {
            stream: format!("{}{}", base, STREAM_SUFFIX),
            snapshot: Some(url),
        };
    }

    for suffix in STREAM_SUFFIXES {
        if let Some(base) = url.strip_suffix(suffix) {
            return NetworkEndpoints {
                snapshot: Some(format!("{}{}", base, SNAPSHOT_SUFFIX)),
                stream: url,
            };
        }
    }

    if has_explicit_port(&url) && !url.ends_with('/') {
        let stream = if path_of(&url).is_empty() {
            format!("{}{}", url, STREAM_SUFFIX)
        } else {
            url.clone()
        };
        return NetworkEndpoints {
            snapshot: Some(format!("{}{}", url, SNAPSHOT_SUFFIX)),
            stream,
        };
    }

    NetworkEndpoints {
        snapshot: None,
        stream: url,
    }
}

/// Address variants tried by `reconnect()`, original first, duplicates removed.
pub fn reconnect_variants(original: &str) -> Vec<String> {
    let original = original.trim().to_string();
    let mut variants = vec![original.clone()];
    if let Some(base) = original.strip_suffix(STREAM_SUFFIX) {
        variants.push(format!("{}{}", base, SNAPSHOT_SUFFIX));
    }
    if let Some(base) = original.strip_suffix(SNAPSHOT_SUFFIX) {
        variants.push(format!("{}{}", base, STREAM_SUFFIX));
    }
    let mut seen = Vec::with_capacity(variants.len());
    variants.retain(|v| {
        if seen.contains(v) {
            false
        } else {
            seen.push(v.clone());
            true
        }
    });
    variants
}

// The helpers below read the raw text. `url::Url` drops default ports such as
// `:80` and turns an empty path into `/`, and both matter to `normalize`.

fn authority_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?', '#']).next().unwrap_or("")
}

fn path_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority_len = authority_of(url).len();
    &rest[authority_len..]
}

fn has_explicit_port(url: &str) -> bool {
    let authority = authority_of(url);
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    // IPv6 literals carry colons inside brackets.
    let after_host = match host_port.rfind(']') {
        Some(end) => &host_port[end + 1..],
        None => host_port,
    };
    after_host.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_path_rewrites_to_snapshot() {
        let endpoints = normalize("1.2.3.4:8080/video");
        assert_eq!(
            endpoints.snapshot.as_deref(),
            Some("http://1.2.3.4:8080/shot.jpg")
        );
        assert_eq!(endpoints.stream, "http://1.2.3.4:8080/video");
        assert_eq!(endpoints.canonical(), "http://1.2.3.4:8080/shot.jpg");
    }

    #[test]
    fn videofeed_and_stream_suffixes() {
        assert_eq!(
            normalize("http://cam.local:8080/videofeed").snapshot.as_deref(),
            Some("http://cam.local:8080/shot.jpg")
        );
        assert_eq!(
            normalize(" cam.local/stream ").snapshot.as_deref(),
            Some("http://cam.local/shot.jpg")
        );
    }

    #[test]
    fn snapshot_address_is_kept() {
        let endpoints = normalize("https://cam/shot.jpg");
        assert_eq!(endpoints.snapshot.as_deref(), Some("https://cam/shot.jpg"));
        assert_eq!(endpoints.stream, "https://cam/video");
    }

    #[test]
    fn bare_host_with_port_gains_snapshot_path() {
        let endpoints = normalize("192.168.0.7:8080");
        assert_eq!(
            endpoints.snapshot.as_deref(),
            Some("http://192.168.0.7:8080/shot.jpg")
        );
        assert_eq!(endpoints.stream, "http://192.168.0.7:8080/video");
    }

    #[test]
    fn trailing_slash_or_no_port_is_left_alone() {
        assert_eq!(normalize("192.168.0.7:8080/").snapshot, None);
        let plain = normalize("camera.example/feed.mjpg");
        assert_eq!(plain.snapshot, None);
        assert_eq!(plain.stream, "http://camera.example/feed.mjpg");
    }

    #[test]
    fn default_port_is_still_an_explicit_port() {
        let endpoints = normalize("http://cam.local:80");
        assert_eq!(
            endpoints.snapshot.as_deref(),
            Some("http://cam.local:80/shot.jpg")
        );
        assert_eq!(endpoints.stream, "http://cam.local:80/video");
    }

    #[test]
    fn ipv6_without_port_is_not_a_port() {
        assert!(!has_explicit_port("http://[::1]/x"));
        assert!(has_explicit_port("http://[::1]:81/x"));
    }

    #[test]
    fn non_http_schemes_pass_through() {
        let endpoints = normalize("stub://scene");
        assert_eq!(endpoints.snapshot, None);
        assert_eq!(endpoints.stream, "stub://scene");
    }

    #[test]
    fn reconnect_variants_swap_suffixes() {
        assert_eq!(
            reconnect_variants("http://c:8080/video"),
            vec!["http://c:8080/video", "http://c:8080/shot.jpg"]
        );
        assert_eq!(
            reconnect_variants("http://c:8080/shot.jpg"),
            vec!["http://c:8080/shot.jpg", "http://c:8080/video"]
        );
        assert_eq!(reconnect_variants("http://c/feed"), vec!["http://c/feed"]);
    }
}
