//! Image rehosting client for PicGo/Chevereto-style hosts.
//!
//! Generated inline images arrive as base64 data URIs, which many chat
//! clients refuse to render past a certain size. When rehosting is enabled,
//! the gateway uploads them and substitutes the hosted URL. Every failure
//! path returns `None` so the caller falls back to the original URI; a
//! broken image host must never fail a chat request.

use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine as _;
use regex::Regex;

use crate::config::PicgoConfig;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn data_uri_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^data:(?<mime>[^;]+);base64,(?<b64>.+)$").unwrap())
}

fn image_markdown_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[image\]\((data:[^)]+)\)").unwrap())
}

/// Split a `data:<mime>;base64,<b64>` URI into its mime and payload.
pub fn parse_data_uri(data_uri: &str) -> Option<(String, String)> {
    let caps = data_uri_re().captures(data_uri.trim())?;
    Some((caps["mime"].to_string(), caps["b64"].to_string()))
}

/// Client for the configured image host.
pub struct ImageHost {
    client: reqwest::Client,
    config: PicgoConfig,
}

impl ImageHost {
    pub fn new(client: reqwest::Client, config: PicgoConfig) -> Self {
        Self { client, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.api_key.is_some()
    }

    /// Upload a data URI image; returns the hosted URL or `None`.
    pub async fn upload_data_uri(&self, data_uri: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!("image rehosting enabled but PICGO_API_KEY not set, skipping upload");
            return None;
        };
        let (mime, b64) = parse_data_uri(data_uri)?;

        let form = [
            ("key", api_key.to_string()),
            ("source", format!("data:{mime};base64,{b64}")),
            ("format", "json".to_string()),
        ];

        let resp = match self
            .client
            .post(&self.config.upload_url)
            .form(&form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "image upload failed");
                return None;
            }
        };

        let data: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "image host returned unparsable body");
                return None;
            }
        };

        let url = extract_hosted_url(&data);
        if url.is_none() {
            tracing::warn!(
                body = %truncate_for_log(&data.to_string(), 200),
                "image host returned no url"
            );
        }
        url
    }

    /// Download a remote image and rehost it; returns the hosted URL or `None`.
    pub async fn upload_remote(&self, image_url: &str) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }

        let resp = match self
            .client
            .get(image_url)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "remote image fetch failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            return None;
        }

        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|ct| ct.starts_with("image/"))
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
            .unwrap_or_else(|| "image/png".to_string());

        let bytes = resp.bytes().await.ok()?;
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        self.upload_data_uri(&format!("data:{mime};base64,{b64}"))
            .await
    }

    /// Replace `![image](data:...)` occurrences in generated markdown with
    /// hosted URLs, preserving the surrounding text verbatim. Failed uploads
    /// leave the original data URI in place.
    pub async fn rewrite_markdown_images(&self, text: &str) -> String {
        if !self.is_enabled() || !text.contains("![image](data:") {
            return text.to_string();
        }

        let mut out = text.to_string();
        let matches: Vec<(String, String)> = image_markdown_re()
            .captures_iter(text)
            .map(|c| (c[0].to_string(), c[1].to_string()))
            .collect();
        for (whole, data_uri) in matches {
            if let Some(url) = self.upload_data_uri(&data_uri).await {
                out = out.replace(&whole, &format!("![image]({url})"));
            }
        }
        out
    }
}

/// Pull the hosted URL out of the known Chevereto response shapes.
fn extract_hosted_url(data: &serde_json::Value) -> Option<String> {
    for path in [
        ["image", "url"],
        ["image", "display_url"],
        ["image", "url_viewer"],
        ["data", "url"],
        ["data", "display_url"],
    ] {
        if let Some(url) = data
            .get(path[0])
            .and_then(|v| v.get(path[1]))
            .and_then(|v| v.as_str())
        {
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    None
}

fn truncate_for_log(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_data_uri() {
        let (mime, b64) = parse_data_uri("data:image/jpeg;base64,SGVsbG8=").unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(b64, "SGVsbG8=");
    }

    #[test]
    fn rejects_malformed_data_uris() {
        assert!(parse_data_uri("http://example.com/a.png").is_none());
        assert!(parse_data_uri("data:image/png,notbase64").is_none());
        assert!(parse_data_uri("").is_none());
    }

    #[test]
    fn extracts_url_from_chevereto_shapes() {
        let v = serde_json::json!({"image": {"url": "https://host/a.png"}});
        assert_eq!(extract_hosted_url(&v).as_deref(), Some("https://host/a.png"));

        let v = serde_json::json!({"data": {"display_url": "https://host/b.png"}});
        assert_eq!(extract_hosted_url(&v).as_deref(), Some("https://host/b.png"));

        let v = serde_json::json!({"status": "error"});
        assert_eq!(extract_hosted_url(&v), None);
    }

    #[test]
    fn markdown_scan_matches_only_data_uris() {
        let re = image_markdown_re();
        let text = "before ![image](data:image/png;base64,AAAA) after ![image](https://x/y.png)";
        let hits: Vec<_> = re.captures_iter(text).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(&hits[0][1], "data:image/png;base64,AAAA");
    }

    #[tokio::test]
    async fn disabled_host_passes_text_through() {
        let host = ImageHost::new(reqwest::Client::new(), PicgoConfig::default());
        let text = "![image](data:image/png;base64,AAAA)";
        assert_eq!(host.rewrite_markdown_images(text).await, text);
        assert_eq!(host.upload_data_uri("data:image/png;base64,AAAA").await, None);
    }
}
