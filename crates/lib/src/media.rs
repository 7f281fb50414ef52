//! Image download with optional platform decryption.
//!
//! Images attached by users are stored by the platform AES-encrypted with the callback key;
//! images referenced by the upstream answer are plain downloads.

use crate::config::MediaConfig;
use crate::crypto::{CryptoEnvelope, CryptoError};
use async_trait::async_trait;
use futures_util::StreamExt;

/// Path marker of the platform's COS bucket URLs that the optional proxy understands.
const COS_PATH_MARKER: &str = "cos.ap-guangzhou.myqcloud.com/";

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("media download returned status {0}")]
    Status(u16),
    #[error("url is not an image (content-type {0})")]
    NotImage(String),
    #[error("media exceeds {0} bytes")]
    TooLarge(usize),
    #[error("media decryption failed: {0}")]
    Decrypt(#[from] CryptoError),
}

/// Downloads a URL and, when a key is given, decrypts the body with it.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, key: Option<&CryptoEnvelope>) -> Result<Vec<u8>, MediaError>;
}

/// True when `url`'s host ends with one of the configured encrypted-asset hosts.
pub fn is_encrypted_source(url: &str, encrypted_hosts: &[String]) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    encrypted_hosts
        .iter()
        .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .any(|h| host == h || host.ends_with(&format!(".{}", h)))
}

/// Rewrite a platform COS URL to the proxy form `{base}/cos-image?path=<path>`. Other URLs are unchanged.
pub fn proxied_url(url: &str, proxy_base: Option<&str>) -> String {
    let Some(base) = proxy_base.map(str::trim).filter(|b| !b.is_empty()) else {
        return url.to_string();
    };
    match url.split_once(COS_PATH_MARKER) {
        Some((_, path)) => format!("{}/cos-image?path={}", base.trim_end_matches('/'), path),
        None => url.to_string(),
    }
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
    proxy_base: Option<String>,
    max_bytes: usize,
}

impl HttpMediaFetcher {
    pub fn new(config: &MediaConfig, max_bytes: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            proxy_base: config.proxy_base.clone(),
            max_bytes,
        }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str, key: Option<&CryptoEnvelope>) -> Result<Vec<u8>, MediaError> {
        let target = proxied_url(url, self.proxy_base.as_deref());
        log::debug!("media: downloading {}", target);
        let res = self.client.get(&target).send().await?;
        if !res.status().is_success() {
            return Err(MediaError::Status(res.status().as_u16()));
        }
        if key.is_none() {
            let content_type = res
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();
            if !content_type.starts_with("image/") {
                return Err(MediaError::NotImage(content_type));
            }
        }
        let mut body = Vec::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > self.max_bytes {
                return Err(MediaError::TooLarge(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        match key {
            Some(envelope) => Ok(envelope.decrypt_bytes(&body)?),
            None => Ok(body),
        }
    }
}

/// Sniff a file extension for an image body (jpg, png, gif, webp; png when unknown).
pub fn image_extension(data: &[u8]) -> &'static str {
    if data.starts_with(b"\xff\xd8\xff") {
        "jpg"
    } else if data.starts_with(b"GIF") {
        "gif"
    } else if data.starts_with(b"RIFF") && data.len() >= 12 && &data[8..12] == b"WEBP" {
        "webp"
    } else {
        "png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_encrypted_hosts() {
        let hosts = vec!["cos.ap-guangzhou.myqcloud.com".to_string()];
        assert!(is_encrypted_source(
            "https://ww-aibot-img-1258476243.cos.ap-guangzhou.myqcloud.com/abc",
            &hosts
        ));
        assert!(!is_encrypted_source("http://x/u1", &hosts));
        assert!(!is_encrypted_source("not a url", &hosts));
        assert!(!is_encrypted_source("https://evilcos.ap-guangzhou.myqcloud.com.example/a", &hosts));
    }

    #[test]
    fn rewrites_cos_urls_through_proxy() {
        let url = "https://ww-aibot-img-1.cos.ap-guangzhou.myqcloud.com/path/to/img";
        assert_eq!(
            proxied_url(url, Some("http://10.0.0.2/")),
            "http://10.0.0.2/cos-image?path=path/to/img"
        );
        assert_eq!(proxied_url(url, None), url);
        assert_eq!(proxied_url("http://other/x.png", Some("http://p")), "http://other/x.png");
    }

    #[test]
    fn sniffs_image_extensions() {
        assert_eq!(image_extension(b"\xff\xd8\xff\xe0rest"), "jpg");
        assert_eq!(image_extension(b"\x89PNG\r\n"), "png");
        assert_eq!(image_extension(b"GIF89a"), "gif");
        assert_eq!(image_extension(b"RIFF\0\0\0\0WEBPVP8"), "webp");
        assert_eq!(image_extension(b""), "png");
    }
}
