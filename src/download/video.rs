//! HLS video assembly: playlist resolution, segment fetch, ordered concat.
//!
//! Course videos are served as HLS playlists. Assembly resolves a master
//! playlist to its first variant, fetches every media segment with wide
//! concurrency and a deep per-segment retry budget (segment servers drop
//! connections constantly but recover immediately), and concatenates the
//! segments in playlist order into a single file at the requested path.
//!
//! Segments are staged in a `.part` directory next to the destination so a
//! failed assembly never leaves a half-written video file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use super::engine::{build_identity_client, transfer};
use super::retry::{RetryPolicy, retry_with_policy};
use super::DownloadError;
use crate::config::Credentials;

/// Maximum concurrent segment transfers within one video assembly.
pub const SEGMENT_CONCURRENCY: usize = 100;

/// Per-segment attempt budget.
pub const SEGMENT_ATTEMPTS: u32 = 30;

/// Assembles HLS playlists into single video files.
#[derive(Debug, Clone)]
pub struct VideoDownloader {
    client: Client,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl VideoDownloader {
    /// Creates a video downloader carrying the fixed request identity.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Credentials`] when the bundle cannot be
    /// expressed as request headers.
    pub fn new(credentials: &Credentials) -> Result<Self, DownloadError> {
        Ok(Self {
            client: build_identity_client(credentials)?,
            semaphore: Arc::new(Semaphore::new(SEGMENT_CONCURRENCY)),
            policy: RetryPolicy::immediate(SEGMENT_ATTEMPTS),
        })
    }

    /// Downloads the playlist at `playlist_url` and assembles it into `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the playlist is unreachable or unusable,
    /// any segment exhausts its attempt budget, or writing `dest` fails. On
    /// error nothing is left at `dest`.
    pub async fn download(&self, playlist_url: &str, dest: &Path) -> Result<(), DownloadError> {
        let base = Url::parse(playlist_url).map_err(|_| DownloadError::invalid_url(playlist_url))?;
        let mut playlist = fetch_text(&self.client, base.as_str()).await?;
        let mut media_url = base;

        if let Some(variant) = variant_uri(&playlist) {
            media_url = media_url
                .join(variant)
                .map_err(|_| DownloadError::invalid_url(variant))?;
            debug!(variant = %media_url, "resolved master playlist to variant");
            playlist = fetch_text(&self.client, media_url.as_str()).await?;
        }

        let segments = segment_uris(&playlist)
            .into_iter()
            .map(|uri| {
                media_url
                    .join(uri)
                    .map_err(|_| DownloadError::invalid_url(uri))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if segments.is_empty() {
            return Err(DownloadError::playlist(
                media_url.as_str(),
                "no media segments",
            ));
        }

        info!(segments = segments.len(), dest = %dest.display(), "assembling video");
        let part_dir = dest.with_extension("part");
        tokio::fs::create_dir_all(&part_dir)
            .await
            .map_err(|e| DownloadError::io(part_dir.clone(), e))?;

        let result = self.fetch_segments(&segments, &part_dir).await;
        let result = match result {
            Ok(()) => concat_segments(&part_dir, segments.len(), dest).await,
            Err(e) => Err(e),
        };

        let _ = tokio::fs::remove_dir_all(&part_dir).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    async fn fetch_segments(&self, segments: &[Url], part_dir: &Path) -> Result<(), DownloadError> {
        let mut handles = Vec::with_capacity(segments.len());

        for (index, segment) in segments.iter().enumerate() {
            let client = self.client.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let policy = self.policy.clone();
            let url = segment.clone();
            let path = segment_path(part_dir, index);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                retry_with_policy(&policy, |attempt| {
                    if attempt > 1 {
                        debug!(%url, attempt, "refetching segment");
                    }
                    transfer(&client, url.as_str(), &path)
                })
                .await
                .map(|_| ())
                .map_err(|(error, attempts)| {
                    warn!(%url, %error, attempts, "segment exhausted its attempts");
                    error
                })
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(join_error) => {
                    warn!(error = %join_error, "segment task panicked");
                    if first_error.is_none() {
                        first_error = Some(DownloadError::io(
                            part_dir.to_path_buf(),
                            std::io::Error::other(join_error),
                        ));
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

fn segment_path(part_dir: &Path, index: usize) -> PathBuf {
    part_dir.join(format!("segment_{index:05}.ts"))
}

async fn concat_segments(
    part_dir: &Path,
    count: usize,
    dest: &Path,
) -> Result<(), DownloadError> {
    let file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| DownloadError::io(dest.to_path_buf(), e))?;
    let mut writer = tokio::io::BufWriter::new(file);

    for index in 0..count {
        let path = segment_path(part_dir, index);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| DownloadError::io(path.clone(), e))?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| DownloadError::io(dest.to_path_buf(), e))?;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(dest.to_path_buf(), e))?;
    Ok(())
}

async fn fetch_text(client: &Client, url: &str) -> Result<String, DownloadError> {
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            DownloadError::timeout(url)
        } else {
            DownloadError::network(url, e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::http_status(url, status.as_u16()));
    }

    response
        .text()
        .await
        .map_err(|e| DownloadError::network(url, e))
}

/// First variant URI of a master playlist, or `None` for a media playlist.
fn variant_uri(playlist: &str) -> Option<&str> {
    let mut saw_stream_inf = false;
    for line in playlist.lines().map(str::trim) {
        if line.starts_with("#EXT-X-STREAM-INF") {
            saw_stream_inf = true;
        } else if saw_stream_inf && !line.is_empty() && !line.starts_with('#') {
            return Some(line);
        }
    }
    None
}

/// Media segment URIs of a media playlist, in playlist order.
fn segment_uris(playlist: &str) -> Vec<&str> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_credentials() -> Credentials {
        let cookie: crate::config::CookieEntry =
            serde_json::from_str(r#"{"name":"session","value":"abc"}"#).unwrap();
        Credentials::new(vec![cookie], "offcourse-test/1.0".to_string())
    }

    #[test]
    fn test_variant_uri_found_in_master_playlist() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nlow/index.m3u8\n";
        assert_eq!(variant_uri(master), Some("low/index.m3u8"));
    }

    #[test]
    fn test_variant_uri_none_for_media_playlist() {
        let media = "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        assert_eq!(variant_uri(media), None);
    }

    #[test]
    fn test_segment_uris_in_order() {
        let media = "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n";
        assert_eq!(segment_uris(media), vec!["seg0.ts", "seg1.ts"]);
    }

    #[test]
    fn test_segment_uris_handles_absolute_urls() {
        let media = "#EXTM3U\n#EXTINF:4.0,\nhttps://cdn.example.com/v/seg0.ts\n";
        assert_eq!(segment_uris(media), vec!["https://cdn.example.com/v/seg0.ts"]);
    }

    #[tokio::test]
    async fn test_download_assembles_segments_in_order() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/video/index.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXT-X-ENDLIST\n",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/video/seg0.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AAAA"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/video/seg1.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"BBBB"))
            .mount(&server)
            .await;

        let downloader = VideoDownloader::new(&test_credentials()).unwrap();
        let dest = dir.path().join("Lesson.mp4");
        downloader
            .download(&format!("{}/video/index.m3u8", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"AAAABBBB");
        assert!(!dir.path().join("Lesson.part").exists());
    }

    #[tokio::test]
    async fn test_download_resolves_master_playlist() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/video/master.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nhigh/index.m3u8\n",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/video/high/index.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/video/high/seg0.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"DATA"))
            .mount(&server)
            .await;

        let downloader = VideoDownloader::new(&test_credentials()).unwrap();
        let dest = dir.path().join("Lesson.mp4");
        downloader
            .download(&format!("{}/video/master.m3u8", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"DATA");
    }

    #[tokio::test]
    async fn test_download_retries_flaky_segment() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/v/index.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v/seg0.ts"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v/seg0.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"EVENTUALLY"))
            .mount(&server)
            .await;

        let downloader = VideoDownloader::new(&test_credentials()).unwrap();
        let dest = dir.path().join("Flaky.mp4");
        downloader
            .download(&format!("{}/v/index.m3u8", server.uri()), &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"EVENTUALLY");
    }

    #[tokio::test]
    async fn test_download_fails_on_empty_playlist() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/v/empty.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\n#EXT-X-ENDLIST\n"))
            .mount(&server)
            .await;

        let downloader = VideoDownloader::new(&test_credentials()).unwrap();
        let dest = dir.path().join("Empty.mp4");
        let result = downloader
            .download(&format!("{}/v/empty.m3u8", server.uri()), &dest)
            .await;

        assert!(matches!(result, Err(DownloadError::Playlist { .. })));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_failed_assembly_leaves_no_destination_file() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/v/index.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("#EXTM3U\n#EXTINF:4.0,\nmissing.ts\n#EXT-X-ENDLIST\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v/missing.ts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let downloader = VideoDownloader::new(&test_credentials()).unwrap();
        let dest = dir.path().join("Broken.mp4");
        let result = downloader
            .download(&format!("{}/v/index.m3u8", server.uri()), &dest)
            .await;

        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!dir.path().join("Broken.part").exists());
    }
}
