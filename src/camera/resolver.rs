//! Image acquisition: turn an event's image reference into a local file
//!
//! The camera host usually runs on another machine, so the path in the event
//! is often not readable here. In that case the image is downloaded from the
//! host's image server into the configured storage directory, keeping the
//! original base name (Windows-style paths included).
//!
//! Base names are not unique across cameras or nights. Each fetch claims its
//! destination with an exclusive create, so a name already in use (a kept
//! image, or a concurrent run's download) gets a numbered sibling such as
//! `obj-0042-1.fits` instead of being overwritten.

use super::event::ExposureEvent;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Numbered siblings tried before a destination name is given up
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Remote image could not be fetched into `destination`
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRetrievalError {
    pub locator: String,
    pub destination: PathBuf,
}

impl std::fmt::Display for ImageRetrievalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Image retrieval failed: {} → {}",
            self.locator,
            self.destination.display()
        )
    }
}

impl std::error::Error for ImageRetrievalError {}

/// Downloads a remote image to a local path
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Returns true once `destination` holds the complete image
    async fn fetch(&self, locator: &str, destination: &Path) -> bool;
}

/// HTTP(S) fetcher for the camera host's image server
///
/// The body is streamed into a uniquely named `.part` file next to the
/// destination and renamed only after the last chunk is written.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn download(
        &self,
        locator: &str,
        destination: &Path,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let mut response = self.client.get(locator).send().await?;

        if !response.status().is_success() {
            return Err(format!("image server returned {}", response.status()).into());
        }

        let dir = destination.parent().unwrap_or_else(|| Path::new("."));
        let (file, part_path) = tempfile::Builder::new()
            .prefix(".imgqc-")
            .suffix(".part")
            .tempfile_in(dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        // `part_path` deletes itself if anything above failed
        part_path.persist(destination)?;
        Ok(written)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, locator: &str, destination: &Path) -> bool {
        match self.download(locator, destination).await {
            Ok(bytes) => {
                log::debug!("📥 Fetched {} ({} bytes) → {}", locator, bytes, destination.display());
                true
            }
            Err(e) => {
                log::warn!("⚠️  Fetch of {} failed: {}", locator, e);
                false
            }
        }
    }
}

/// A locally readable image
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImage {
    pub path: PathBuf,
    /// True when the file was downloaded by this run
    pub fetched: bool,
}

/// Resolves event image references, fetching remote images on demand
pub struct ImageResolver {
    storage_dir: PathBuf,
    fetcher: Box<dyn ImageFetcher>,
}

impl ImageResolver {
    pub fn new(storage_dir: impl Into<PathBuf>, fetcher: Box<dyn ImageFetcher>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            fetcher,
        }
    }

    pub async fn resolve(&self, event: &ExposureEvent) -> Result<ResolvedImage, ImageRetrievalError> {
        if !event.filename.is_empty() && is_local_file(Path::new(&event.filename)).await {
            return Ok(ResolvedImage {
                path: PathBuf::from(&event.filename),
                fetched: false,
            });
        }

        let locator = remote_locator(event);
        let name = base_name(strip_query(&event.filename))
            .or_else(|| locator.as_deref().and_then(|l| base_name(strip_query(l))))
            .unwrap_or_else(|| "image.fits".to_string());
        let destination = self.storage_dir.join(&name);

        let locator = match locator {
            Some(locator) => locator,
            None => {
                log::debug!("No remote locator for {}", event.filename);
                return Err(ImageRetrievalError {
                    locator: event.filename.clone(),
                    destination,
                });
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.storage_dir).await {
            log::warn!(
                "⚠️  Cannot create storage dir {}: {}",
                self.storage_dir.display(),
                e
            );
            return Err(ImageRetrievalError {
                locator,
                destination,
            });
        }

        let destination = match reserve_destination(&self.storage_dir, &name).await {
            Ok(path) => path,
            Err(e) => {
                log::warn!("⚠️  No free destination for {}: {}", name, e);
                return Err(ImageRetrievalError {
                    locator,
                    destination,
                });
            }
        };

        if !self.fetcher.fetch(&locator, &destination).await {
            // Release the claimed name
            let _ = tokio::fs::remove_file(&destination).await;
            return Err(ImageRetrievalError {
                locator,
                destination,
            });
        }

        Ok(ResolvedImage {
            path: destination,
            fetched: true,
        })
    }
}

/// Create an empty placeholder under `name`, or `stem-N.ext` when taken
async fn reserve_destination(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let (stem, ext) = match name.split_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (attempt, ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{}-{}.{}", stem, n, ext),
            (n, None) => format!("{}-{}", stem, n),
        };
        let path = dir.join(candidate);

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("{} numbered variants of {} already exist", MAX_NAME_ATTEMPTS, name),
    ))
}

async fn is_local_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// The event's URL, or the filename itself when it is already a URL
fn remote_locator(event: &ExposureEvent) -> Option<String> {
    event
        .url
        .as_ref()
        .filter(|u| !u.trim().is_empty())
        .cloned()
        .or_else(|| {
            let f = event.filename.trim();
            (f.starts_with("http://") || f.starts_with("https://")).then(|| f.to_string())
        })
}

fn strip_query(locator: &str) -> &str {
    locator.split(['?', '#']).next().unwrap_or(locator)
}

/// Last path component, accepting both `/` and `\` as separators
pub fn base_name(reference: &str) -> Option<String> {
    reference
        .rsplit(['/', '\\'])
        .map(str::trim)
        .find(|s| !s.is_empty())
        .filter(|s| *s != "." && *s != ".." && !s.ends_with(':'))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::event::ReadoutStatus;
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, NamedTempFile};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Test fetcher that records calls and optionally writes a file
    struct RecordingFetcher {
        succeed: bool,
        calls: Arc<Mutex<Vec<(String, PathBuf)>>>,
    }

    #[async_trait]
    impl ImageFetcher for RecordingFetcher {
        async fn fetch(&self, locator: &str, destination: &Path) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push((locator.to_string(), destination.to_path_buf()));
            if self.succeed {
                std::fs::write(destination, b"SIMPLE  =                    T").unwrap();
            }
            self.succeed
        }
    }

    fn recording(succeed: bool) -> (Box<dyn ImageFetcher>, Arc<Mutex<Vec<(String, PathBuf)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let fetcher = RecordingFetcher {
            succeed,
            calls: calls.clone(),
        };
        (Box::new(fetcher), calls)
    }

    #[test]
    fn test_base_name_separators() {
        assert_eq!(base_name("/data/2024/obj-1.fits").as_deref(), Some("obj-1.fits"));
        assert_eq!(base_name(r"C:\images\night\obj-2.fits").as_deref(), Some("obj-2.fits"));
        assert_eq!(base_name(r"D:/mixed\sep/obj-3.fits").as_deref(), Some("obj-3.fits"));
        assert_eq!(base_name("obj-4.fits").as_deref(), Some("obj-4.fits"));
        assert_eq!(base_name("/data/dir/").as_deref(), Some("dir"));
        assert_eq!(base_name(""), None);
        assert_eq!(base_name(r"C:\"), None);
    }

    #[tokio::test]
    async fn test_local_path_returned_directly() {
        let image = NamedTempFile::new().unwrap();
        let storage = tempdir().unwrap();
        let (fetcher, calls) = recording(true);
        let resolver = ImageResolver::new(storage.path(), fetcher);

        let event = ExposureEvent::new(image.path().to_str().unwrap(), ReadoutStatus::Ok)
            .with_url("http://camera/image/x.fits");
        let resolved = resolver.resolve(&event).await.unwrap();

        assert_eq!(resolved.path, image.path());
        assert!(!resolved.fetched);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_fetch_keeps_base_name() {
        let storage = tempdir().unwrap();
        let (fetcher, calls) = recording(true);
        let resolver = ImageResolver::new(storage.path().join("incoming"), fetcher);

        let event = ExposureEvent::new(r"C:\camera\20240101\obj-0042.fits", ReadoutStatus::Ok)
            .with_url("http://camera:9001/image/abc123");
        let resolved = resolver.resolve(&event).await.unwrap();

        let expected = storage.path().join("incoming").join("obj-0042.fits");
        assert_eq!(resolved.path, expected);
        assert!(resolved.fetched);
        assert!(expected.is_file());
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            &[("http://camera:9001/image/abc123".to_string(), expected)]
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_carries_locator_and_destination() {
        let storage = tempdir().unwrap();
        let (fetcher, _calls) = recording(false);
        let resolver = ImageResolver::new(storage.path(), fetcher);

        let event = ExposureEvent::new("/remote/only/obj-7.fits", ReadoutStatus::Ok)
            .with_url("http://camera:9001/image/obj-7.fits?token=1");
        let err = resolver.resolve(&event).await.unwrap_err();

        assert_eq!(err.locator, "http://camera:9001/image/obj-7.fits?token=1");
        assert_eq!(err.destination, storage.path().join("obj-7.fits"));
        assert!(!err.destination.exists());
    }

    #[tokio::test]
    async fn test_url_in_filename_and_missing_locator() {
        let storage = tempdir().unwrap();
        let (fetcher, calls) = recording(true);
        let resolver = ImageResolver::new(storage.path(), fetcher);

        let by_url = ExposureEvent::new("http://camera/files/obj-9.fits?x=1", ReadoutStatus::Ok);
        let resolved = resolver.resolve(&by_url).await.unwrap();
        assert_eq!(resolved.path, storage.path().join("obj-9.fits"));

        let no_locator = ExposureEvent::new("/not/here/obj-10.fits", ReadoutStatus::Ok);
        let err = resolver.resolve(&no_locator).await.unwrap_err();
        assert_eq!(err.locator, "/not/here/obj-10.fits");
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_base_name_never_overwrites() {
        let storage = tempdir().unwrap();
        std::fs::write(storage.path().join("obj-0042.fits"), b"kept from last night").unwrap();
        let (fetcher, calls) = recording(true);
        let resolver = Arc::new(ImageResolver::new(storage.path(), fetcher));

        let north = ExposureEvent::new(r"C:\north\obj-0042.fits", ReadoutStatus::Ok)
            .with_url("http://north:9001/image/obj-0042.fits");
        let south = ExposureEvent::new(r"C:\south\obj-0042.fits", ReadoutStatus::Ok)
            .with_url("http://south:9001/image/obj-0042.fits");

        let (a, b) = tokio::join!(resolver.resolve(&north), resolver.resolve(&south));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.path, b.path);
        let mut names: Vec<String> = [&a.path, &b.path]
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["obj-0042-1.fits", "obj-0042-2.fits"]);
        assert_eq!(
            std::fs::read(storage.path().join("obj-0042.fits")).unwrap(),
            b"kept from last night"
        );
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_releases_claimed_name() {
        let storage = tempdir().unwrap();
        let (fetcher, _calls) = recording(false);
        let resolver = ImageResolver::new(storage.path(), fetcher);

        let event = ExposureEvent::new("/remote/obj-8", ReadoutStatus::Ok)
            .with_url("http://camera:9001/image/obj-8");
        assert!(resolver.resolve(&event).await.is_err());
        assert!(resolver.resolve(&event).await.is_err());
        assert_eq!(std::fs::read_dir(storage.path()).unwrap().count(), 0);
    }

    /// One-shot HTTP server answering every request with `status` and `body`
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}/image/obj.fits", addr)
    }

    #[tokio::test]
    async fn test_http_fetcher_downloads() {
        let url = serve_once("200 OK", b"SIMPLE  = T / fake fits").await;
        let dir = tempdir().unwrap();
        let destination = dir.path().join("obj.fits");

        let fetcher = HttpImageFetcher::new(Duration::from_secs(5)).unwrap();
        assert!(fetcher.fetch(&url, &destination).await);
        assert_eq!(std::fs::read(&destination).unwrap(), b"SIMPLE  = T / fake fits");

        // No leftover partial files
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_http_fetcher_error_status_leaves_nothing() {
        let url = serve_once("404 Not Found", b"missing").await;
        let dir = tempdir().unwrap();
        let destination = dir.path().join("obj.fits");

        let fetcher = HttpImageFetcher::new(Duration::from_secs(5)).unwrap();
        assert!(!fetcher.fetch(&url, &destination).await);
        assert!(!destination.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
