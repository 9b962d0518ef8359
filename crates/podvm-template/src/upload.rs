//! Stream a disk image to a lease device URL.

use std::fs::File;
use std::io::{self, Read};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::{Body, Client};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::cancel::Cancellation;
use crate::error::{ImportError, ImportResult};

/// Content type for stream-optimized VMDK uploads.
pub const STREAM_VMDK_CONTENT_TYPE: &str = "application/x-vnd.vmware-streamVmdk";

/// One disk upload: local file, remote URL and byte count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub path: Utf8PathBuf,
    pub url: String,
    pub len: u64,
}

impl UploadTarget {
    /// Build a target, reading the length from the file.
    pub fn new(path: &Utf8Path, url: impl Into<String>) -> ImportResult<Self> {
        let len = path
            .metadata()
            .map_err(|e| ImportError::Transfer(format!("reading {path}: {e}")))?
            .len();
        Ok(Self {
            path: path.to_owned(),
            url: url.into(),
            len,
        })
    }
}

/// Something that can push a disk to a device URL.
pub trait Uploader {
    /// Upload `target`; must stop early once `cancel` is tripped.
    fn upload(&self, target: &UploadTarget, cancel: &Cancellation) -> ImportResult<()>;
}

/// HTTPS POST uploader.
#[derive(Debug)]
pub struct HttpUploader {
    client: Client,
    progress: bool,
}

impl HttpUploader {
    pub fn new(verify_ssl: bool, progress: bool) -> ImportResult<Self> {
        // No overall deadline: disk images take as long as they take
        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| ImportError::Transfer(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, progress })
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, target: &UploadTarget, cancel: &Cancellation) -> ImportResult<()> {
        let file = File::open(&target.path)
            .map_err(|e| ImportError::Transfer(format!("opening {}: {e}", target.path)))?;
        let reader = CancellableReader {
            inner: file,
            cancel: cancel.clone(),
        };

        let pb = if self.progress {
            let pb = ProgressBar::new(target.len);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                )
                .map_err(|e| ImportError::Transfer(e.to_string()))?
                .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };
        let body = Body::sized(pb.wrap_read(reader), target.len);

        debug!("POST {} ({} bytes)", target.url, target.len);
        let result = self
            .client
            .post(&target.url)
            .header(CONTENT_TYPE, STREAM_VMDK_CONTENT_TYPE)
            .body(body)
            .send();
        pb.finish_and_clear();

        // A tripped token surfaces as a body read error; report it as such
        cancel.check()?;
        let resp = result.map_err(|e| ImportError::Transfer(format!("{}: {e}", target.url)))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().unwrap_or_default();
            return Err(ImportError::Transfer(format!(
                "server returned HTTP {status}: {}",
                detail.trim()
            )));
        }
        debug!("Upload finished with HTTP {status}");
        Ok(())
    }
}

/// Reader that fails once the run is cancelled.
struct CancellableReader<R> {
    inner: R,
    cancel: Cancellation,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("upload cancelled"));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_target_reads_length() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(td.path().join("disk.vmdk")).unwrap();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 4096])
            .unwrap();
        let t = UploadTarget::new(&path, "https://host/disk-0").unwrap();
        assert_eq!(t.len, 4096);
        assert_eq!(t.url, "https://host/disk-0");
    }

    #[test]
    fn test_target_missing_file() {
        let err = UploadTarget::new(Utf8Path::new("/nonexistent/disk.vmdk"), "https://h/d")
            .unwrap_err();
        assert!(matches!(err, ImportError::Transfer(_)));
    }

    #[test]
    fn test_cancellable_reader_stops() {
        let cancel = Cancellation::new();
        let mut r = CancellableReader {
            inner: &b"abcdef"[..],
            cancel: cancel.clone(),
        };
        let mut buf = [0u8; 3];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        cancel.cancel();
        assert!(r.read(&mut buf).is_err());
    }

    #[test]
    fn test_upload_missing_file_is_transfer_error() {
        let uploader = HttpUploader::new(false, false).unwrap();
        let target = UploadTarget {
            path: "/nonexistent/disk.vmdk".into(),
            url: "https://127.0.0.1:1/disk-0".into(),
            len: 0,
        };
        let err = uploader.upload(&target, &Cancellation::new()).unwrap_err();
        assert!(matches!(err, ImportError::Transfer(_)));
    }
}
