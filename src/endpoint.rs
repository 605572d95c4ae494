use url::Url;

use crate::{Error, Result};

/// Resolved ingestion API URLs.
///
/// Paths are appended to the configured base, so `https://host/ingest` resolves capture
/// requests to `https://host/ingest/capture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    capture: Url,
    batch: Url,
    identify: Url,
}

impl Endpoint {
    /// Parse `base` and derive the capture, batch and identify URLs.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidEndpoint`] if `base` is not an absolute URL.
    pub fn new(base: &str) -> Result<Endpoint> {
        let mut base = Url::parse(base).map_err(Error::InvalidEndpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let join = |path: &str| base.join(path).map_err(Error::InvalidEndpoint);

        Ok(Endpoint {
            capture: join("capture")?,
            batch: join("batch")?,
            identify: join("identify")?,
        })
    }

    /// `POST` target for single capture events.
    pub fn capture(&self) -> &Url {
        &self.capture
    }

    /// `POST` target for batches of capture events.
    pub fn batch(&self) -> &Url {
        &self.batch
    }

    /// `POST` target for identify events.
    pub fn identify(&self) -> &Url {
        &self.identify
    }
}
