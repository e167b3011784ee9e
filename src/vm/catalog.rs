//! Restore image catalog.
//!
//! [`IpswCatalog`] queries an ipsw.me-style firmware listing for the virtual
//! Mac device and picks the newest signed restore image.
//!
//! ```text
//! GET https://api.ipsw.me/v4/device/VirtualMac2,1?type=ipsw
//! { "identifier": "VirtualMac2,1",
//!   "firmwares": [ { "version": "15.1", "buildid": "24B83",
//!                    "url": "https://…/UniversalMac_15.1_24B83_Restore.ipsw",
//!                    "filesize": 17000000000, "signed": true }, … ] }
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::vm::{ImageDescriptor, OsVersion};

/// Source of restore images usable on this host.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// The most capable image this host can use, or `None` if the catalog
    /// lists none. `Err` means the catalog could not be queried.
    async fn latest_supported(&self) -> Result<Option<ImageDescriptor>>;
}

#[derive(Debug, Deserialize)]
struct DeviceListing {
    #[serde(default)]
    firmwares: Vec<FirmwareEntry>,
}

#[derive(Debug, Deserialize)]
struct FirmwareEntry {
    version: String,
    buildid: String,
    url: String,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    signed: bool,
}

/// HTTP catalog backed by an ipsw.me-compatible JSON listing.
#[derive(Debug, Clone)]
pub struct IpswCatalog {
    listing_url: Url,
    client: reqwest::Client,
}

impl IpswCatalog {
    pub fn new(listing_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("macvm/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build catalog HTTP client")?;
        Ok(Self {
            listing_url,
            client,
        })
    }
}

#[async_trait]
impl ImageCatalog for IpswCatalog {
    async fn latest_supported(&self) -> Result<Option<ImageDescriptor>> {
        info!(url = %self.listing_url, "querying restore image catalog");

        let listing: DeviceListing = self
            .client
            .get(self.listing_url.clone())
            .send()
            .await
            .with_context(|| format!("GET {}", self.listing_url))?
            .error_for_status()
            .context("catalog returned an error status")?
            .json()
            .await
            .context("decode catalog listing")?;

        debug!(entries = listing.firmwares.len(), "catalog listing received");
        Ok(select_latest(listing))
    }
}

/// Newest signed entry with a parseable version and URL.
fn select_latest(listing: DeviceListing) -> Option<ImageDescriptor> {
    listing
        .firmwares
        .into_iter()
        .filter(|entry| entry.signed)
        .filter_map(|entry| {
            Some(ImageDescriptor {
                version: OsVersion::parse(&entry.version)?,
                url: Url::parse(&entry.url).ok()?,
                build: entry.buildid,
                size: entry.filesize,
            })
        })
        .max_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.build.cmp(&b.build))
        })
}
