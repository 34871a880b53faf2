//! An HTTP client that fetches the datafile from its URL.

use std::time::Duration;

use url::Url;

use crate::datafile::DatafileContent;
use crate::{Error, Result};

/// Hook replacing the built-in HTTP fetch. Receives the configured datafile
/// URL and returns the parsed datafile.
///
/// Useful for custom transports (bundled files, alternative protocols) and
/// for exercising refresh behavior in tests without a network.
pub type DatafileFetchHandler = dyn Fn(&str) -> Result<DatafileContent> + Send + Sync;

/// Transport knobs applied when building the HTTP client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpOptions {
    /// Total per-request timeout. No timeout when unset.
    pub timeout: Option<Duration>,
    /// Timeout for establishing the connection. No timeout when unset.
    pub connect_timeout: Option<Duration>,
}

/// A client that fetches the datafile over HTTP.
pub struct DatafileFetcher {
    // Client holds a connection pool internally, so we're reusing the client
    // between requests.
    client: reqwest::Client,
    url: Url,
}

impl DatafileFetcher {
    /// Validate the URL and build the client.
    pub fn new(url: &str, http_options: &HttpOptions) -> Result<DatafileFetcher> {
        let url = Url::parse(url).map_err(Error::InvalidUrl)?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = http_options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(connect_timeout) = http_options.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        let client = builder.build()?;

        Ok(DatafileFetcher { client, url })
    }

    pub async fn fetch(&self) -> Result<DatafileContent> {
        log::debug!(target: "featurekit", url:display = self.url; "fetching datafile");

        let response = self.client.get(self.url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "featurekit", status:display = status; "received non-success response while fetching datafile");
            return Err(Error::FetchStatus(status));
        }

        let body = response.text().await?;
        let datafile = DatafileContent::from_json(&body)?;

        log::debug!(target: "featurekit", revision = datafile.revision.as_str(); "successfully fetched datafile");

        Ok(datafile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        let result = DatafileFetcher::new("not a url", &HttpOptions::default());
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn accepts_http_options() {
        let options = HttpOptions {
            timeout: Some(Duration::from_secs(10)),
            connect_timeout: Some(Duration::from_secs(2)),
        };
        assert!(DatafileFetcher::new("https://cdn.example.com/datafile.json", &options).is_ok());
    }
}
