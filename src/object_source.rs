use crate::config::Config;
use crate::error::Error;
use log::debug;
use reqwest::{header::AUTHORIZATION, Client, StatusCode, Url};
use std::fs;
use std::path::PathBuf;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    /// Downloads an object in full.
    /// # Arguments
    /// * `bucket` - The bucket the object was dropped into.
    /// * `name` - The object name, `dataset/account/.../table.ext`.
    /// # Returns
    /// A Result containing either the object's bytes or an Error.
    async fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>, Error>;
}

/// Buckets mirrored on local disk as `{root}/{bucket}/{name}`.
#[derive(Clone)]
pub struct LocalObjectSource {
    root: PathBuf,
}

impl LocalObjectSource {
    pub fn new(config: &Config) -> Self {
        LocalObjectSource {
            root: PathBuf::from(&config.object_root),
        }
    }
}

#[async_trait::async_trait]
impl ObjectSource for LocalObjectSource {
    async fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>, Error> {
        let path = self.root.join(bucket).join(name);

        if fs::metadata(&path).is_err() {
            return Err(Error::ObjectNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }

        debug!("reading {}", path.display());
        Ok(fs::read(&path)?)
    }
}

/// Objects served over HTTP as `{base_url}/{bucket}/{name}`.
#[derive(Clone)]
pub struct HttpObjectSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectSource {
    pub fn new(base_url: &str, config: &Config) -> Self {
        HttpObjectSource {
            client: Client::new(),
            base_url: base_url.to_string(),
            token: config.object_token.clone(),
        }
    }

    fn object_url(&self, bucket: &str, name: &str) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .push(bucket)
            .extend(name.split('/'));
        Ok(url)
    }
}

#[async_trait::async_trait]
impl ObjectSource for HttpObjectSource {
    async fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>, Error> {
        let url = self.object_url(bucket, name)?;
        debug!("downloading {}", url);

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let resp = request.send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::ObjectNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            }),
            _ => {
                let resp = resp.error_for_status()?;
                Ok(resp.bytes().await?.to_vec())
            }
        }
    }
}
