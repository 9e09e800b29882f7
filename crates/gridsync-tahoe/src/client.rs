//! HTTP client for the node's local web API

use crate::api::{GridApi, Node};
use crate::capability::Capability;
use crate::error::{Result, TahoeError};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Body, Client, Response};
use std::path::Path;
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Endpoint {
    nodeurl: String,
    token: String,
}

/// [`GridApi`] over `reqwest`.
///
/// Starts disconnected; [`GridApi::connect`] is called once the node has
/// written its `node.url`.
pub struct CapabilityClient {
    http: Client,
    endpoint: RwLock<Option<Endpoint>>,
}

impl CapabilityClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: RwLock::new(None),
        })
    }

    /// A client already pointed at `nodeurl`
    pub fn connected(nodeurl: &str, api_token: &str) -> Result<Self> {
        let client = Self::new()?;
        client.connect(nodeurl, api_token)?;
        Ok(client)
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().ok().and_then(|e| e.clone())
    }

    fn require_endpoint(&self) -> Result<Endpoint> {
        self.endpoint().ok_or(TahoeError::NotRunning)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TahoeError::Web {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn text(response: Response) -> Result<String> {
        Ok(Self::check(response).await?.text().await?)
    }
}

/// Map a connection failure to "no result"
fn absent_if_unreachable<T>(result: reqwest::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_connect() => {
            debug!("Node unreachable: {}", e);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl GridApi for CapabilityClient {
    fn connect(&self, nodeurl: &str, api_token: &str) -> Result<()> {
        let mut nodeurl = nodeurl.trim().to_string();
        if !nodeurl.ends_with('/') {
            nodeurl.push('/');
        }
        let mut endpoint = self
            .endpoint
            .write()
            .map_err(|_| TahoeError::Config("endpoint lock poisoned".into()))?;
        *endpoint = Some(Endpoint {
            nodeurl,
            token: api_token.trim().to_string(),
        });
        Ok(())
    }

    fn node_url(&self) -> Option<String> {
        self.endpoint().map(|e| e.nodeurl)
    }

    async fn mkdir(&self) -> Result<Capability> {
        let ep = self.require_endpoint()?;
        let response = self
            .http
            .post(format!("{}uri", ep.nodeurl))
            .query(&[("t", "mkdir")])
            .send()
            .await?;
        Ok(Capability::new(Self::text(response).await?))
    }

    async fn upload(&self, local_path: &Path) -> Result<Capability> {
        let ep = self.require_endpoint()?;
        debug!("Uploading {}...", local_path.display());
        let file = tokio::fs::File::open(local_path).await?;
        let response = self
            .http
            .put(format!("{}uri", ep.nodeurl))
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        let cap = Capability::new(Self::text(response).await?);
        debug!("Successfully uploaded {}", local_path.display());
        Ok(cap)
    }

    async fn download(&self, cap: &Capability, local_path: &Path) -> Result<()> {
        let ep = self.require_endpoint()?;
        debug!("Downloading {}...", local_path.display());
        let response = self
            .http
            .get(format!("{}uri/{}", ep.nodeurl, cap))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        debug!("Successfully downloaded {}", local_path.display());
        Ok(())
    }

    async fn link(&self, dircap: &Capability, childname: &str, childcap: &Capability) -> Result<()> {
        let ep = self.require_endpoint()?;
        let response = self
            .http
            .post(format!("{}uri/{}/", ep.nodeurl, dircap))
            .query(&[("t", "uri"), ("name", childname), ("uri", childcap.as_str())])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn unlink(&self, dircap: &Capability, childname: &str) -> Result<()> {
        let ep = self.require_endpoint()?;
        let response = self
            .http
            .post(format!("{}uri/{}/", ep.nodeurl, dircap))
            .query(&[("t", "unlink"), ("name", childname)])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_json(&self, cap: &Capability) -> Result<Option<Node>> {
        let Some(ep) = self.endpoint() else {
            return Ok(None);
        };
        if cap.as_str().is_empty() {
            return Ok(None);
        }
        let request = self
            .http
            .get(format!("{}uri/{}/", ep.nodeurl, cap))
            .query(&[("t", "json")])
            .send()
            .await;
        let Some(response) = absent_if_unreachable(request)? else {
            return Ok(None);
        };
        let body = Self::text(response).await?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    async fn status_page(&self, structured: bool) -> Result<Option<String>> {
        let Some(ep) = self.endpoint() else {
            return Ok(None);
        };
        let mut request = self.http.get(&ep.nodeurl);
        if structured {
            request = request.query(&[("t", "json")]);
        }
        let Some(response) = absent_if_unreachable(request.send().await)? else {
            return Ok(None);
        };
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Status page request failed");
            return Ok(None);
        }
        Ok(Some(response.text().await?))
    }

    async fn magic_folder_status(&self, name: Option<&str>) -> Result<Option<serde_json::Value>> {
        let Some(ep) = self.endpoint() else {
            return Ok(None);
        };
        if ep.token.is_empty() {
            return Ok(None);
        }
        let mut form = vec![("token", ep.token.as_str()), ("t", "json")];
        if let Some(name) = name {
            form.push(("name", name));
        }
        let request = self
            .http
            .post(format!("{}magic_folder", ep.nodeurl))
            .form(&form)
            .send()
            .await;
        let Some(response) = absent_if_unreachable(request)? else {
            return Ok(None);
        };
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Magic-folder status request failed");
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }
}
