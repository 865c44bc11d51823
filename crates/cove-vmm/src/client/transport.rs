//! JSON over HTTP/1.1 on a unix domain socket.

use crate::error::{Result, VmError};
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One hyper client bound to one hypervisor's control socket.
///
/// Each VM gets its own transport so connections are never shared between
/// hypervisor processes. No retries happen here.
#[derive(Debug, Clone)]
pub(crate) struct UnixTransport {
    socket_path: PathBuf,
    base_path: &'static str,
    client: Client<UnixConnector>,
}

impl UnixTransport {
    pub(crate) fn new(socket_path: impl AsRef<Path>, base_path: &'static str) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            base_path,
            client: Client::unix(),
        }
    }

    pub(crate) fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub(crate) async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let bytes = serde_json::to_vec(body)?;
        self.send(Method::PUT, path, Some(bytes)).await.map(drop)
    }

    /// PUT without a request body (Cloud-Hypervisor action endpoints).
    pub(crate) async fn put_empty(&self, path: &str) -> Result<()> {
        self.send(Method::PUT, path, None).await.map(drop)
    }

    pub(crate) async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let bytes = serde_json::to_vec(body)?;
        self.send(Method::PATCH, path, Some(bytes)).await.map(drop)
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.send(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let full_path = format!("{}{}", self.base_path, path);
        let uri: hyper::Uri = Uri::new(&self.socket_path, &full_path).into();

        tracing::trace!(%method, path = %full_path, "Control API request");

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder.body(body)?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() {
            return Ok(bytes);
        }

        let message = String::from_utf8_lossy(&bytes).to_string();
        tracing::error!(
            %method,
            path = %full_path,
            status = %status,
            message = %message,
            "Control API error"
        );
        Err(VmError::Api {
            status: status.as_u16(),
            message,
        })
    }
}
