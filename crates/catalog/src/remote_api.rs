//! Client for a remote catalog control plane.
//!
//! Used instead of a storage backend when the connection string names a
//! remote host with credentials (`Provider::is_remote`).

use crate::error::{CatalogError, CatalogResult};
use reqwest::Url;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::OnceCell;
use tracing::debug;
use vmcatalog_core::{Manifest, Provider};

const LOGIN_PATH: &str = "/api/v1/auth/token";
const CATALOG_PATH: &str = "/api/v1/catalog";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Clone, Debug)]
enum Credentials {
    ApiKey(String),
    Password { username: String, password: String },
}

pub struct RemoteCatalogClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
    bearer: OnceCell<String>,
}

impl RemoteCatalogClient {
    pub fn new(provider: &Provider) -> CatalogResult<Self> {
        let base = provider.get_url();
        if base.is_empty() {
            return Err(CatalogError::Validation(
                "remote catalog connection has no host".to_string(),
            ));
        }
        let base_url = Url::parse(&base)
            .map_err(|e| CatalogError::Validation(format!("invalid remote catalog URL: {e}")))?;
        let credentials = if !provider.api_key.is_empty() {
            Credentials::ApiKey(provider.api_key.clone())
        } else if !provider.username.is_empty() && !provider.password.is_empty() {
            Credentials::Password {
                username: provider.username.clone(),
                password: provider.password.clone(),
            }
        } else {
            return Err(CatalogError::Validation(
                "remote catalog connection needs an api_key or username and password".to_string(),
            ));
        };
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            credentials,
            bearer: OnceCell::new(),
        })
    }

    fn url(&self, path: &str) -> CatalogResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| CatalogError::Validation(format!("failed to build API URL: {e}")))
    }

    async fn authorize(&self, req: reqwest::RequestBuilder) -> CatalogResult<reqwest::RequestBuilder> {
        match &self.credentials {
            Credentials::ApiKey(key) => Ok(req.header("X-Api-Key", key)),
            Credentials::Password { username, password } => {
                let token = self
                    .bearer
                    .get_or_try_init(|| self.login(username, password))
                    .await?;
                Ok(req.bearer_auth(token))
            }
        }
    }

    async fn login(&self, username: &str, password: &str) -> CatalogResult<String> {
        debug!(user = username, "requesting remote catalog token");
        let url = self.url(LOGIN_PATH)?;
        let request = self.http.post(url).json(&LoginRequest {
            email: username,
            password,
        });
        let response: LoginResponse = Self::read_json(request.send().await?).await?;
        Ok(response.token)
    }

    async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> CatalogResult<T> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CatalogError::Remote {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> CatalogResult<T> {
        let response = self.authorize(req).await?.send().await?;
        Self::read_json(response).await
    }

    /// Fetch the manifest for a download, including its provider.
    pub async fn get_download_manifest(
        &self,
        catalog_id: &str,
        version: &str,
        architecture: &str,
    ) -> CatalogResult<Manifest> {
        let url = self.url(&format!(
            "{CATALOG_PATH}/{catalog_id}/{version}/{architecture}/download"
        ))?;
        self.send_json(self.http.get(url)).await
    }

    /// Register a pushed manifest with the control plane.
    pub async fn post_manifest(&self, manifest: &Manifest) -> CatalogResult<Manifest> {
        let url = self.url(CATALOG_PATH)?;
        self.send_json(self.http.post(url).json(manifest)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn can_bind_localhost() -> bool {
        std::net::TcpListener::bind("127.0.0.1:0").is_ok()
    }

    fn provider_for(server: &MockServer, credentials: &str) -> Provider {
        Provider::parse(&format!("host={};{credentials}", server.base_url())).unwrap()
    }

    #[test]
    fn requires_credentials() {
        let provider = Provider::parse("host=catalog.example.com").unwrap();
        let err = RemoteCatalogClient::new(&provider).err().unwrap();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn api_key_goes_in_header() {
        if !can_bind_localhost() {
            eprintln!("skipping: cannot bind localhost");
            return;
        }
        let server = MockServer::start_async().await;
        let manifest = Manifest::new("ubuntu", "22.04", "x86_64");
        let body = serde_json::to_value(&manifest).unwrap();
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/catalog/ubuntu/22.04/x86_64/download")
                    .header("X-Api-Key", "k-123");
                then.status(200).json_body(body);
            })
            .await;

        let client = RemoteCatalogClient::new(&provider_for(&server, "api_key=k-123")).unwrap();
        let got = client
            .get_download_manifest("ubuntu", "22.04", "x86_64")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(got.name, "ubuntu-x86_64-22_04");
    }

    #[tokio::test]
    async fn password_login_is_cached() {
        if !can_bind_localhost() {
            eprintln!("skipping: cannot bind localhost");
            return;
        }
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/auth/token")
                    .json_body(serde_json::json!({"email": "admin", "password": "pw"}));
                then.status(200).json_body(serde_json::json!({"token": "jwt-1"}));
            })
            .await;
        let manifest = Manifest::new("debian", "12", "arm64");
        let body = serde_json::to_value(&manifest).unwrap();
        let post = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/catalog")
                    .header("Authorization", "Bearer jwt-1");
                then.status(201).json_body(body);
            })
            .await;

        let client =
            RemoteCatalogClient::new(&provider_for(&server, "username=admin;password=pw")).unwrap();
        client.post_manifest(&manifest).await.unwrap();
        client.post_manifest(&manifest).await.unwrap();
        login.assert_hits_async(1).await;
        post.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn upstream_status_is_preserved() {
        if !can_bind_localhost() {
            eprintln!("skipping: cannot bind localhost");
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(404).body("catalog not found");
            })
            .await;

        let client = RemoteCatalogClient::new(&provider_for(&server, "api_key=k")).unwrap();
        let err = client
            .get_download_manifest("nope", "1", "x86_64")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(err.to_string().contains("catalog not found"));
    }
}
