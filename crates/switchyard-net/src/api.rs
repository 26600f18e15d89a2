//! HTTP implementation of the credential API
//!
//! | Call | Request | `data` payload |
//! |------|---------|----------------|
//! | OpenVPN / IKEv2 credentials | `GET ServerCredentials?type=` | base64 `username`, `password` |
//! | WireGuard peer | `POST WgConfigs/init` `{public_key}` | peer fields |
//! | OpenVPN template | `GET ServerConfigs?ovpn_version=` | base64 config text |
//!
//! Every response is wrapped as `{"data": ...}`.

use crate::client::{HttpClient, HttpError, Response};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use switchyard_core::{ApiError, CredentialApi, UserPass, WireGuardGrant};
use tracing::debug;

const OPENVPN_VERSION: &str = "2.6";

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncodedUserPass {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct WireGuardPeer {
    preshared_key: String,
    allowed_ips: String,
    address: String,
    dns: String,
}

impl From<HttpError> for ApiError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Timeout => ApiError::Timeout,
            other => ApiError::Network(other.to_string()),
        }
    }
}

fn decode_field(name: &str, value: &str) -> Result<String, ApiError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| ApiError::InvalidResponse(format!("{} is not base64: {}", name, e)))?;
    String::from_utf8(bytes).map_err(|_| ApiError::InvalidResponse(format!("{} is not UTF-8", name)))
}

fn check_status(response: &Response) -> Result<(), ApiError> {
    match response.status.as_u16() {
        401 | 403 => Err(ApiError::Unauthorized),
        _ if response.is_success() => Ok(()),
        code => Err(ApiError::Status(code)),
    }
}

fn parse_data<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice::<Envelope<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

pub(crate) fn parse_user_pass(body: &[u8]) -> Result<UserPass, ApiError> {
    let encoded: EncodedUserPass = parse_data(body)?;
    Ok(UserPass::new(
        decode_field("username", &encoded.username)?,
        decode_field("password", &encoded.password)?,
    ))
}

pub(crate) fn parse_wireguard(body: &[u8]) -> Result<WireGuardGrant, ApiError> {
    let peer: WireGuardPeer = parse_data(body)?;
    Ok(WireGuardGrant {
        preshared_key: peer.preshared_key,
        allowed_ips: peer.allowed_ips,
        address: peer.address,
        dns: peer.dns,
    })
}

pub(crate) fn parse_template(body: &[u8]) -> Result<String, ApiError> {
    let encoded: String = parse_data(body)?;
    decode_field("config", &encoded)
}

/// [`CredentialApi`] over HTTPS
pub struct HttpCredentialApi {
    client: HttpClient,
    base_url: url::Url,
}

impl HttpCredentialApi {
    /// `session_token` is sent as a bearer token on every call
    pub fn new(base_url: &str, session_token: Option<&str>, mut client: HttpClient) -> Result<Self, ApiError> {
        let mut base_url = url::Url::parse(base_url).map_err(|e| ApiError::Network(format!("bad API URL: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        if let Some(token) = session_token {
            client
                .set_default_header("authorization", &format!("Bearer {}", token))
                .map_err(|e| ApiError::Network(e.to_string()))?;
        }

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<String, ApiError> {
        self.base_url
            .join(path)
            .map(String::from)
            .map_err(|e| ApiError::Network(e.to_string()))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.endpoint(path)?;
        debug!("API GET {}", url);
        let response = self.client.get(&url).await?;
        check_status(&response)?;
        Ok(response.body)
    }

    async fn user_pass(&self, kind: &str) -> Result<UserPass, ApiError> {
        let body = self.get(&format!("ServerCredentials?type={}", kind)).await?;
        parse_user_pass(&body)
    }
}

#[async_trait]
impl CredentialApi for HttpCredentialApi {
    async fn fetch_openvpn_credentials(&self) -> Result<UserPass, ApiError> {
        self.user_pass("openvpn").await
    }

    async fn fetch_ikev2_credentials(&self) -> Result<UserPass, ApiError> {
        self.user_pass("ikev2").await
    }

    async fn fetch_wireguard_credentials(&self, client_public_key: &str) -> Result<WireGuardGrant, ApiError> {
        let url = self.endpoint("WgConfigs/init")?;
        let payload = serde_json::json!({ "public_key": client_public_key });
        let body = serde_json::to_vec(&payload).map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        debug!("API POST {}", url);
        let response = self.client.post(&url, body).await?;
        check_status(&response)?;
        parse_wireguard(&response.body)
    }

    async fn fetch_server_config_template(&self) -> Result<String, ApiError> {
        let body = self.get(&format!("ServerConfigs?ovpn_version={}", OPENVPN_VERSION)).await?;
        parse_template(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use hyper::header::HeaderMap;
    use std::time::Duration;

    fn response(code: u16) -> Response {
        Response {
            status: StatusCode::from_u16(code).unwrap(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_user_pass_decoded() {
        let body = format!(
            r#"{{"data":{{"username":"{}","password":"{}"}}}}"#,
            STANDARD.encode("alice"),
            STANDARD.encode("s3cret")
        );
        let creds = parse_user_pass(body.as_bytes()).unwrap();
        assert_eq!(creds, UserPass::new("alice", "s3cret"));
    }

    #[test]
    fn test_bad_base64_rejected() {
        let body = br#"{"data":{"username":"!!!","password":"cGFzcw=="}}"#;
        assert!(matches!(parse_user_pass(body), Err(ApiError::InvalidResponse(_))));
    }

    #[test]
    fn test_template_decoded() {
        let body = format!(r#"{{"data":"{}"}}"#, STANDARD.encode("client\ndev tun\n"));
        assert_eq!(parse_template(body.as_bytes()).unwrap(), "client\ndev tun\n");
    }

    #[test]
    fn test_wireguard_peer() {
        let body = br#"{"data":{"preshared_key":"cHNr","allowed_ips":"0.0.0.0/0","address":"100.64.0.9/32","dns":"10.255.255.1"}}"#;
        let grant = parse_wireguard(body).unwrap();
        assert_eq!(grant.address, "100.64.0.9/32");
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(&response(200)).is_ok());
        assert!(matches!(check_status(&response(401)), Err(ApiError::Unauthorized)));
        assert!(matches!(check_status(&response(403)), Err(ApiError::Unauthorized)));
        assert!(matches!(check_status(&response(502)), Err(ApiError::Status(502))));
    }

    #[test]
    fn test_endpoint_join() {
        let api = HttpCredentialApi::new("https://api.example.net/v1", Some("tok"), HttpClient::with_defaults()).unwrap();
        assert_eq!(
            api.endpoint("WgConfigs/init").unwrap(),
            "https://api.example.net/v1/WgConfigs/init"
        );
    }
}
