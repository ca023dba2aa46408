//! HTTP transport and resource loading for Snap3D

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::poller::{ResourceLoader, TaskTransport};
use super::{GltfModel, StatusRequest, StatusResponse, SubmitBody, SubmitResponse, Texture};
use crate::config::GatewayConfig;
use crate::error::{TaskError, UNKNOWN_ERROR_CODE};

const GLB_MAGIC: &[u8; 4] = b"glTF";

/// Posts JSON to `<base>/submit` and `<base>/get_status`, token in the query.
#[derive(Debug, Clone)]
pub struct HttpTaskTransport {
    client: Client,
    base_url: String,
    token_param: String,
    api_token: String,
}

impl HttpTaskTransport {
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: &GatewayConfig) -> Self {
        Self {
            client,
            base_url: config.snap3d_url.trim_end_matches('/').to_string(),
            token_param: config.token_param.clone(),
            api_token: config.api_token.clone(),
        }
    }

    fn endpoint(&self, name: &str) -> Result<url::Url, TaskError> {
        let mut url = url::Url::parse(&format!("{}/{}", self.base_url, name))
            .map_err(|e| TaskError::transport(UNKNOWN_ERROR_CODE, e.to_string()))?;
        url.query_pairs_mut()
            .append_pair(&self.token_param, &self.api_token);
        Ok(url)
    }

    async fn post<B, R>(&self, name: &str, body: &B) -> Result<R, TaskError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(name)?;
        debug!("POST {}", name);

        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            warn!("Snap3D {} returned {}", name, status);
            return Err(TaskError::transport(status.as_u16() as i64, text));
        }

        serde_json::from_str(&text).map_err(|e| {
            TaskError::transport(UNKNOWN_ERROR_CODE, format!("invalid {} response: {}", name, e))
        })
    }
}

#[async_trait]
impl TaskTransport for HttpTaskTransport {
    async fn submit(&self, body: &SubmitBody) -> Result<SubmitResponse, TaskError> {
        self.post("submit", body).await
    }

    async fn get_status(&self, task_id: &str) -> Result<StatusResponse, TaskError> {
        let body = StatusRequest {
            task_id: task_id.to_string(),
        };
        self.post("get_status", &body).await
    }
}

/// Downloads artifacts and checks they decode.
#[derive(Debug, Clone, Default)]
pub struct HttpResourceLoader {
    client: Client,
}

impl HttpResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TaskError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TaskError::resource(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TaskError::resource(format!("GET {} returned {}", url, status)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TaskError::resource(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ResourceLoader for HttpResourceLoader {
    async fn load_texture(&self, url: &str) -> Result<Texture, TaskError> {
        let bytes = self.fetch(url).await?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| TaskError::resource(format!("texture decode failed: {}", e)))?;
        Ok(Texture { image })
    }

    async fn load_model(&self, url: &str) -> Result<GltfModel, TaskError> {
        let bytes = self.fetch(url).await?;
        validate_gltf(bytes)
    }
}

fn validate_gltf(bytes: Vec<u8>) -> Result<GltfModel, TaskError> {
    if bytes.starts_with(GLB_MAGIC) {
        return Ok(GltfModel {
            bytes,
            binary: true,
        });
    }
    // JSON glTF must at least carry the asset header
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) if value.get("asset").is_some() => Ok(GltfModel {
            bytes,
            binary: false,
        }),
        _ => Err(TaskError::resource("payload is not a glTF asset")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snap3d::{SubmitRequest, TaskStatus};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> GatewayConfig {
        GatewayConfig {
            snap3d_url: format!("{}/snap3d/", server.uri()),
            ..GatewayConfig::with_token("tok")
        }
    }

    #[tokio::test]
    async fn test_submit_posts_body_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/snap3d/submit"))
            .and(query_param("api-token", "tok"))
            .and(body_json(json!({
                "prompt": "a lamp",
                "format": "glb",
                "refine": true,
                "use_vertex_color": false,
                "use_case": "Spectacles"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": true, "task_id": "t-9"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTaskTransport::new(&gateway(&server));
        let body = SubmitBody {
            request: SubmitRequest::new("a lamp"),
            use_case: "Spectacles".to_string(),
        };
        let response = transport.submit(&body).await.unwrap();
        assert_eq!(response.task_id, "t-9");
    }

    #[tokio::test]
    async fn test_get_status_and_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/snap3d/get_status"))
            .and(body_json(json!({"task_id": "t-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "running",
                "stage": "image_gen",
                "artifacts": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/snap3d/get_status"))
            .and(body_json(json!({"task_id": "t-2"})))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let transport = HttpTaskTransport::new(&gateway(&server));
        let status = transport.get_status("t-1").await.unwrap();
        assert_eq!(status.status, TaskStatus::Running);

        let err = transport.get_status("t-2").await.unwrap_err();
        assert_eq!(err.code(), 401);
        assert_eq!(err.message(), "bad token");
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/snap3d/get_status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let transport = HttpTaskTransport::new(&gateway(&server));
        let err = transport.get_status("t-1").await.unwrap_err();
        assert!(matches!(err, TaskError::Transport { code: -1, .. }));
    }

    #[tokio::test]
    async fn test_loader_decodes_texture_and_models() {
        let server = MockServer::start().await;

        let mut png = Vec::new();
        image::DynamicImage::new_rgba8(3, 2)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        Mock::given(method("GET"))
            .and(path("/img.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mesh.glb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"glTF\x02\x00\x00\x00".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mesh.gltf"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"asset":{"version":"2.0"}}"#))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.glb"))
            .respond_with(ResponseTemplate::new(200).set_body_string("nope"))
            .mount(&server)
            .await;

        let loader = HttpResourceLoader::new();
        let texture = loader.load_texture(&format!("{}/img.png", server.uri())).await.unwrap();
        assert_eq!((texture.width(), texture.height()), (3, 2));

        let glb = loader.load_model(&format!("{}/mesh.glb", server.uri())).await.unwrap();
        assert!(glb.binary);
        let gltf = loader.load_model(&format!("{}/mesh.gltf", server.uri())).await.unwrap();
        assert!(!gltf.binary);

        let err = loader.load_model(&format!("{}/broken.glb", server.uri())).await.unwrap_err();
        assert_eq!(err.code(), -1);
        let err = loader.load_texture(&format!("{}/missing.png", server.uri())).await.unwrap_err();
        assert!(matches!(err, TaskError::Resource { .. }));
    }
}
