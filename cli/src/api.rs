// Local HTTP API of a running endpoint
//
// `peerstore endpoint start` serves the endpoint's client operations on
// 127.0.0.1:<api_port>; the `client` subcommands talk to it.
//
//   GET  /endpoint                 -> {"uuid", "name", "listen_address", "relay_address"}
//   GET  /get?key=&endpoint=       -> 200 bytes | 404
//   POST /set?key=&endpoint=       -> 200 {"key"}   (body = bytes; key optional)
//   GET  /exists?key=&endpoint=    -> 200 {"exists"}
//   POST /evict?key=&endpoint=     -> 200
//   POST /shutdown                 -> 200, then the endpoint closes
//
// `endpoint` defaults to the serving endpoint's own id.

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use peerstore_core::{Endpoint, EndpointId, Key, ObjectId, PeerStoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointInfoResponse {
    pub uuid: String,
    pub name: String,
    pub listen_address: String,
    pub relay_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetResponse {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn api_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Object selector sent as query parameters
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub key: Option<String>,
    pub endpoint: Option<String>,
}

impl Target {
    fn query(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(key) = &self.key {
            query.append_pair("key", key);
        }
        if let Some(endpoint) = &self.endpoint {
            query.append_pair("endpoint", endpoint);
        }
        query.finish()
    }

    /// `key` may be a bare object id or a full `<endpoint-uuid>/<object-id>` key
    pub fn parse(key: &str, endpoint: Option<String>) -> Self {
        match (key.parse::<Key>(), endpoint) {
            (Ok(full), None) => Self {
                key: Some(full.object_id.to_string()),
                endpoint: Some(full.owner.to_string()),
            },
            (_, endpoint) => Self {
                key: Some(key.to_string()),
                endpoint,
            },
        }
    }
}

// Client functions for CLI commands

async fn call(port: u16, method: Method, path: &str, target: &Target, body: Body) -> Result<(StatusCode, Vec<u8>)> {
    let client = hyper::Client::new();
    let query = target.query();
    let uri = if query.is_empty() {
        format!("http://{}{}", api_addr(port), path)
    } else {
        format!("http://{}{}?{}", api_addr(port), path, query)
    };
    let req = Request::builder().method(method).uri(uri).body(body)?;

    let resp = client
        .request(req)
        .await
        .with_context(|| format!("No endpoint API on port {} (is `endpoint start` running?)", port))?;
    let status = resp.status();
    let body_bytes = hyper::body::to_bytes(resp.into_body()).await?;
    Ok((status, body_bytes.to_vec()))
}

fn api_error(status: StatusCode, body: &[u8]) -> anyhow::Error {
    let message = serde_json::from_slice::<ErrorResponse>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    anyhow::anyhow!("API request failed with status {}: {}", status, message)
}

pub async fn endpoint_info_via_api(port: u16) -> Result<EndpointInfoResponse> {
    let (status, body) = call(port, Method::GET, "/endpoint", &Target::default(), Body::empty()).await?;
    if !status.is_success() {
        return Err(api_error(status, &body));
    }
    serde_json::from_slice(&body).context("Failed to parse endpoint response")
}

pub async fn get_via_api(port: u16, target: &Target) -> Result<Option<Vec<u8>>> {
    let (status, body) = call(port, Method::GET, "/get", target, Body::empty()).await?;
    match status {
        StatusCode::OK => Ok(Some(body)),
        StatusCode::NOT_FOUND => Ok(None),
        _ => Err(api_error(status, &body)),
    }
}

pub async fn set_via_api(port: u16, target: &Target, bytes: Vec<u8>) -> Result<String> {
    let (status, body) = call(port, Method::POST, "/set", target, Body::from(bytes)).await?;
    if !status.is_success() {
        return Err(api_error(status, &body));
    }
    let response: SetResponse = serde_json::from_slice(&body).context("Failed to parse set response")?;
    Ok(response.key)
}

pub async fn exists_via_api(port: u16, target: &Target) -> Result<bool> {
    let (status, body) = call(port, Method::GET, "/exists", target, Body::empty()).await?;
    if !status.is_success() {
        return Err(api_error(status, &body));
    }
    let response: ExistsResponse =
        serde_json::from_slice(&body).context("Failed to parse exists response")?;
    Ok(response.exists)
}

pub async fn evict_via_api(port: u16, target: &Target) -> Result<()> {
    let (status, body) = call(port, Method::POST, "/evict", target, Body::empty()).await?;
    if !status.is_success() {
        return Err(api_error(status, &body));
    }
    Ok(())
}

pub async fn stop_endpoint_via_api(port: u16) -> Result<()> {
    let (status, body) = call(port, Method::POST, "/shutdown", &Target::default(), Body::empty()).await?;
    if !status.is_success() {
        return Err(api_error(status, &body));
    }
    Ok(())
}

// Server implementation

pub struct ApiContext {
    pub endpoint: Arc<Endpoint>,
    pub shutdown: Arc<Notify>,
}

/// HTTP status for a failed endpoint operation
pub fn status_for(error: &PeerStoreError) -> StatusCode {
    match error {
        PeerStoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PeerStoreError::ObjectTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PeerStoreError::PeerUnreachable(_)
        | PeerStoreError::NegotiationFailed(_)
        | PeerStoreError::RegistrationRejected(_) => StatusCode::BAD_GATEWAY,
        PeerStoreError::RequestTimeout { .. } | PeerStoreError::PeerTimeout => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(value)?))?)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Result<Response<Body>> {
    json_response(
        status,
        &ErrorResponse {
            error: message.into(),
        },
    )
}

fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Key from `key` and `endpoint` query parameters; the owner defaults to `local`
fn key_from_params(
    params: &HashMap<String, String>,
    local: EndpointId,
) -> std::result::Result<Option<Key>, String> {
    let owner = match params.get("endpoint").filter(|e| !e.is_empty()) {
        Some(endpoint) => endpoint
            .parse::<EndpointId>()
            .map_err(|e| e.to_string())?,
        None => local,
    };
    Ok(params
        .get("key")
        .filter(|k| !k.is_empty())
        .map(|k| Key::new(owner, ObjectId::new(k.as_str()))))
}

async fn handle_request(
    req: Request<Body>,
    ctx: Arc<ApiContext>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/endpoint") => handle_endpoint_info(ctx),
        (&Method::GET, "/get") => handle_get(req, ctx).await,
        (&Method::POST, "/set") => handle_set(req, ctx).await,
        (&Method::GET, "/exists") => handle_exists(req, ctx).await,
        (&Method::POST, "/evict") => handle_evict(req, ctx).await,
        (&Method::POST, "/shutdown") => {
            ctx.shutdown.notify_one();
            json_response(StatusCode::OK, &serde_json::json!({ "stopping": true }))
        }
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    };

    Ok(response.unwrap_or_else(|e| {
        let mut fallback = Response::new(Body::from(format!("Error: {}", e)));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    }))
}

fn handle_endpoint_info(ctx: Arc<ApiContext>) -> Result<Response<Body>> {
    let identity = ctx.endpoint.identity();
    json_response(
        StatusCode::OK,
        &EndpointInfoResponse {
            uuid: identity.endpoint_id.to_string(),
            name: identity.display_name.clone(),
            listen_address: identity.listen_address.to_string(),
            relay_address: identity.relay_address.clone(),
        },
    )
}

/// The key a request names, or the 400 response explaining why it names none
fn required_key(req: &Request<Body>, ctx: &ApiContext) -> std::result::Result<Key, String> {
    match key_from_params(&query_params(req), ctx.endpoint.id())? {
        Some(key) => Ok(key),
        None => Err("missing key parameter".to_string()),
    }
}

async fn handle_get(req: Request<Body>, ctx: Arc<ApiContext>) -> Result<Response<Body>> {
    let key = match required_key(&req, &ctx) {
        Ok(key) => key,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    match ctx.endpoint.get(&key).await {
        Ok(Some(bytes)) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/octet-stream")
            .body(Body::from(bytes))?),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("{} not found", key)),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

async fn handle_set(req: Request<Body>, ctx: Arc<ApiContext>) -> Result<Response<Body>> {
    let key = match key_from_params(&query_params(&req), ctx.endpoint.id()) {
        Ok(key) => key,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let body_bytes = hyper::body::to_bytes(req.into_body()).await?;
    match ctx.endpoint.put(body_bytes.to_vec(), key).await {
        Ok(key) => json_response(
            StatusCode::OK,
            &SetResponse {
                key: key.to_string(),
            },
        ),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

async fn handle_exists(req: Request<Body>, ctx: Arc<ApiContext>) -> Result<Response<Body>> {
    let key = match required_key(&req, &ctx) {
        Ok(key) => key,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    match ctx.endpoint.exists(&key).await {
        Ok(exists) => json_response(StatusCode::OK, &ExistsResponse { exists }),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

async fn handle_evict(req: Request<Body>, ctx: Arc<ApiContext>) -> Result<Response<Body>> {
    let key = match required_key(&req, &ctx) {
        Ok(key) => key,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    match ctx.endpoint.evict(&key).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "evicted": key.to_string() })),
        Err(e) => error_response(status_for(&e), e.to_string()),
    }
}

/// Serve until `/shutdown` is called or `stop` resolves
pub async fn start_api_server<F>(ctx: ApiContext, port: u16, stop: F) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let ctx = Arc::new(ctx);
    let shutdown = Arc::clone(&ctx.shutdown);
    let addr = api_addr(port);

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, ctx.clone()))) }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind API on {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.notified() => {}
                _ = stop => {}
            }
        });

    tracing::info!("Endpoint API listening on {}", addr);

    server.await.context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_splits_full_key() {
        let owner = EndpointId::generate();
        let target = Target::parse(&format!("{}/obj-1", owner), None);
        assert_eq!(target.key.as_deref(), Some("obj-1"));
        assert_eq!(target.endpoint, Some(owner.to_string()));

        let bare = Target::parse("obj-1", None);
        assert_eq!(bare.key.as_deref(), Some("obj-1"));
        assert_eq!(bare.endpoint, None);
    }

    #[test]
    fn test_query_round_trips_through_params() {
        let owner = EndpointId::generate();
        let target = Target {
            key: Some("a b&c".to_string()),
            endpoint: Some(owner.to_string()),
        };
        let params: HashMap<String, String> =
            url::form_urlencoded::parse(target.query().as_bytes())
                .into_owned()
                .collect();
        let key = key_from_params(&params, EndpointId::generate())
            .unwrap()
            .unwrap();
        assert_eq!(key, Key::new(owner, "a b&c"));
    }

    #[test]
    fn test_key_defaults_to_local_owner() {
        let local = EndpointId::generate();
        let mut params = HashMap::new();
        assert_eq!(key_from_params(&params, local).unwrap(), None);
        params.insert("key".to_string(), "1".to_string());
        assert_eq!(
            key_from_params(&params, local).unwrap(),
            Some(Key::new(local, "1"))
        );
        params.insert("endpoint".to_string(), "not-a-uuid".to_string());
        assert!(key_from_params(&params, local).is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&PeerStoreError::ObjectTooLarge { size: 2, max: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&PeerStoreError::PeerUnreachable(EndpointId::generate())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&PeerStoreError::RequestTimeout { attempts: 4 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&PeerStoreError::PeerTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&PeerStoreError::Storage("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
