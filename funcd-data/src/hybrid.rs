//! Hybrid client: the HTTP+JSON interface to an API node's runner
//! control-plane endpoints. Used on runner and LB nodes, normally behind
//! a [`CachedAccess`](crate::CachedAccess).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use funcd_core::models::{App, Call, Func, Route, Trigger, TriggerType};
use funcd_core::{Error, Result};

use crate::DataAccess;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `POST /v1/runner/finish`: the completed record plus its log.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FinishBody {
    pub call: Call,
    #[serde(default)]
    pub log: String,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
pub struct HybridClient {
    base: String,
    http: reqwest::Client,
}

impl HybridClient {
    /// Build a client against `runner-api-url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Fatal(format!("building hybrid client: {e}")))?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Translate a response into the domain taxonomy. 5xx and transport
    /// failures surface as `Upstream` so the cache never pins them.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_else(|_| status.to_string());
        Err(match status {
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::CONFLICT => Error::Conflict(message),
            StatusCode::BAD_REQUEST => Error::Validation(message),
            StatusCode::SERVICE_UNAVAILABLE => Error::NodeDraining,
            _ => Error::Upstream(format!("{status}: {message}")),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(Error::upstream)?;
        Self::check(resp).await?.json().await.map_err(Error::upstream)
    }

    async fn post_json<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(Error::upstream)?;
        Self::check(resp).await.map(|_| ())
    }
}

#[async_trait]
impl DataAccess for HybridClient {
    async fn get_app_by_id(&self, id: &str) -> Result<App> {
        self.get_json(&format!("/v1/runner/apps/{id}")).await
    }

    async fn get_app_by_name(&self, name: &str) -> Result<App> {
        // The server resolves the segment as an id first, then a name.
        self.get_json(&format!("/v1/runner/apps/{name}")).await
    }

    async fn get_route(&self, app_name: &str, path: &str) -> Result<Route> {
        self.get_json(&format!("/v1/runner/apps/{app_name}/routes{path}"))
            .await
    }

    async fn get_fn(&self, id: &str) -> Result<Func> {
        self.get_json(&format!("/v1/runner/fns/{id}")).await
    }

    async fn get_trigger_by_source(
        &self,
        app_id: &str,
        trigger_type: TriggerType,
        source: &str,
    ) -> Result<Trigger> {
        self.get_json(&format!(
            "/v1/runner/triggers?app_id={app_id}&type={}&source={source}",
            trigger_type.as_str()
        ))
        .await
    }

    async fn insert_call(&self, call: &Call) -> Result<()> {
        self.post_json("/v1/runner/start", call).await
    }

    async fn finish_call(&self, call: &Call, log: Bytes) -> Result<()> {
        let body = FinishBody {
            call: call.clone(),
            log: base64::engine::general_purpose::STANDARD.encode(&log),
        };
        self.post_json("/v1/runner/finish", &body).await
    }

    async fn enqueue(&self, call: &Call) -> Result<()> {
        let resp = self
            .http
            .put(self.url("/v1/runner/async"))
            .json(call)
            .send()
            .await
            .map_err(Error::upstream)?;
        Self::check(resp).await.map(|_| ())
    }

    async fn dequeue(&self) -> Result<Option<Call>> {
        let resp = self
            .http
            .get(self.url("/v1/runner/async"))
            .send()
            .await
            .map_err(Error::upstream)?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::check(resp)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(Error::upstream)
    }

    async fn delete_from_queue(&self, call_id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/v1/runner/async/{call_id}")))
            .send()
            .await
            .map_err(Error::upstream)?;
        Self::check(resp).await.map(|_| ())
    }
}
