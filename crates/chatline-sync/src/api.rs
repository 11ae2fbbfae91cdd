//! HTTP client for the read-only seed endpoints: the conversation list, a
//! single conversation, and the settings document.

use crate::error::ApiError;
use chatline_core::{Conversation, Settings};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(base_url)?;
        // Url::join drops the last segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let url = self.base_url.join("conversations")?;
        self.get_json(url).await
    }

    /// Fetches one conversation; `Ok(None)` when the server reports 404.
    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, ApiError> {
        let mut url = self.base_url.join("conversations")?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(id);

        let res = self.http.get(url).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if res.status().is_success() {
            Ok(Some(res.json::<Conversation>().await?))
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }

    pub async fn get_settings(&self) -> Result<Settings, ApiError> {
        let url = self.base_url.join("settings")?;
        self.get_json(url).await
    }

    async fn get_json<T>(&self, url: Url) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let res = self.http.get(url).send().await?;

        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }
}
