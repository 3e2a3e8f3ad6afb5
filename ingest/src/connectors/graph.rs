//! Microsoft Graph paging shared by the calendar and mail adapters.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::error::ConnectorResult;
use super::http;
use super::types::{ChangeType, Page, Source};
use crate::config::IngestConfig;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;

/// One page of a Graph collection or delta query.
#[derive(Debug, Deserialize)]
pub struct GraphPage<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

impl<T> GraphPage<T> {
    /// `nextLink` continues the query; `deltaLink` on the last page is the
    /// resume token.
    pub fn into_page<U>(self, map: impl FnMut(T) -> U) -> Page<U> {
        let items = self.value.into_iter().map(map).collect();
        match self.next_link {
            Some(next) => Page::more(items, next),
            None => Page::last(items, self.delta_link),
        }
    }
}

pub struct GraphClient {
    client: Client,
    api_base: String,
    page_size: u32,
}

impl GraphClient {
    pub fn new(source: &Source, config: &IngestConfig) -> ConnectorResult<Self> {
        Ok(Self {
            client: http::build_client(config)?,
            api_base: http::base_url(source, "api_base_url", GRAPH_API_BASE),
            page_size: source.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// GET a path under the API base, or a provider-issued link.
    pub async fn get_json<T: DeserializeOwned>(&self, bearer: &str, url: &str, context: &str) -> ConnectorResult<T> {
        http::ensure_under_base(url, &self.api_base)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .header("Prefer", format!("odata.maxpagesize={}", self.page_size))
            .send()
            .await?;
        let response = http::check_response(response, context).await?;
        Ok(response.json().await?)
    }

    /// Raw body, or `None` once it grows past `max_bytes`.
    pub async fn get_bytes(
        &self,
        bearer: &str,
        url: &str,
        context: &str,
        max_bytes: u64,
    ) -> ConnectorResult<Option<Vec<u8>>> {
        http::ensure_under_base(url, &self.api_base)?;

        let response = self.client.get(url).bearer_auth(bearer).send().await?;
        let response = http::check_response(response, context).await?;
        http::read_capped(response, max_bytes).await
    }

    /// Cheap authenticated call.
    pub async fn me(&self, bearer: &str) -> ConnectorResult<()> {
        let _: serde_json::Value = self.get_json(bearer, &self.url("/me?$select=id"), "me").await?;
        Ok(())
    }

    /// Every page of a plain collection.
    pub async fn get_all<T: DeserializeOwned>(&self, bearer: &str, url: String, context: &str) -> ConnectorResult<Vec<T>> {
        let mut all = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next {
            let page: GraphPage<T> = self.get_json(bearer, &url, context).await?;
            all.extend(page.value);
            next = page.next_link;
        }
        Ok(all)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: Option<EmailAddress>,
}

impl Recipient {
    pub fn address(&self) -> Option<&str> {
        self.email_address.as_ref()?.address.as_deref()
    }
}

/// `created` when the item was never modified after creation.
pub fn change_type(created: Option<&str>, modified: Option<&str>) -> ChangeType {
    match (created, modified) {
        (Some(created), Some(modified)) if created == modified => ChangeType::Created,
        _ => ChangeType::Updated,
    }
}
