//! Entity listing against the platform API.
//!
//! Listings are cursor-paginated: each page carries `links.next`, a full URL whose
//! `page[cursor]` parameter is replayed on the same path until no next link remains.

pub mod models;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

use crate::errors::{Error, Result};
use crate::http::{ApiRequest, HttpClient};
use crate::metrics::{MetricCatalog, MetricDescriptor};
use crate::transport::Transport;
use models::{
    Campaign, CampaignAttributes, Flow, FlowAttributes, Form, FormAttributes, List, ListAttributes,
    MetricAttributes, Page, Resource,
};

const CURSOR_PARAM: &str = "page[cursor]";

pub struct PlatformApi<H: HttpClient> {
    transport: Arc<Transport<H>>,
    max_pages: usize,
}

impl<H: HttpClient> Clone for PlatformApi<H> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            max_pages: self.max_pages,
        }
    }
}

impl<H: HttpClient> PlatformApi<H> {
    pub fn new(transport: Arc<Transport<H>>, max_pages: usize) -> Self {
        Self {
            transport,
            max_pages: max_pages.max(1),
        }
    }

    pub fn transport(&self) -> &Arc<Transport<H>> {
        &self.transport
    }

    pub async fn list_flows(&self) -> Result<Vec<Flow>> {
        let resources = self.list_all::<FlowAttributes>(ApiRequest::get("flows/")).await?;
        Ok(resources.into_iter().map(Flow::from).collect())
    }

    pub async fn list_campaigns(&self, channel: &str) -> Result<Vec<Campaign>> {
        let request =
            ApiRequest::get("campaigns/").with_query("filter", format!("equals(messages.channel,'{channel}')"));
        let resources = self.list_all::<CampaignAttributes>(request).await?;
        Ok(resources
            .into_iter()
            .map(|r| Campaign::from_resource(r, channel))
            .collect())
    }

    pub async fn list_lists(&self) -> Result<Vec<List>> {
        let request = ApiRequest::get("lists/").with_query("additional-fields[list]", "profile_count");
        let resources = self.list_all::<ListAttributes>(request).await?;
        Ok(resources.into_iter().map(List::from).collect())
    }

    pub async fn list_forms(&self) -> Result<Vec<Form>> {
        let resources = self.list_all::<FormAttributes>(ApiRequest::get("forms/")).await?;
        Ok(resources.into_iter().map(Form::from).collect())
    }

    /// Follow `links.next` until exhausted or `max_pages` pages were read.
    #[tracing::instrument(skip(self, request), fields(route = %request.route()))]
    async fn list_all<A: DeserializeOwned>(&self, request: ApiRequest) -> Result<Vec<Resource<A>>> {
        let mut resources = Vec::new();
        let mut next_request = Some(request);
        let mut pages = 0;

        while let Some(request) = next_request.take() {
            let page: Page<A> = self.transport.send_json(&request).await?;
            pages += 1;
            resources.extend(page.data);

            if let Some(next) = page.links.next {
                if pages >= self.max_pages {
                    tracing::warn!(pages, "Listing exceeded page limit, returning truncated results");
                    break;
                }
                next_request = Some(with_cursor(request, &next)?);
            }
        }

        tracing::debug!(pages, count = resources.len(), "Listing complete");
        Ok(resources)
    }
}

/// Replace the cursor on `request` with the one carried by a `links.next` URL.
fn with_cursor(mut request: ApiRequest, next: &str) -> Result<ApiRequest> {
    let url = Url::parse(next).map_err(|e| Error::malformed(format!("invalid next link '{next}': {e}")))?;
    let cursor = url
        .query_pairs()
        .find(|(k, _)| k == CURSOR_PARAM)
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| Error::malformed(format!("next link without cursor: {next}")))?;

    request.query.retain(|(k, _)| k != CURSOR_PARAM);
    request.query.push((CURSOR_PARAM.to_string(), cursor));
    Ok(request)
}

#[async_trait]
impl<H: HttpClient + 'static> MetricCatalog for PlatformApi<H> {
    async fn fetch_metrics(&self) -> Result<Vec<MetricDescriptor>> {
        let resources = self.list_all::<MetricAttributes>(ApiRequest::get("metrics/")).await?;
        Ok(resources
            .into_iter()
            .map(|r| MetricDescriptor {
                identifier: r.id,
                name: r.attributes.name,
                source_integration: r.attributes.integration.as_ref().and_then(|i| i.identifier()),
                created_at: r.attributes.created,
            })
            .collect())
    }
}
