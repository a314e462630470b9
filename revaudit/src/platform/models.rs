//! Wire types for the platform's JSON:API listings and the entities built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of a listing endpoint.
#[derive(Debug, Deserialize)]
pub struct Page<A> {
    pub data: Vec<Resource<A>>,
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Deserialize)]
pub struct Resource<A> {
    pub id: String,
    pub attributes: A,
}

#[derive(Debug, Default, Deserialize)]
pub struct Links {
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricAttributes {
    pub name: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub integration: Option<IntegrationRef>,
}

/// The integration that minted a metric, when it did not come from the platform itself.
#[derive(Debug, Deserialize)]
pub struct IntegrationRef {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl IntegrationRef {
    /// Stable identifier of the integration, preferring its key over its display name.
    pub fn identifier(&self) -> Option<String> {
        self.key
            .as_deref()
            .or(self.name.as_deref())
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct FlowAttributes {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CampaignAttributes {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub send_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ListAttributes {
    pub name: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profile_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FormAttributes {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// An automated message sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
    pub archived: bool,
    pub trigger_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Resource<FlowAttributes>> for Flow {
    fn from(r: Resource<FlowAttributes>) -> Self {
        Self {
            id: r.id,
            name: r.attributes.name,
            status: r.attributes.status,
            archived: r.attributes.archived,
            trigger_type: r.attributes.trigger_type,
            created_at: r.attributes.created,
        }
    }
}

/// A manually scheduled send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub channel: String,
    pub status: Option<String>,
    pub archived: bool,
    pub send_time: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn from_resource(r: Resource<CampaignAttributes>, channel: &str) -> Self {
        Self {
            id: r.id,
            name: r.attributes.name,
            channel: channel.to_string(),
            status: r.attributes.status,
            archived: r.attributes.archived,
            send_time: r.attributes.send_time,
            created_at: r.attributes.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub id: String,
    pub name: String,
    pub profile_count: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Resource<ListAttributes>> for List {
    fn from(r: Resource<ListAttributes>) -> Self {
        Self {
            id: r.id,
            name: r.attributes.name,
            profile_count: r.attributes.profile_count,
            created_at: r.attributes.created,
        }
    }
}

/// A signup form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Form {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Resource<FormAttributes>> for Form {
    fn from(r: Resource<FormAttributes>) -> Self {
        Self {
            id: r.id,
            name: r.attributes.name,
            status: r.attributes.status,
            created_at: r.attributes.created_at,
        }
    }
}
