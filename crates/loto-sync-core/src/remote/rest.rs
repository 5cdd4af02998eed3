//! REST client for a PostgREST-style hosted database.
//!
//! Tables live under `{base}/rest/v1/{table}`; filters use the `column=eq.value`
//! convention and writes ask for the stored representation back.

use super::RemoteStore;
use crate::error::{Result, StoreError};
use crate::model::{Row, Table};
use crate::query::{Filter, Query};
use async_trait::async_trait;
use loto_sync_config::RemoteConfig;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REST_PREFIX: &str = "rest/v1";

#[derive(Debug, Clone)]
pub struct RestRemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        Self::new(&config.url, &config.api_key, config.request_timeout())
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/{}/{}", self.base_url, REST_PREFIX, table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn send_for_rows(&self, builder: RequestBuilder) -> Result<Vec<Row>> {
        let response = expect_success(self.authorized(builder).send().await?).await?;
        Ok(response.json::<Vec<Row>>().await?)
    }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        debug!(table = %table, "Remote query");
        let builder = self
            .client
            .get(self.table_url(table))
            .query(&query_params(query));
        self.send_for_rows(builder).await
    }

    async fn insert(&self, table: Table, row: &Row) -> Result<Row> {
        let builder = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(row);
        first_row(self.send_for_rows(builder).await?, table, None)
    }

    async fn update(&self, table: Table, id: i64, row: &Row) -> Result<Row> {
        let builder = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(row);
        first_row(self.send_for_rows(builder).await?, table, Some(id))
    }

    async fn delete(&self, table: Table, id: i64) -> Result<()> {
        let builder = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        expect_success(self.authorized(builder).send().await?).await?;
        Ok(())
    }

    async fn delete_all(&self, table: Table) -> Result<()> {
        // PostgREST refuses unfiltered deletes; match every row instead.
        let builder = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", "not.is.null")]);
        expect_success(self.authorized(builder).send().await?).await?;
        Ok(())
    }
}

async fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(StoreError::RemoteRejected {
        status: status.as_u16(),
        message,
    })
}

fn first_row(rows: Vec<Row>, table: Table, id: Option<i64>) -> Result<Row> {
    rows.into_iter().next().ok_or_else(|| StoreError::RemoteRejected {
        status: 404,
        message: match id {
            Some(id) => format!("no {} row with id {}", table, id),
            None => format!("{} write returned no row", table),
        },
    })
}

fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];

    if let Some(Filter::Eq(column, value)) = &query.filter {
        let param = match value {
            Value::Null => "is.null".to_string(),
            other => format!("eq.{}", filter_value(other)),
        };
        params.push((column.clone(), param));
    }

    if let Some(order) = &query.order_by {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push((
            "order".to_string(),
            format!("{}.{}", order.column, direction),
        ));
    }

    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }

    params
}
