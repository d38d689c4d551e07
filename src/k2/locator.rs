//! Object Locator
//!
//! Resolves logical entities to array-side handles by searching collections
//! with field filters. A search that succeeds with zero hits yields `None`;
//! a search the array could not answer is an error. Callers decide whether
//! absence is benign (idempotent deletes) or fatal ([`ResilientClient::require`]).

use crate::domain::ports::ApiRequest;
use crate::error::{Error, Result};
use crate::k2::client::{decode, ResilientClient};
use crate::k2::objects::{K2Resource, ObjRef};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Field filters for a collection search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pairs: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on the resource's name field
    pub fn name<T: K2Resource>(name: &str) -> Self {
        Self::new().eq(T::NAME_FIELD, name)
    }

    pub fn eq(mut self, field: &str, value: impl ToString) -> Self {
        self.pairs.push((field.to_string(), value.to_string()));
        self
    }

    /// Filter on a reference field
    pub fn reference(self, field: &str, target: &ObjRef) -> Self {
        self.eq(field, &target.path)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    fn describe(&self) -> String {
        if self.pairs.is_empty() {
            return "*".to_string();
        }
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Search response of a collection
#[derive(Debug, Clone)]
pub struct SearchResult<T> {
    pub hits: Vec<T>,
    pub total: u64,
}

#[derive(Deserialize)]
struct RawSearch {
    hits: Vec<Value>,
    #[serde(default)]
    total: Option<u64>,
}

impl<T> SearchResult<T> {
    pub fn first(self) -> Option<T> {
        self.hits.into_iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl ResilientClient {
    /// Search a collection
    pub async fn search<T: K2Resource>(&self, filter: &Filter) -> Result<SearchResult<T>> {
        let path = format!("/{}", T::COLLECTION);
        debug!("Searching {} ({}) on K2 {}", T::KIND, filter.describe(), self.label());

        let request = ApiRequest::get(path.clone()).with_query(filter.pairs().to_vec());
        let value = self.execute(request).await?;
        let raw: RawSearch = serde_json::from_value(value).map_err(|e| Error::MalformedResponse {
            path: path.clone(),
            reason: format!("search response without hits: {}", e),
        })?;

        let total = raw.total.unwrap_or(raw.hits.len() as u64);
        let hits = raw
            .hits
            .into_iter()
            .map(|hit| decode(&path, hit))
            .collect::<Result<Vec<T>>>()?;

        Ok(SearchResult { hits, total })
    }

    /// First match of a search, or `None` when nothing matches
    pub async fn find<T: K2Resource>(&self, filter: &Filter) -> Result<Option<T>> {
        Ok(self.search(filter).await?.first())
    }

    pub async fn find_by_name<T: K2Resource>(&self, name: &str) -> Result<Option<T>> {
        self.find(&Filter::name::<T>(name)).await
    }

    /// Like [`find_by_name`](Self::find_by_name), but absence is an error
    pub async fn require<T: K2Resource>(&self, name: &str) -> Result<T> {
        self.find_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found(T::KIND, name))
    }

    /// Fetch the object a reference points to
    pub async fn resolve<T: K2Resource>(&self, reference: &ObjRef) -> Result<T> {
        let id = reference.id().ok_or_else(|| Error::MalformedResponse {
            path: reference.path.clone(),
            reason: "reference without an object id".to_string(),
        })?;
        self.get(id).await
    }

    /// Number of objects matching a filter
    pub async fn count<T: K2Resource>(&self, filter: &Filter) -> Result<u64> {
        Ok(self.search::<T>(filter).await?.total)
    }

    /// Delete every object matching the filter; returns how many were deleted
    pub async fn delete_matching<T: K2Resource>(&self, filter: &Filter) -> Result<usize> {
        let found = self.search::<T>(filter).await?;
        let mut deleted = 0;
        for object in &found.hits {
            self.delete(object).await?;
            deleted += 1;
        }
        if deleted > 0 {
            debug!(
                "Deleted {} {}(s) matching {} on K2 {}",
                deleted,
                T::KIND,
                filter.describe(),
                self.label()
            );
        }
        Ok(deleted)
    }

    pub async fn delete_by_name<T: K2Resource>(&self, name: &str) -> Result<usize> {
        self.delete_matching::<T>(&Filter::name::<T>(name)).await
    }
}
