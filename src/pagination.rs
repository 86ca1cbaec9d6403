//! Aggregation of paginated list endpoints into one collection.

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::api::{PagedResult, Params};
use crate::cache::{CacheConfig, CacheLayer, CacheStorage};
use crate::error::{ApiError, ApiResult};

pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Page cap used when the total item count is unknown.
pub const FALLBACK_MAX_PAGES: usize = 1000;

/// How to walk a paginated endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
  /// Items per page, at least 1. Must match the server's default unless
  /// `page_size_param` is set.
  page_size: usize,
  /// Query parameter carrying the 1-based page number
  pub page_param: String,
  /// Query parameter to send the page size in, if the server accepts one
  pub page_size_param: Option<String>,
  /// Known total, used to bound the number of requests
  pub expected_total: Option<usize>,
}

impl Default for PageRequest {
  fn default() -> Self {
    Self {
      page_size: DEFAULT_PAGE_SIZE,
      page_param: "page".to_string(),
      page_size_param: None,
      expected_total: None,
    }
  }
}

impl PageRequest {
  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Send the page size explicitly under `param` (e.g. "page_size").
  pub fn with_page_size_param(mut self, param: impl Into<String>) -> Self {
    self.page_size_param = Some(param.into());
    self
  }

  pub fn with_expected_total(mut self, total: usize) -> Self {
    self.expected_total = Some(total);
    self
  }

  /// `ceil(total / page_size) + 1` for a known total, otherwise
  /// [`FALLBACK_MAX_PAGES`].
  pub fn max_pages(&self, total: Option<usize>) -> usize {
    match total {
      Some(total) => total.div_ceil(self.page_size).saturating_add(1),
      None => FALLBACK_MAX_PAGES,
    }
  }

  fn params_for(&self, base: &Params, page: usize) -> Params {
    let mut params = base.clone();
    params.insert(self.page_param.clone(), page.to_string());
    if let Some(size_param) = &self.page_size_param {
      params.insert(size_param.clone(), self.page_size.to_string());
    }
    params
  }
}

/// Items collected across every fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregated<T> {
  pub items: Vec<T>,
  /// Number of pages requested
  pub pages: usize,
  /// Stopped at the page cap before the server reported the end
  pub truncated: bool,
}

/// Fetch every page of `path` through the cache layer and concatenate the
/// results.
///
/// Stops when the server reports no `next` page, or when a page comes back
/// shorter than the page size, whichever happens first. If the caller gave
/// no total, the first page's `count` bounds the walk. Any page error is
/// returned as-is and the partial collection is discarded.
pub async fn fetch_all<C, T>(
  cache: &CacheLayer<C>,
  path: &str,
  params: &Params,
  config: CacheConfig,
  request: &PageRequest,
) -> ApiResult<Aggregated<T>>
where
  C: CacheStorage + 'static,
  T: DeserializeOwned,
{
  let mut items = Vec::new();
  let mut max_pages = request.max_pages(request.expected_total);
  let mut pages = 0;

  loop {
    if pages >= max_pages {
      warn!(path, pages, items = items.len(), "pagination cap reached, result truncated");
      return Ok(Aggregated {
        items,
        pages,
        truncated: true,
      });
    }

    let page = pages + 1;
    let result = cache
      .get(path, &request.params_for(params, page), config)
      .await?;
    let page_data: PagedResult<T> = serde_json::from_value(result.data)
      .map_err(|e| ApiError::Decode(format!("page {} of {}: {}", page, path, e)))?;
    pages = page;

    if page == 1 && request.expected_total.is_none() {
      if let Some(count) = page_data.count {
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        max_pages = request.max_pages(Some(count));
      }
    }

    let received = page_data.results.len();
    items.extend(page_data.results);
    debug!(path, page, received, total = items.len(), "page fetched");

    if page_data.next.is_none() || received < request.page_size {
      break;
    }
  }

  Ok(Aggregated {
    items,
    pages,
    truncated: false,
  })
}
