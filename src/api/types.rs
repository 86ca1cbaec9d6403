//! Wire types shared by several endpoints.

use serde::{Deserialize, Serialize};

/// One page of a paginated list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResult<T> {
  pub results: Vec<T>,
  #[serde(default)]
  pub next: Option<String>,
  /// Total item count, when the server reports it.
  #[serde(default)]
  pub count: Option<u64>,
}
