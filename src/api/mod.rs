//! HTTP plumbing for the backend API.

mod dispatcher;
mod retry;
mod types;

pub use dispatcher::{Anonymous, Dispatcher, Request, TokenSource};
pub use retry::RetryPolicy;
pub use types::PagedResult;

use std::collections::BTreeMap;

/// Query parameters. Kept sorted so that equal parameter sets always
/// serialize identically, whatever order the caller built them in.
pub type Params = BTreeMap<String, String>;
