//! Page-by-page traversal of platform inventories.
//!
//! Platform list calls take a 1-based page number and a page size; a page
//! shorter than the page size is the last one. `pages` turns such a call into
//! a lazy stream that restarts from page one every time it is created.

use std::future::Future;

use async_stream::try_stream;
use futures::Stream;

use crate::cancel::{CancellationToken, cancellable, ensure_active};
use crate::error::DeployError;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// Streams pages produced by `fetch` until a short page is returned.
///
/// Cancellation is checked before every page request.
pub fn pages<'a, T, F, Fut>(
    cancel: &'a CancellationToken,
    page_size: u32,
    mut fetch: F,
) -> impl Stream<Item = Result<Vec<T>, DeployError>> + 'a
where
    T: 'a,
    F: FnMut(PageRequest) -> Fut + 'a,
    Fut: Future<Output = Result<Vec<T>, DeployError>> + 'a,
{
    let page_size = page_size.max(1);
    try_stream! {
        let mut page = 1u32;
        loop {
            ensure_active(cancel)?;
            let request = PageRequest { page, page_size };
            let items = cancellable(cancel, fetch(request)).await?;
            let count = items.len();
            log::debug!("[paging] page {page} returned {count} item(s)");
            if count > 0 {
                yield items;
            }
            if count < page_size as usize {
                break;
            }
            page += 1;
        }
    }
}
