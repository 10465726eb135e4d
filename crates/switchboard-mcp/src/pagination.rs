//! Cursor-based pagination shared by `tools/list` and `resources/list`.

use std::collections::HashSet;
use std::future::Future;

use crate::error::{McpError, Result};

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Drain a paginated listing.
///
/// Calls `fetch` with `None`, then with each returned cursor until a page
/// comes back without one, concatenating items in order.  A cursor that
/// repeats would loop forever and is reported as a protocol error against
/// `server`.
pub async fn fetch_all<T, F, Fut>(server: &str, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = fetch(cursor.take()).await?;
        items.extend(page.items);

        match page.next_cursor {
            None => break,
            Some(next) => {
                if !seen.insert(next.clone()) {
                    return Err(McpError::Protocol {
                        server: server.to_owned(),
                        reason: format!("pagination cursor `{next}` repeated"),
                    });
                }
                cursor = Some(next);
            }
        }
    }

    Ok(items)
}
