//! Paginated response envelope for infinite-scroll clients.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{FeedPage, PostRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope<T> {
    pub data: Vec<T>,
    pub links: Links,
    pub meta: Meta,
    #[serde(rename = "scrollCursor")]
    pub scroll_cursor: ScrollCursor,
}

/// Relative query strings, e.g. `?page=2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Links {
    pub first: String,
    pub last: String,
    pub prev: Option<String>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub current_page: u32,
    pub from: Option<u64>,
    pub last_page: u32,
    pub per_page: u32,
    pub to: Option<u64>,
    pub total: u64,
    /// When the page was computed; older than now by at most the cache TTL.
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollCursor {
    pub page_name: String,
    pub previous_page: Option<u32>,
    pub current_page: u32,
    pub next_page: Option<u32>,
}

impl<T> Envelope<T> {
    /// Replace the items while keeping links and metadata.
    pub fn map_data<U, F>(self, f: F) -> Envelope<U>
    where
        F: FnOnce(Vec<T>) -> Vec<U>,
    {
        Envelope {
            data: f(self.data),
            links: self.links,
            meta: self.meta,
            scroll_cursor: self.scroll_cursor,
        }
    }
}

pub fn build(page: &FeedPage, page_name: &str) -> Envelope<PostRef> {
    let current = page.current_page.max(1);
    let empty = page.total == 0 || page.last_page == 0;

    let previous_page = (current > 1).then(|| current - 1);
    let next_page = (!empty && current < page.last_page).then(|| current + 1);

    let data = if empty { Vec::new() } else { page.items.clone() };
    let (from, to) = match data.len() as u64 {
        0 => (None, None),
        len => {
            let from = u64::from(current - 1) * u64::from(page.per_page) + 1;
            (Some(from), Some(from + len - 1))
        }
    };

    let link = |n: u32| format!("?{}={}", page_name, n);

    Envelope {
        data,
        links: Links {
            first: link(1),
            last: link(page.last_page.max(1)),
            prev: previous_page.map(link),
            next: next_page.map(link),
        },
        meta: Meta {
            current_page: current,
            from,
            last_page: page.last_page,
            per_page: page.per_page,
            to,
            total: page.total,
            generated_at: page.generated_at,
        },
        scroll_cursor: ScrollCursor {
            page_name: page_name.to_string(),
            previous_page,
            current_page: current,
            next_page,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PostId, UserId};

    fn refs(ids: std::ops::RangeInclusive<i64>) -> Vec<PostRef> {
        ids.rev()
            .map(|id| PostRef {
                id: PostId(id),
                author_id: UserId(1),
                published_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn empty_feed_has_no_neighbours() {
        let page = FeedPage::new(Vec::new(), 1, 20, 0);
        let envelope = build(&page, "page");

        assert!(envelope.data.is_empty());
        assert_eq!(envelope.scroll_cursor.previous_page, None);
        assert_eq!(envelope.scroll_cursor.next_page, None);
        assert_eq!(envelope.scroll_cursor.current_page, 1);
        assert_eq!(envelope.meta.from, None);
        assert_eq!(envelope.links.last, "?page=1");
    }

    #[test]
    fn zero_last_page_is_treated_as_empty() {
        let mut page = FeedPage::new(refs(1..=3), 2, 20, 3);
        page.last_page = 0;
        let envelope = build(&page, "page");

        assert!(envelope.data.is_empty());
        assert_eq!(envelope.scroll_cursor.next_page, None);
        assert_eq!(envelope.scroll_cursor.current_page, 2);
    }

    #[test]
    fn first_of_two_pages() {
        let page = FeedPage::new(refs(6..=25), 1, 20, 25);
        let envelope = build(&page, "page");

        assert_eq!(envelope.meta.last_page, 2);
        assert_eq!(envelope.scroll_cursor.previous_page, None);
        assert_eq!(envelope.scroll_cursor.next_page, Some(2));
        assert_eq!(envelope.links.next.as_deref(), Some("?page=2"));
        assert_eq!((envelope.meta.from, envelope.meta.to), (Some(1), Some(20)));
    }

    #[test]
    fn last_of_two_pages() {
        let page = FeedPage::new(refs(1..=5), 2, 20, 25);
        let envelope = build(&page, "posts");

        assert_eq!(envelope.scroll_cursor.previous_page, Some(1));
        assert_eq!(envelope.scroll_cursor.next_page, None);
        assert_eq!(envelope.links.prev.as_deref(), Some("?posts=1"));
        assert_eq!((envelope.meta.from, envelope.meta.to), (Some(21), Some(25)));
    }

    #[test]
    fn build_is_idempotent() {
        let page = FeedPage::new(refs(1..=20), 1, 20, 45);
        assert_eq!(build(&page, "page"), build(&page, "page"));
    }

    #[test]
    fn serializes_scroll_cursor_in_camel_case() {
        let envelope = build(&FeedPage::new(refs(1..=1), 1, 20, 1), "page");
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["scrollCursor"]["pageName"], "page");
        assert_eq!(json["scrollCursor"]["nextPage"], serde_json::Value::Null);
        assert_eq!(json["meta"]["current_page"], 1);
        assert_eq!(json["data"][0]["id"], 1);
    }

    #[test]
    fn map_data_keeps_metadata() {
        let envelope = build(&FeedPage::new(refs(1..=2), 1, 20, 2), "page");
        let meta = envelope.meta.clone();
        let mapped = envelope.map_data(|items| items.into_iter().map(|r| r.id).collect());

        assert_eq!(mapped.data, vec![PostId(2), PostId(1)]);
        assert_eq!(mapped.meta, meta);
    }
}
