//! Cursor-paginated connections
//!
//! `globalCount` is the size of the whole filtered set, never the number of
//! loaded edges. Cursors are opaque base64 strings wrapping an offset.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::{Result, ScriptoriumError};

const CURSOR_PREFIX: &str = "cursor:";

/// Something with a stable id, so pages can be merged without duplicates
pub trait Node {
    fn node_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge<T> {
    pub node: T,
    pub cursor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub global_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

pub fn encode_cursor(offset: usize) -> String {
    BASE64.encode(format!("{}{}", CURSOR_PREFIX, offset))
}

pub fn decode_cursor(cursor: &str) -> Result<usize> {
    let bad = || ScriptoriumError::BadRequest(format!("Invalid cursor: {}", cursor));
    let bytes = BASE64.decode(cursor).map_err(|_| bad())?;
    let text = String::from_utf8(bytes).map_err(|_| bad())?;
    text.strip_prefix(CURSOR_PREFIX)
        .and_then(|n| n.parse().ok())
        .ok_or_else(bad)
}

impl<T> Connection<T> {
    pub fn empty() -> Self {
        Self {
            edges: Vec::new(),
            page_info: PageInfo::default(),
        }
    }

    /// Cut one page out of an already filtered and ordered set
    pub fn paginate(items: Vec<T>, first: usize, after: Option<&str>) -> Result<Self> {
        let global_count = items.len();
        let start = match after {
            Some(cursor) => decode_cursor(cursor)?.checked_add(1).ok_or_else(|| {
                ScriptoriumError::BadRequest(format!("Cursor out of range: {}", cursor))
            })?,
            None => 0,
        };

        let edges: Vec<Edge<T>> = items
            .into_iter()
            .enumerate()
            .skip(start)
            .take(first)
            .map(|(offset, node)| Edge {
                node,
                cursor: encode_cursor(offset),
            })
            .collect();

        let end = start + edges.len();
        let page_info = PageInfo {
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
            has_next_page: end < global_count,
            has_previous_page: start > 0,
            global_count,
        };

        Ok(Self { edges, page_info })
    }

    pub fn map<U, F: FnMut(T) -> U>(self, mut f: F) -> Connection<U> {
        Connection {
            edges: self
                .edges
                .into_iter()
                .map(|e| Edge {
                    node: f(e.node),
                    cursor: e.cursor,
                })
                .collect(),
            page_info: self.page_info,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|e| &e.node)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl<T: Node> Connection<T> {
    /// Append a further page: new nodes go after the loaded ones, nodes
    /// already present are skipped. Returns how many edges were added.
    pub fn merge_page(&mut self, page: Connection<T>) -> usize {
        let mut seen: HashSet<String> = self
            .edges
            .iter()
            .map(|e| e.node.node_id().to_string())
            .collect();

        let before = self.edges.len();
        for edge in page.edges {
            if seen.insert(edge.node.node_id().to_string()) {
                self.edges.push(edge);
            }
        }

        if page.page_info.end_cursor.is_some() {
            self.page_info.end_cursor = page.page_info.end_cursor;
        }
        if self.page_info.start_cursor.is_none() {
            self.page_info.start_cursor = page.page_info.start_cursor;
        }
        self.page_info.has_next_page = page.page_info.has_next_page;
        self.page_info.global_count = page.page_info.global_count;

        self.edges.len() - before
    }
}
