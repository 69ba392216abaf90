use serde::Serialize;

use crate::application::cursor::CursorQuery;
use crate::application::filter::FilterSet;
use crate::application::store::{OrderBy, RawFilter, TimeRange};
use crate::config::CrudSettings;

/// How a list call is paginated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub(crate) enum Paging {
    /// Everything that matches, in one page.
    Unbounded,
    Page { page: u32, size: u32 },
    Cursor { cursor: CursorQuery, size: u32 },
}

/// Accumulated modifiers of one [`super::Database`] call.
#[derive(Debug, Clone)]
pub(crate) struct Options {
    /// Rows per write batch; `None` writes everything at once.
    pub(crate) limit: Option<usize>,
    pub(crate) filters: FilterSet,
    pub(crate) fuzzy: bool,
    pub(crate) raw: Vec<RawFilter>,
    pub(crate) time_range: Option<TimeRange>,
    pub(crate) select: Vec<String>,
    pub(crate) order: Vec<OrderBy>,
    pub(crate) index: Option<String>,
    pub(crate) lock: bool,
    pub(crate) purge: bool,
    pub(crate) hooks: bool,
    pub(crate) cache: bool,
    pub(crate) nocache: bool,
    pub(crate) try_run: bool,
    pub(crate) store: Option<String>,
    pub(crate) table: Option<String>,
    pub(crate) paging: Paging,
    pub(crate) expand: Vec<String>,
    pub(crate) depth: u32,
    pub(crate) total: bool,
    pub(crate) show_deleted: bool,
    pub(crate) default_page_size: u32,
    pub(crate) max_page_size: u32,
    pub(crate) max_depth: u32,
}

impl Options {
    pub(crate) fn new(settings: &CrudSettings) -> Self {
        Self {
            limit: Some(settings.batch_limit.max(1)),
            filters: FilterSet::default(),
            fuzzy: false,
            raw: Vec::new(),
            time_range: None,
            select: Vec::new(),
            order: Vec::new(),
            index: None,
            lock: false,
            purge: false,
            hooks: true,
            cache: false,
            nocache: false,
            try_run: false,
            store: None,
            table: None,
            paging: Paging::Unbounded,
            expand: Vec::new(),
            depth: 1,
            total: true,
            show_deleted: false,
            default_page_size: settings.default_page_size,
            max_page_size: settings.max_page_size,
            max_depth: settings.max_expand_depth,
        }
    }

    /// Clamp a requested page size into `1..=max_page_size`.
    pub(crate) fn page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_crud_settings() {
        let settings = CrudSettings {
            default_page_size: 10,
            max_page_size: 50,
            batch_limit: 200,
            max_expand_depth: 2,
        };
        let opts = Options::new(&settings);
        assert_eq!(opts.limit, Some(200));
        assert!(opts.hooks);
        assert!(opts.total);
        assert_eq!(opts.paging, Paging::Unbounded);
        assert_eq!(opts.page_size(None), 10);
        assert_eq!(opts.page_size(Some(500)), 50);
        assert_eq!(opts.page_size(Some(0)), 1);
    }
}
