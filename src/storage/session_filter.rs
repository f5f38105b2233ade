//! Helpers for building `SessionFilter` values.
//!
//! A filter narrows a catalog listing by exact status and test name and
//! pages through it newest first.

use crate::session_management::SessionStatus;
use crate::storage::types::{Conditions, SelectOptions, SortOrder};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub test_name: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SessionFilter {
    pub fn conditions(&self) -> Conditions {
        let mut conditions = Conditions::new();
        if let Some(status) = self.status {
            conditions = conditions.eq("status", status.as_str());
        }
        if let Some(ref name) = self.test_name {
            conditions = conditions.eq("testName", name.as_str());
        }
        conditions
    }

    pub fn select_options(&self) -> SelectOptions {
        SelectOptions {
            order_by: Some("createdAt".to_string()),
            order: SortOrder::Desc,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Build a `SessionFilter` that matches sessions by status.
pub fn by_status(status: SessionStatus) -> SessionFilter {
    SessionFilter {
        status: Some(status),
        ..Default::default()
    }
}

/// Build a `SessionFilter` that matches sessions by exact test name.
pub fn by_test_name<S: Into<String>>(name: S) -> SessionFilter {
    SessionFilter {
        test_name: Some(name.into()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_maps_to_conditions() {
        let filter = SessionFilter {
            limit: Some(5),
            ..by_status(SessionStatus::Active)
        };
        assert_eq!(filter.conditions(), Conditions::new().eq("status", "active"));
        let options = filter.select_options();
        assert_eq!(options.order_by.as_deref(), Some("createdAt"));
        assert_eq!(options.order, SortOrder::Desc);
        assert_eq!(options.limit, Some(5));
    }

    #[test]
    fn empty_filter_has_no_conditions() {
        assert!(SessionFilter::default().conditions().is_empty());
        assert_eq!(by_test_name("smoke").conditions().clauses().len(), 1);
    }
}
