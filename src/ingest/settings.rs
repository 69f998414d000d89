//! List settings owned by the list manager.

use std::collections::HashMap;

use crate::models::{ArchivePolicy, MailingList};

/// Settings the list manager holds for one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSettings {
    pub display_name: String,
    pub description: String,
    pub subject_prefix: String,
    pub archive_policy: ArchivePolicy,
}

impl ListSettings {
    /// Copy these settings onto a stored list, returning whether it changed.
    pub fn apply_to(&self, list: &mut MailingList) -> bool {
        let policy = self.archive_policy.as_i16();
        let changed = list.display_name != self.display_name
            || list.description != self.description
            || list.subject_prefix != self.subject_prefix
            || list.archive_policy != policy;
        if changed {
            list.display_name = self.display_name.clone();
            list.description = self.description.clone();
            list.subject_prefix = self.subject_prefix.clone();
            list.archive_policy = policy;
        }
        changed
    }
}

/// Source of list settings, consulted when a list is synced.
pub trait ListSettingsProvider: Send + Sync {
    fn settings(&self, list_name: &str) -> Option<ListSettings>;
}

/// Fixed settings, keyed by list address.
#[derive(Debug, Clone, Default)]
pub struct StaticListSettings {
    lists: HashMap<String, ListSettings>,
}

impl StaticListSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list(mut self, name: &str, settings: ListSettings) -> Self {
        self.lists.insert(name.to_lowercase(), settings);
        self
    }
}

impl ListSettingsProvider for StaticListSettings {
    fn settings(&self, list_name: &str) -> Option<ListSettings> {
        self.lists.get(&list_name.to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_reports_changes_only_once() {
        let settings = ListSettings {
            display_name: "Devel".into(),
            subject_prefix: "[Devel] ".into(),
            ..Default::default()
        };
        let mut list = MailingList::new("devel@example.com");
        assert!(settings.apply_to(&mut list));
        assert_eq!(list.subject_prefix, "[Devel] ");
        assert!(!settings.apply_to(&mut list));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let provider =
            StaticListSettings::new().with_list("Devel@Example.com", ListSettings::default());
        assert!(provider.settings("devel@example.com").is_some());
        assert!(provider.settings("other@example.com").is_none());
    }
}
