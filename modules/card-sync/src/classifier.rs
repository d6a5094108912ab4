//! Change Classifier (§4.D). Isolates the single decision that controls
//! whether the extractor gets invoked: did the card's description change?

use store_adapter::{normalize_description, ActionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    New,
    DescChanged,
    MetadataOnly,
}

/// Action kinds and missing card ids never reach [`classify_change`] — the
/// dispatcher finalizes those as `irrelevant` before fetching the card.
pub fn is_relevant(action_kind: ActionKind, card_id: &Option<String>) -> bool {
    card_id.is_some() && matches!(action_kind, ActionKind::CardCreated | ActionKind::CardUpdated)
}

/// `master_exists` comes from whether a card-master row exists for this
/// card; `previous_description`/`new_description` are compared in
/// normalized form (trimmed, newline-canonicalized, null ≡ empty).
pub fn classify_change(
    master_exists: bool,
    previous_description: Option<&str>,
    new_description: &str,
) -> ChangeClass {
    if !master_exists {
        return ChangeClass::New;
    }

    let previous = normalize_description(previous_description);
    let current = normalize_description(Some(new_description));

    if previous != current {
        ChangeClass::DescChanged
    } else {
        ChangeClass::MetadataOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_master_row_is_always_new() {
        assert_eq!(
            classify_change(false, Some("anything"), "anything"),
            ChangeClass::New
        );
    }

    #[test]
    fn identical_normalized_descriptions_are_metadata_only() {
        assert_eq!(
            classify_change(true, Some("  hello\r\nworld  "), "hello\nworld"),
            ChangeClass::MetadataOnly
        );
    }

    #[test]
    fn differing_descriptions_are_desc_changed() {
        assert_eq!(
            classify_change(true, Some("old"), "new"),
            ChangeClass::DescChanged
        );
    }

    #[test]
    fn null_previous_is_equivalent_to_empty_string() {
        assert_eq!(classify_change(true, None, ""), ChangeClass::MetadataOnly);
    }

    #[test]
    fn irrelevant_actions_are_filtered_before_classification() {
        assert!(!is_relevant(ActionKind::Other, &Some("C1".into())));
        assert!(!is_relevant(ActionKind::CardUpdated, &None));
        assert!(is_relevant(ActionKind::CardCreated, &Some("C1".into())));
    }
}
