// ABOUTME: Decides whether an array of strings holds references to other records
// ABOUTME: Uses external-id shape, field-name keywords and a length heuristic

/// Field-name fragments that suggest the array links to other records.
pub const DEFAULT_RELATIONSHIP_KEYWORDS: &[&str] = &[
    "linked",
    "related",
    "link",
    "ref",
    "parent",
    "child",
    "owner",
    "assigned",
    "members",
    "contacts",
    "companies",
    "deals",
    "invoices",
    "items",
    "tickets",
    "agents",
    "users",
];

/// Minimum digits before the separator in an external id.
const ID_HEAD_DIGITS: usize = 10;
/// Minimum digits after the separator in an external id.
const ID_TAIL_DIGITS: usize = 15;
/// Minimum length of the looser id-like shape accepted alongside a keyword.
const LOOSE_ID_MIN_LEN: usize = 10;

/// Classifies array values as relationship lists or opaque data.
#[derive(Debug, Clone)]
pub struct RelationshipClassifier {
    separator: char,
    keywords: Vec<String>,
    long_string_threshold: usize,
}

impl Default for RelationshipClassifier {
    fn default() -> Self {
        Self::new(
            '_',
            DEFAULT_RELATIONSHIP_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            20,
        )
    }
}

impl RelationshipClassifier {
    pub fn new(separator: char, keywords: Vec<String>, long_string_threshold: usize) -> Self {
        Self {
            separator,
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            long_string_threshold,
        }
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    /// Whether `value` has the external-id shape: `\d{10,}<sep>\d{15,}`.
    ///
    /// ```
    /// # use api_replicator::incremental::RelationshipClassifier;
    /// let classifier = RelationshipClassifier::default();
    /// assert!(classifier.is_external_id("1700000000000_123456789012345"));
    /// assert!(!classifier.is_external_id("1700000000000-123456789012345"));
    /// ```
    pub fn is_external_id(&self, value: &str) -> bool {
        let Some((head, tail)) = value.split_once(self.separator) else {
            return false;
        };
        head.len() >= ID_HEAD_DIGITS
            && tail.len() >= ID_TAIL_DIGITS
            && head.bytes().all(|b| b.is_ascii_digit())
            && tail.bytes().all(|b| b.is_ascii_digit())
    }

    fn is_id_like(value: &str) -> bool {
        value.len() >= LOOSE_ID_MIN_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && value.chars().any(|c| c.is_ascii_digit())
    }

    fn has_relationship_keyword(&self, field_name: &str) -> bool {
        let lowered = field_name.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }

    /// Whether `values` is a list of references to other records.
    ///
    /// In priority order: every element is an exact external id; the field
    /// name carries a relationship keyword and the first element is id-like;
    /// every element is longer than the long-string threshold. Empty arrays
    /// are never relationships.
    pub fn is_relationship_array(&self, values: &[&str], field_name: &str) -> bool {
        let Some(first) = values.first() else {
            return false;
        };

        if values.iter().all(|v| self.is_external_id(v)) {
            return true;
        }

        if self.has_relationship_keyword(field_name) && Self::is_id_like(first) {
            tracing::debug!(
                "Field '{}' classified as relationship by keyword match",
                field_name
            );
            return true;
        }

        if values
            .iter()
            .all(|v| v.chars().count() > self.long_string_threshold)
        {
            tracing::warn!(
                "Field '{}' classified as relationship by value length only ({} values); review if this is opaque data",
                field_name,
                values.len()
            );
            return true;
        }

        false
    }
}
