//! Marker visibility for a resolved actor.

use crate::model::card::Card;
use crate::model::link::MEMBER_OF_VERB;
use crate::repo::card_repo::{CardRepository, RepoResult};
use serde_json::{json, Value};

/// Separator of compound markers such as `org-a+org-b`.
pub const MARKER_SEPARATOR: char = '+';

/// Markers an actor may see: its own slug plus the slugs of every card it
/// is a member of.
pub fn actor_markers(repo: &dyn CardRepository, actor: &Card) -> RepoResult<Vec<String>> {
    let mut markers = vec![actor.slug.clone()];
    for group in repo.linked_cards(actor.id, MEMBER_OF_VERB)? {
        if !markers.contains(&group.slug) {
            markers.push(group.slug);
        }
    }
    Ok(markers)
}

/// Schema clause accepting a card only when every one of its markers is
/// visible to the holder of `markers`.
///
/// A marker is visible when it is one of `markers`, or when any part of a
/// compound marker is.
pub fn marker_clause(markers: &[String]) -> Value {
    let alternatives = markers
        .iter()
        .map(|marker| regex::escape(marker))
        .collect::<Vec<_>>()
        .join("|");
    let separator = regex::escape(&MARKER_SEPARATOR.to_string());
    let compound = format!("(^|{separator})({alternatives})($|{separator})");

    json!({
        "type": "object",
        "required": ["markers"],
        "properties": {
            "markers": {
                "type": "array",
                "items": {
                    "type": "string",
                    "anyOf": [
                        { "enum": markers },
                        { "pattern": compound }
                    ]
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::marker_clause;
    use crate::schema::is_valid;
    use serde_json::json;

    #[test]
    fn marker_clause_admits_own_and_compound_markers() {
        let clause = marker_clause(&["user-jane".to_string(), "org.acme".to_string()]);

        assert!(is_valid(&clause, &json!({ "markers": [] })).unwrap());
        assert!(is_valid(&clause, &json!({ "markers": ["user-jane"] })).unwrap());
        assert!(is_valid(&clause, &json!({ "markers": ["org.acme+user-bob"] })).unwrap());
        assert!(!is_valid(&clause, &json!({ "markers": ["user-bob"] })).unwrap());
        assert!(!is_valid(&clause, &json!({ "markers": ["orgxacme"] })).unwrap());
        assert!(!is_valid(&clause, &json!({ "markers": ["user-jane", "user-bob"] })).unwrap());
    }
}
