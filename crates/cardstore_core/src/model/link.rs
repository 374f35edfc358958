//! Link projection of `link` cards.
//!
//! A link card carries `name` (verb read from `from` to `to`) and
//! `data.inverseName` (verb read from `to` to `from`), so traversal works from
//! either endpoint.

use crate::model::card::{Card, CardId};
use serde_json::json;
use uuid::Uuid;

/// Type slug of link cards.
pub const LINK_TYPE: &str = "link";
/// Verb written when a card's `data.target` references another card.
pub const ATTACHED_VERB: &str = "is attached to";
/// Inverse of [`ATTACHED_VERB`].
pub const ATTACHED_INVERSE_VERB: &str = "has attached element";
/// Verb whose targets contribute markers to an actor.
pub const MEMBER_OF_VERB: &str = "is member of";
/// Inverse of [`MEMBER_OF_VERB`].
pub const HAS_MEMBER_VERB: &str = "has member";

/// Row of the `links` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub id: CardId,
    pub name: String,
    pub inverse_name: String,
    pub from_id: CardId,
    pub to_id: CardId,
}

impl LinkRecord {
    /// Extracts the link projection from a `link` card.
    ///
    /// Returns `None` for other types, for inactive links, or when an
    /// endpoint is malformed.
    pub fn from_card(card: &Card) -> Option<Self> {
        if card.card_type != LINK_TYPE || !card.active {
            return None;
        }
        let endpoint = |side: &str| {
            card.data_field(side)
                .and_then(|end| end.get("id"))
                .and_then(|id| id.as_str())
                .and_then(|id| Uuid::parse_str(id).ok())
        };
        Some(Self {
            id: card.id,
            name: card.name.clone()?,
            inverse_name: card.data_field("inverseName")?.as_str()?.to_string(),
            from_id: endpoint("from")?,
            to_id: endpoint("to")?,
        })
    }
}

/// Builds a link card between two cards.
pub fn link_card(from: &Card, verb: &str, inverse_verb: &str, to: &Card) -> Card {
    let data = json!({
        "inverseName": inverse_verb,
        "from": { "id": from.id.to_string(), "type": from.card_type },
        "to": { "id": to.id.to_string(), "type": to.card_type },
    });
    let card = Card::new(LINK_TYPE, data).with_name(verb);
    let slug = format!("link-{}", card.id);
    card.with_slug(slug)
}

#[cfg(test)]
mod tests {
    use super::{link_card, LinkRecord, ATTACHED_INVERSE_VERB, ATTACHED_VERB};
    use crate::model::card::Card;
    use serde_json::json;

    #[test]
    fn link_card_projects_to_record() {
        let message = Card::new("message", json!({}));
        let thread = Card::new("thread", json!({}));
        let link = link_card(&message, ATTACHED_VERB, ATTACHED_INVERSE_VERB, &thread);

        let record = LinkRecord::from_card(&link).unwrap();
        assert_eq!(record.from_id, message.id);
        assert_eq!(record.to_id, thread.id);
        assert_eq!(record.name, ATTACHED_VERB);
        assert_eq!(record.inverse_name, ATTACHED_INVERSE_VERB);
    }

    #[test]
    fn non_link_cards_have_no_projection() {
        assert!(LinkRecord::from_card(&Card::new("user", json!({}))).is_none());
    }

    #[test]
    fn inactive_links_have_no_projection() {
        let message = Card::new("message", json!({}));
        let thread = Card::new("thread", json!({}));
        let mut link = link_card(&message, ATTACHED_VERB, ATTACHED_INVERSE_VERB, &thread);
        link.active = false;
        assert!(LinkRecord::from_card(&link).is_none());
    }
}
