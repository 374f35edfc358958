//! Change subscriptions scoped to one session and schema.

use super::Kernel;
use crate::error::CoreResult;
use crate::model::card::CardId;
use crate::repo::card_repo::{CardChange, ChangeKind};
use crate::sql::keywords::LINKS_KEYWORD;
use crate::sql::QueryOptions;
use futures::stream::{self, Stream};
use log::warn;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};

/// A committed change to a card the subscriber may read.
#[derive(Debug, Clone, PartialEq)]
pub struct CardEvent {
    pub kind: ChangeKind,
    /// Card as the subscriber sees it after the change.
    pub card: Value,
}

/// Live feed of changes matching a schema.
///
/// Every change is re-read through the kernel with the subscriber's session,
/// so permission changes apply to later events.
pub struct CardStream {
    kernel: Kernel,
    session: CardId,
    schema: Value,
    changes: Option<broadcast::Receiver<CardChange>>,
}

impl CardStream {
    pub(super) fn new(
        kernel: Kernel,
        session: CardId,
        schema: Value,
        changes: broadcast::Receiver<CardChange>,
    ) -> Self {
        Self {
            kernel,
            session,
            schema,
            changes: Some(changes),
        }
    }

    /// Waits for the next visible change; `None` once closed.
    pub async fn next(&mut self) -> Option<CoreResult<CardEvent>> {
        loop {
            let change = match self.changes.as_mut()?.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event=card_stream module=kernel status=lagged skipped={skipped}");
                    continue;
                }
                Err(RecvError::Closed) => {
                    self.changes = None;
                    return None;
                }
            };

            let schema = restrict_to_id(&self.schema, change.id);
            let cards = self
                .kernel
                .query(self.session, &schema, QueryOptions::default())
                .await;
            match cards {
                Ok(mut cards) => {
                    if let Some(card) = cards.pop() {
                        return Some(Ok(CardEvent {
                            kind: change.kind,
                            card,
                        }));
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }

    /// Ends the subscription. Changes committed afterwards are not delivered.
    pub fn close(&mut self) {
        self.changes = None;
    }

    pub fn is_closed(&self) -> bool {
        self.changes.is_none()
    }

    /// Adapts the subscription into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = CoreResult<CardEvent>> {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.next().await?;
            Some((event, subscription))
        })
    }
}

fn restrict_to_id(schema: &Value, id: CardId) -> Value {
    let by_id = json!({
        "type": "object",
        "required": ["id"],
        "properties": { "id": { "const": id.to_string() } }
    });
    let mut body = schema.clone();
    let links = body
        .as_object_mut()
        .and_then(|map| map.remove(LINKS_KEYWORD));

    let mut restricted = Map::new();
    restricted.insert("allOf".to_string(), json!([body, by_id]));
    if let Some(links) = links {
        restricted.insert(LINKS_KEYWORD.to_string(), links);
    }
    Value::Object(restricted)
}

#[cfg(test)]
mod tests {
    use super::restrict_to_id;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn restriction_keeps_links_at_root() {
        let id = Uuid::new_v4();
        let schema = json!({
            "type": "object",
            "$$links": { "is attached to": { "type": "object" } }
        });

        let restricted = restrict_to_id(&schema, id);

        assert_eq!(restricted["allOf"][0], json!({ "type": "object" }));
        assert_eq!(
            restricted["allOf"][1]["properties"]["id"]["const"],
            json!(id.to_string())
        );
        assert!(restricted["$$links"].is_object());
    }
}
