//! Parses the source platform's notification payload (§4.E).
//!
//! Required extraction: `action.id` (→ `event_id`), `action.type`,
//! `action.date`, `action.data.card.id`, board/list identity, and the full
//! payload verbatim (kept for the append-only event record and for the
//! `get_last_known_description` fallback path).

use chrono::{DateTime, Utc};
use store_adapter::ActionKind;

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ParsedNotification {
    pub event_id: String,
    pub action_kind: ActionKind,
    pub action_time: DateTime<Utc>,
    pub card_id: Option<String>,
    pub board_id: Option<String>,
    pub board_name: Option<String>,
    pub list_before_id: Option<String>,
    pub list_before_name: Option<String>,
    pub list_after_id: Option<String>,
    pub list_after_name: Option<String>,
    pub actor_id: Option<String>,
    pub actor_name: Option<String>,
    pub raw_payload: serde_json::Value,
}

fn str_field<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str()
}

fn action_kind_from_type(action_type: &str) -> ActionKind {
    match action_type {
        "createCard" => ActionKind::CardCreated,
        "updateCard" => ActionKind::CardUpdated,
        _ => ActionKind::Other,
    }
}

pub fn parse_notification(raw: serde_json::Value) -> Result<ParsedNotification, ContractError> {
    let event_id = str_field(&raw, &["action", "id"])
        .ok_or(ContractError::MissingField("action.id"))?
        .to_string();

    let action_type =
        str_field(&raw, &["action", "type"]).ok_or(ContractError::MissingField("action.type"))?;
    let action_kind = action_kind_from_type(action_type);

    let action_date =
        str_field(&raw, &["action", "date"]).ok_or(ContractError::MissingField("action.date"))?;
    let action_time = DateTime::parse_from_rfc3339(action_date)
        .map_err(|e| ContractError::Malformed {
            field: "action.date",
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);

    let card_id = str_field(&raw, &["action", "data", "card", "id"]).map(|s| s.to_string());
    let board_id = str_field(&raw, &["action", "data", "board", "id"]).map(|s| s.to_string());
    let board_name = str_field(&raw, &["action", "data", "board", "name"]).map(|s| s.to_string());
    let list_before_id =
        str_field(&raw, &["action", "data", "listBefore", "id"]).map(|s| s.to_string());
    let list_before_name =
        str_field(&raw, &["action", "data", "listBefore", "name"]).map(|s| s.to_string());
    let list_after_id =
        str_field(&raw, &["action", "data", "listAfter", "id"]).map(|s| s.to_string());
    let list_after_name =
        str_field(&raw, &["action", "data", "listAfter", "name"]).map(|s| s.to_string());
    let actor_id = str_field(&raw, &["action", "memberCreator", "id"]).map(|s| s.to_string());
    let actor_name =
        str_field(&raw, &["action", "memberCreator", "fullName"]).map(|s| s.to_string());

    Ok(ParsedNotification {
        event_id,
        action_kind,
        action_time,
        card_id,
        board_id,
        board_name,
        list_before_id,
        list_before_name,
        list_after_id,
        list_after_name,
        actor_id,
        actor_name,
        raw_payload: raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(action_type: &str) -> serde_json::Value {
        serde_json::json!({
            "action": {
                "id": "A1",
                "type": action_type,
                "date": "2026-07-28T12:00:00.000Z",
                "data": {
                    "card": {"id": "C1"},
                    "board": {"id": "B1", "name": "Orders"},
                    "listBefore": {"id": "L1", "name": "Backlog"},
                    "listAfter": {"id": "L2", "name": "In Progress"},
                },
                "memberCreator": {"id": "M1", "fullName": "A. Person"},
            }
        })
    }

    #[test]
    fn parses_create_card_action() {
        let parsed = parse_notification(sample("createCard")).unwrap();
        assert_eq!(parsed.event_id, "A1");
        assert!(matches!(parsed.action_kind, ActionKind::CardCreated));
        assert_eq!(parsed.card_id.as_deref(), Some("C1"));
        assert_eq!(parsed.list_after_id.as_deref(), Some("L2"));
    }

    #[test]
    fn unknown_action_type_maps_to_other() {
        let parsed = parse_notification(sample("addAttachmentToCard")).unwrap();
        assert!(matches!(parsed.action_kind, ActionKind::Other));
    }

    #[test]
    fn missing_action_id_is_an_error() {
        let raw = serde_json::json!({"action": {"type": "updateCard", "date": "2026-07-28T12:00:00Z"}});
        let err = parse_notification(raw).unwrap_err();
        assert!(matches!(err, ContractError::MissingField("action.id")));
    }
}
