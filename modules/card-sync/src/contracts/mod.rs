//! Wire contracts for the notification-ingestion surface.

pub mod webhook_payload;

pub use webhook_payload::{parse_notification, ContractError, ParsedNotification};
