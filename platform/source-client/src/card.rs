use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A card as returned by the source platform's card-fetch endpoint.
///
/// Field names follow the source platform's own casing; this type is the
/// boundary where that vocabulary stops and the internal `NotificationEvent`
/// / `CardMasterRow` vocabulary in `store-adapter` begins.
#[derive(Debug, Clone, Deserialize)]
pub struct Card {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub closed: bool,
    #[serde(rename = "idBoard")]
    pub board_id: String,
    #[serde(default)]
    pub board_name: Option<String>,
    #[serde(rename = "idList")]
    pub list_id: Option<String>,
    #[serde(default)]
    pub list_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(rename = "dateLastActivity")]
    pub date_last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub name: String,
}

impl Card {
    pub fn label_names(&self) -> Vec<String> {
        self.labels.iter().map(|l| l.name.clone()).collect()
    }
}
