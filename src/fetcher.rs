use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::platform::{ChatClient, RawMessage, Target};

/// One message as returned to HTTP callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub date: Option<String>,
    pub text: String,
    pub sender: String,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub has_media: bool,
    pub media_type: Option<String>,
}

impl From<RawMessage> for MessageRecord {
    fn from(msg: RawMessage) -> Self {
        Self {
            id: msg.id,
            date: msg.date.map(|d| d.to_rfc3339()),
            text: msg.text.unwrap_or_default(),
            sender: msg.sender.display_name(),
            views: msg.views,
            forwards: msg.forwards,
            has_media: msg.media.is_some(),
            media_type: msg.media,
        }
    }
}

/// Pull up to `limit` messages newest-first from `channel`.
///
/// When `cutoff` is set, iteration ends at the first dated message older than
/// it; that message is not included. Undated messages never end iteration.
pub async fn fetch(
    client: &dyn ChatClient,
    channel: &str,
    limit: usize,
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<MessageRecord>, ServiceError> {
    let target = match client.resolve(channel).await {
        Ok(peer) => {
            debug!(
                "Resolved {} to chat {} ({})",
                channel,
                peer.id,
                peer.title.as_deref().unwrap_or("untitled")
            );
            Target::Resolved(peer)
        }
        Err(e) => {
            warn!("Could not resolve {}: {}; trying the raw reference", channel, e);
            Target::Raw(channel.to_string())
        }
    };

    let mut stream = client.messages(&target, limit).take(limit);
    let mut records = Vec::new();

    while let Some(item) = stream.next().await {
        let msg = item.map_err(|e| ServiceError::Fetch(e.to_string()))?;

        if let (Some(cutoff), Some(date)) = (cutoff, msg.date) {
            if date < cutoff {
                debug!("Message {} predates cutoff {}, stopping", msg.id, cutoff);
                break;
            }
        }

        records.push(MessageRecord::from(msg));
    }

    Ok(records)
}
