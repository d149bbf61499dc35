//! Row mapping and timestamp encoding.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microseconds, `Z`)
//! so lexical order in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use courier_core::{
    MessageStatus, Notification, NotificationKind, NotificationPriority, NotificationStatus,
    PresenceStatus, StoredMessage, UserRecord,
};
use rusqlite::Row;
use rusqlite::types::Type;

/// Columns selected by [`message`], in order.
pub const MESSAGE_COLUMNS: &str = "id, sender_id, recipient_id, conversation_id, content, \
                                   status, edited, deleted, created_at, edited_at";

/// Columns selected by [`user`], in order.
pub const USER_COLUMNS: &str = "id, display_name, status, last_seen";

/// Columns selected by [`notification`], in order.
pub const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, title, message, data, action_url, \
                                        priority, status, read_at, created_at, expires_at";

/// Encode a timestamp for storage.
pub fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
pub fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Map a row selected with [`MESSAGE_COLUMNS`].
pub fn message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let status: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    let edited_at: Option<String> = row.get(9)?;
    Ok(StoredMessage {
        id: row.get::<_, String>(0)?.into(),
        sender: row.get::<_, String>(1)?.into(),
        recipient: row.get::<_, Option<String>>(2)?.map(Into::into),
        conversation_id: row.get::<_, String>(3)?.into(),
        content: row.get(4)?,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| conversion(5, format!("unknown message status '{status}'")))?,
        edited: row.get(6)?,
        deleted: row.get(7)?,
        created_at: decode_ts(8, &created_at)?,
        edited_at: edited_at.as_deref().map(|raw| decode_ts(9, raw)).transpose()?,
    })
}

/// Map a row selected with [`USER_COLUMNS`].
pub fn user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let status: String = row.get(2)?;
    let last_seen: Option<String> = row.get(3)?;
    Ok(UserRecord {
        id: row.get::<_, String>(0)?.into(),
        display_name: row.get(1)?,
        status: match status.as_str() {
            "online" => PresenceStatus::Online,
            "offline" => PresenceStatus::Offline,
            other => return Err(conversion(2, format!("unknown presence status '{other}'"))),
        },
        last_seen: last_seen.as_deref().map(|raw| decode_ts(3, raw)).transpose()?,
    })
}

/// Map a row selected with [`NOTIFICATION_COLUMNS`].
pub fn notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let kind: String = row.get(2)?;
    let data: String = row.get(5)?;
    let priority: String = row.get(7)?;
    let status: String = row.get(8)?;
    let read_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;
    let expires_at: Option<String> = row.get(11)?;
    Ok(Notification {
        id: row.get::<_, String>(0)?.into(),
        user: row.get::<_, String>(1)?.into(),
        kind: NotificationKind::parse(&kind)
            .ok_or_else(|| conversion(2, format!("unknown notification kind '{kind}'")))?,
        title: row.get(3)?,
        message: row.get(4)?,
        data: serde_json::from_str(&data)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        action_url: row.get(6)?,
        priority: NotificationPriority::parse(&priority)
            .ok_or_else(|| conversion(7, format!("unknown notification priority '{priority}'")))?,
        status: NotificationStatus::parse(&status)
            .ok_or_else(|| conversion(8, format!("unknown notification status '{status}'")))?,
        read_at: read_at.as_deref().map(|raw| decode_ts(9, raw)).transpose()?,
        created_at: decode_ts(10, &created_at)?,
        expires_at: expires_at.as_deref().map(|raw| decode_ts(11, raw)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoded_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let c = a + chrono::Duration::days(400);
        let mut encoded = vec![encode_ts(c), encode_ts(a), encode_ts(b)];
        encoded.sort();
        assert_eq!(encoded, vec![encode_ts(a), encode_ts(b), encode_ts(c)]);
        assert!(encode_ts(a).ends_with('Z'));
    }

    #[test]
    fn decode_round_trips() {
        let at = Utc.with_ymd_and_hms(2026, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(decode_ts(0, &encode_ts(at)).unwrap(), at);
        assert!(decode_ts(0, "yesterday").is_err());
    }
}
