use tracing::instrument;

use parley_core::{Attachment, AttachmentId, ChannelId, Message, MessageId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Sender display names are resolved at read time from the membership
/// table, so a renamed member shows their current name on old messages.
const SELECT_MESSAGES: &str = "
    SELECT m.id, m.channel_id, m.sender_id, cm.display_name, m.body, m.created_at,
           a.id, a.file_id, a.url, a.mime_type, a.size
    FROM messages m
    LEFT JOIN channel_members cm ON cm.channel_id = m.channel_id AND cm.user_id = m.sender_id
    LEFT JOIN attachments a ON a.message_id = m.id";

#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a message and its attachment (if any) in one transaction.
    #[instrument(skip(self, message), fields(message_id = %message.id, channel_id = %message.channel_id))]
    pub fn save(&self, message: &Message) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO messages (id, channel_id, sender_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    message.id.as_str(),
                    message.channel_id.as_str(),
                    message.sender_id.as_str(),
                    message.body,
                    message.created_at_millis(),
                ],
            )?;

            if let Some(att) = &message.attachment {
                tx.execute(
                    "INSERT INTO attachments (id, message_id, file_id, url, mime_type, size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        att.id.as_str(),
                        message.id.as_str(),
                        att.file_id,
                        att.url,
                        att.mime_type,
                        i64::try_from(att.size).unwrap_or(i64::MAX),
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// A page of a channel's history, oldest first.
    #[instrument(skip(self), fields(channel_id = %channel_id, limit, offset))]
    pub fn list_history(
        &self,
        channel_id: &ChannelId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "{SELECT_MESSAGES}
                 WHERE m.channel_id = ?1
                 ORDER BY m.created_at ASC, m.seq ASC
                 LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params![channel_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("{SELECT_MESSAGES} WHERE m.id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    pub fn count(&self, channel_id: &ChannelId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
                [channel_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    const T: &str = "messages";
    let created_at: i64 = row_helpers::get(row, 5, T, "created_at")?;
    let attachment = match row_helpers::get_opt::<String>(row, 6, "attachments", "id")? {
        Some(att_id) => {
            let size: i64 = row_helpers::get(row, 10, "attachments", "size")?;
            Some(Attachment {
                id: AttachmentId::from_raw(att_id),
                file_id: row_helpers::get(row, 7, "attachments", "file_id")?,
                url: row_helpers::get(row, 8, "attachments", "url")?,
                mime_type: row_helpers::get(row, 9, "attachments", "mime_type")?,
                size: size.max(0) as u64,
            })
        }
        None => None,
    };

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        channel_id: ChannelId::from_raw(row_helpers::get::<String>(row, 1, T, "channel_id")?),
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 2, T, "sender_id")?),
        sender_name: row_helpers::get_opt(row, 3, "channel_members", "display_name")?,
        body: row_helpers::get(row, 4, T, "body")?,
        attachment,
        created_at: row_helpers::millis_to_datetime(created_at, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelRepo;
    use parley_core::{Channel, ChannelMember};

    fn setup() -> (MessageRepo, ChannelRepo, Channel) {
        let db = Database::in_memory().unwrap();
        let channels = ChannelRepo::new(db.clone());
        let channel = Channel::new("general", UserId::from_raw("U1"));
        channels.create(&channel, "Ada").unwrap();
        (MessageRepo::new(db), channels, channel)
    }

    fn attachment() -> Attachment {
        Attachment {
            id: AttachmentId::new(),
            file_id: "file_1".into(),
            url: "https://files.example/file_1".into(),
            mime_type: "image/png".into(),
            size: 2048,
        }
    }

    #[test]
    fn empty_channel_has_empty_history() {
        let (repo, _, channel) = setup();
        let history = repo.list_history(&channel.id, 50, 0).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn save_and_read_back_with_sender_name() {
        let (repo, _, channel) = setup();
        let msg = Message::new(channel.id.clone(), UserId::from_raw("U1"), "hello", None);
        repo.save(&msg).unwrap();

        let history = repo.list_history(&channel.id, 50, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, msg.id);
        assert_eq!(history[0].body, "hello");
        assert_eq!(history[0].sender_name.as_deref(), Some("Ada"));
        assert_eq!(history[0].created_at, msg.created_at);
    }

    #[test]
    fn attachment_saved_with_message() {
        let (repo, _, channel) = setup();
        let att = attachment();
        let msg = Message::new(channel.id.clone(), UserId::from_raw("U1"), "", Some(att.clone()));
        repo.save(&msg).unwrap();

        let fetched = repo.get(&msg.id).unwrap();
        assert_eq!(fetched.attachment, Some(att));
    }

    #[test]
    fn failed_attachment_insert_rolls_back_message() {
        let (repo, _, channel) = setup();
        let att = attachment();
        let first = Message::new(channel.id.clone(), UserId::from_raw("U1"), "a", Some(att.clone()));
        repo.save(&first).unwrap();

        // Reusing the attachment ID violates its primary key
        let second = Message::new(channel.id.clone(), UserId::from_raw("U1"), "b", Some(att));
        assert!(matches!(repo.save(&second), Err(StoreError::Conflict(_))));
        assert_eq!(repo.count(&channel.id).unwrap(), 1);
        assert!(matches!(repo.get(&second.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn message_for_missing_channel_fails() {
        let (repo, _, _) = setup();
        let msg = Message::new(ChannelId::from_raw("ghost"), UserId::from_raw("U1"), "x", None);
        assert!(repo.save(&msg).is_err());
    }

    #[test]
    fn history_is_ascending_and_paged() {
        let (repo, _, channel) = setup();
        let mut ids = Vec::new();
        for i in 0..5 {
            let msg = Message::new(channel.id.clone(), UserId::from_raw("U1"), format!("m{i}"), None);
            repo.save(&msg).unwrap();
            ids.push(msg.id);
        }

        let all = repo.list_history(&channel.id, 50, 0).unwrap();
        let got: Vec<_> = all.iter().map(|m| m.id.clone()).collect();
        assert_eq!(got, ids);

        let page = repo.list_history(&channel.id, 2, 1).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].body, "m1");
        assert_eq!(page[1].body, "m2");
    }

    #[test]
    fn removed_member_keeps_messages() {
        let (repo, channels, channel) = setup();
        let bob = UserId::from_raw("U2");
        channels
            .add_member(&ChannelMember::new(channel.id.clone(), bob.clone(), "Bob"))
            .unwrap();
        repo.save(&Message::new(channel.id.clone(), bob.clone(), "bye", None))
            .unwrap();
        channels.remove_member(&channel.id, &bob).unwrap();

        let history = repo.list_history(&channel.id, 50, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender_id, bob);
        assert!(history[0].sender_name.is_none());
    }
}
