use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::{Channel, ChannelId, ChannelMember, MemberRole, UserId, Visibility};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const CHANNEL_COLUMNS: &str =
    "c.id, c.name, c.creator_id, c.description, c.visibility, c.frozen, c.created_at";

const MEMBER_COLUMNS: &str = "channel_id, user_id, display_name, role, joined_at";

/// Channels and their memberships.
#[derive(Clone)]
pub struct ChannelRepo {
    db: Database,
}

impl ChannelRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a channel together with its creator's owner membership.
    #[instrument(skip(self, channel), fields(channel_id = %channel.id, creator_id = %channel.creator_id))]
    pub fn create(&self, channel: &Channel, creator_name: &str) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO channels (id, name, creator_id, description, visibility, frozen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    channel.id.as_str(),
                    channel.name,
                    channel.creator_id.as_str(),
                    channel.description,
                    channel.visibility.to_string(),
                    channel.frozen,
                    channel.created_at.timestamp_millis(),
                ],
            )?;
            let owner = ChannelMember {
                channel_id: channel.id.clone(),
                user_id: channel.creator_id.clone(),
                display_name: creator_name.to_string(),
                role: MemberRole::Owner,
                joined_at: channel.created_at,
            };
            insert_member(tx, &owner)?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(channel_id = %id))]
    pub fn get(&self, id: &ChannelId) -> Result<Channel, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_channel(row),
                None => Err(StoreError::NotFound(format!("channel {id}"))),
            }
        })
    }

    /// Delete a channel. Members, messages and attachments cascade.
    #[instrument(skip(self), fields(channel_id = %id))]
    pub fn delete(&self, id: &ChannelId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM channels WHERE id = ?1", [id.as_str()])?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("channel {id}")));
            }
            Ok(())
        })
    }

    /// Freeze or unfreeze a channel. Frozen channels accept no new posts.
    #[instrument(skip(self), fields(channel_id = %id))]
    pub fn set_frozen(&self, id: &ChannelId, frozen: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE channels SET frozen = ?1 WHERE id = ?2",
                rusqlite::params![frozen, id.as_str()],
            )?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("channel {id}")));
            }
            Ok(())
        })
    }

    /// Add a member. Returns `false` if the member already existed.
    #[instrument(skip(self, member), fields(channel_id = %member.channel_id, user_id = %member.user_id))]
    pub fn add_member(&self, member: &ChannelMember) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM channels WHERE id = ?1)",
                [member.channel_id.as_str()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("channel {}", member.channel_id)));
            }
            insert_member(conn, member)
        })
    }

    /// Remove a member. Returns `false` if they were not a member.
    #[instrument(skip(self), fields(channel_id = %channel_id, user_id = %user_id))]
    pub fn remove_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let affected = conn.execute(
                "DELETE FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
                [channel_id.as_str(), user_id.as_str()],
            )?;
            Ok(affected > 0)
        })
    }

    #[instrument(skip(self), fields(channel_id = %channel_id, user_id = %user_id))]
    pub fn get_member(
        &self,
        channel_id: &ChannelId,
        user_id: &UserId,
    ) -> Result<Option<ChannelMember>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {MEMBER_COLUMNS} FROM channel_members WHERE channel_id = ?1 AND user_id = ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([channel_id.as_str(), user_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_member(row).map(Some),
                None => Ok(None),
            }
        })
    }

    pub fn is_member(&self, channel_id: &ChannelId, user_id: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
                    [channel_id.as_str(), user_id.as_str()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Members of a channel in join order.
    #[instrument(skip(self), fields(channel_id = %channel_id))]
    pub fn list_members(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMember>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {MEMBER_COLUMNS} FROM channel_members WHERE channel_id = ?1
                 ORDER BY joined_at ASC, rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([channel_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_member(row)?);
            }
            Ok(results)
        })
    }

    /// Channels a user belongs to, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Channel>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {CHANNEL_COLUMNS} FROM channels c
                 JOIN channel_members m ON m.channel_id = c.id
                 WHERE m.user_id = ?1
                 ORDER BY c.created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_channel(row)?);
            }
            Ok(results)
        })
    }
}

/// `INSERT OR IGNORE` keeps re-adding a member a no-op.
fn insert_member(conn: &rusqlite::Connection, member: &ChannelMember) -> Result<bool, StoreError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO channel_members (channel_id, user_id, display_name, role, joined_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            member.channel_id.as_str(),
            member.user_id.as_str(),
            member.display_name,
            member.role.to_string(),
            member.joined_at.timestamp_millis(),
        ],
    )?;
    Ok(inserted > 0)
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> Result<Channel, StoreError> {
    const T: &str = "channels";
    let visibility: String = row_helpers::get(row, 4, T, "visibility")?;
    let created_at: i64 = row_helpers::get(row, 6, T, "created_at")?;
    Ok(Channel {
        id: ChannelId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        name: row_helpers::get(row, 1, T, "name")?,
        creator_id: UserId::from_raw(row_helpers::get::<String>(row, 2, T, "creator_id")?),
        description: row_helpers::get_opt(row, 3, T, "description")?,
        visibility: row_helpers::parse_enum::<Visibility>(&visibility, T, "visibility")?,
        frozen: row_helpers::get(row, 5, T, "frozen")?,
        created_at: row_helpers::millis_to_datetime(created_at, T, "created_at")?,
    })
}

fn row_to_member(row: &rusqlite::Row<'_>) -> Result<ChannelMember, StoreError> {
    const T: &str = "channel_members";
    let role: String = row_helpers::get(row, 3, T, "role")?;
    let joined_at: i64 = row_helpers::get(row, 4, T, "joined_at")?;
    Ok(ChannelMember {
        channel_id: ChannelId::from_raw(row_helpers::get::<String>(row, 0, T, "channel_id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, T, "user_id")?),
        display_name: row_helpers::get(row, 2, T, "display_name")?,
        role: row_helpers::parse_enum::<MemberRole>(&role, T, "role")?,
        joined_at: row_helpers::millis_to_datetime(joined_at, T, "joined_at")?,
    })
}
