//! The player profile entity and the join flow built on it.

use chrono::Utc;
use reliquary_core::Result;
use reliquary_db::{ColumnType, Entity, EntityDescriptor, Record, Store};
use uuid::Uuid;

/// Attribute counting how often a player has joined.
pub const JOIN_COUNT: &str = "join_count";

/// Attribute holding the time of the most recent join.
pub const LAST_JOIN: &str = "last_join";

/// A player profile, keyed by the player's UUID.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Player {
    pub uuid: Option<Uuid>,
    pub username: Option<String>,
}

impl Entity for Player {
    fn descriptor() -> Result<EntityDescriptor<Self>> {
        EntityDescriptor::<Self>::builder("players")
            .identity(
                "uuid",
                ColumnType::Uuid,
                |p| p.uuid.into(),
                |p, v| {
                    p.uuid = v.decode()?;
                    Ok(())
                },
            )
            .field(
                "username",
                ColumnType::Text,
                |p| p.username.clone().into(),
                |p, v| {
                    p.username = v.decode()?;
                    Ok(())
                },
            )
            .build()
    }
}

/// Load or create the player, bump its join counter, and save it.
pub async fn join(store: &Store, uuid: Uuid, username: &str) -> Result<Record<Player>> {
    let mut record = match store.load::<Player>(uuid)?.await? {
        Some(record) => record,
        None => {
            tracing::info!(%uuid, "First join, creating profile");
            store.create::<Player>(uuid)?
        }
    };

    let joins = record.get::<i64>(JOIN_COUNT).unwrap_or(0) + 1;
    record.set("username", username).await?;
    record.set(JOIN_COUNT, joins).await?;
    record.set(LAST_JOIN, Utc::now()).await?;

    store.save(record).await
}
