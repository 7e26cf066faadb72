use atlas_core::{AiCityResponse, ChatSession, ConversationMessage, SessionStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::StorageError;
use crate::{parse_timestamp, parse_uuid, ChatSessionRepository, SqliteStore, StorageResult};

impl ChatSessionRepository for SqliteStore {
    async fn create_session(&self, session: &ChatSession) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_sessions (
              id, user_id, profile_id, city_name, current_itinerary_json, history_json,
              context_json, status, created_at, updated_at, expires_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(session.profile_id.map(|id| id.to_string()))
        .bind(&session.city_name)
        .bind(itinerary_json(session)?)
        .bind(serde_json::to_string(&session.conversation_history)?)
        .bind(serde_json::to_string(&session.session_context)?)
        .bind(session.status.as_code())
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn load_session(&self, session_id: Uuid) -> StorageResult<Option<ChatSession>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, profile_id, city_name, current_itinerary_json, history_json,
                   context_json, status, created_at, updated_at, expires_at
            FROM chat_sessions
            WHERE id = ?1
            "#,
        )
        .bind(session_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| session_from_row(&row)).transpose()
    }

    async fn update_session(&self, session: &ChatSession) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions SET
              profile_id = ?2,
              city_name = ?3,
              current_itinerary_json = ?4,
              context_json = ?5,
              status = ?6,
              updated_at = ?7,
              expires_at = ?8
            WHERE id = ?1
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.profile_id.map(|id| id.to_string()))
        .bind(&session.city_name)
        .bind(itinerary_json(session)?)
        .bind(serde_json::to_string(&session.session_context)?)
        .bind(session.status.as_code())
        .bind(Utc::now().to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound(session.id));
        }
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: Uuid,
        message: &ConversationMessage,
    ) -> StorageResult<()> {
        let mut tx = self.pool().begin().await?;

        let history_json: Option<String> =
            sqlx::query_scalar("SELECT history_json FROM chat_sessions WHERE id = ?1")
                .bind(session_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(history_json) = history_json else {
            return Err(StorageError::SessionNotFound(session_id));
        };

        let mut history: Vec<ConversationMessage> = serde_json::from_str(&history_json)?;
        history.push(message.clone());

        sqlx::query("UPDATE chat_sessions SET history_json = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(session_id.to_string())
            .bind(serde_json::to_string(&history)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE expires_at < ?1")
            .bind(now.to_rfc3339())
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }
}

fn itinerary_json(session: &ChatSession) -> StorageResult<Option<String>> {
    session
        .current_itinerary
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)
}

fn session_from_row(row: &SqliteRow) -> StorageResult<ChatSession> {
    let status: String = row.try_get("status")?;
    let current_itinerary = row
        .try_get::<Option<String>, _>("current_itinerary_json")?
        .map(|value| serde_json::from_str::<AiCityResponse>(&value))
        .transpose()?;

    Ok(ChatSession {
        id: parse_uuid("chat_sessions", &row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid("chat_sessions", &row.try_get::<String, _>("user_id")?)?,
        profile_id: row
            .try_get::<Option<String>, _>("profile_id")?
            .map(|value| parse_uuid("chat_sessions", &value))
            .transpose()?,
        city_name: row.try_get("city_name")?,
        current_itinerary,
        conversation_history: serde_json::from_str(&row.try_get::<String, _>("history_json")?)?,
        session_context: serde_json::from_str(&row.try_get::<String, _>("context_json")?)?,
        status: SessionStatus::parse(&status).ok_or_else(|| StorageError::CorruptRow {
            table: "chat_sessions",
            detail: format!("unknown status {status:?}"),
        })?,
        created_at: parse_timestamp("chat_sessions", &row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp("chat_sessions", &row.try_get::<String, _>("updated_at")?)?,
        expires_at: parse_timestamp("chat_sessions", &row.try_get::<String, _>("expires_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use atlas_core::MessageRole;
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn history_is_append_only_and_ordered() {
        let store = SqliteStore::in_memory().await.unwrap();
        let session = ChatSession::open(Uuid::new_v4(), "Porto", Duration::hours(24));
        store.create_session(&session).await.unwrap();

        for idx in 0..5 {
            let message = if idx % 2 == 0 {
                ConversationMessage::user(format!("m{idx}"))
            } else {
                ConversationMessage::assistant(format!("m{idx}"))
            };
            store.append_message(session.id, &message).await.unwrap();
        }

        let loaded = store.load_session(session.id).await.unwrap().unwrap();
        let contents = loaded
            .conversation_history
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(loaded.conversation_history[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn update_overwrites_and_missing_session_errors() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut session = ChatSession::open(Uuid::new_v4(), "Porto", Duration::hours(1));
        store.create_session(&session).await.unwrap();

        session.current_itinerary = Some(AiCityResponse::default());
        session.status = SessionStatus::Closed;
        store.update_session(&session).await.unwrap();

        let loaded = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Closed);
        assert!(loaded.current_itinerary.is_some());

        let ghost = ChatSession::open(Uuid::new_v4(), "Porto", Duration::hours(1));
        assert!(matches!(
            store.update_session(&ghost).await,
            Err(StorageError::SessionNotFound(_))
        ));
        assert!(matches!(
            store
                .append_message(ghost.id, &ConversationMessage::user("hi"))
                .await,
            Err(StorageError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_from_stale_copy_keeps_appended_history() {
        let store = SqliteStore::in_memory().await.unwrap();
        let session = ChatSession::open(Uuid::new_v4(), "Porto", Duration::hours(1));
        store.create_session(&session).await.unwrap();

        let mut stale = store.load_session(session.id).await.unwrap().unwrap();
        store
            .append_message(session.id, &ConversationMessage::user("from another turn"))
            .await
            .unwrap();

        stale.current_itinerary = Some(AiCityResponse::default());
        store.update_session(&stale).await.unwrap();

        let loaded = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.conversation_history.len(), 1);
        assert_eq!(loaded.conversation_history[0].content, "from another turn");
        assert!(loaded.current_itinerary.is_some());
    }

    #[tokio::test]
    async fn purge_removes_only_expired_sessions() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stale = ChatSession::open(Uuid::new_v4(), "Porto", Duration::hours(-1));
        let fresh = ChatSession::open(Uuid::new_v4(), "Porto", Duration::hours(1));
        store.create_session(&stale).await.unwrap();
        store.create_session(&fresh).await.unwrap();

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 1);
        assert!(store.load_session(stale.id).await.unwrap().is_none());
        assert!(store.load_session(fresh.id).await.unwrap().is_some());
    }
}
