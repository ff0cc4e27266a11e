//! `parley sessions`: list and delete saved sessions.

use parley_config::AppConfig;
use parley_store::{FileSessionStore, SessionMetadata, SessionStore};

pub async fn list(config: &AppConfig) -> anyhow::Result<()> {
    let store = FileSessionStore::from_config(&config.persistence);
    let sessions = store.list().await?;

    if sessions.is_empty() {
        println!("No saved sessions in {}", store.dir().display());
        return Ok(());
    }
    for session in &sessions {
        println!("{}", format_row(session));
    }
    Ok(())
}

pub async fn delete(config: &AppConfig, session_id: &str) -> anyhow::Result<()> {
    let store = FileSessionStore::from_config(&config.persistence);
    store.delete(session_id).await?;
    println!("Deleted session {session_id}");
    Ok(())
}

fn format_row(session: &SessionMetadata) -> String {
    let mut row = format!(
        "{}  {}  {:>4} messages  {:>3} summaries  {}",
        session.session_id,
        session.updated_at.format("%Y-%m-%d %H:%M"),
        session.message_count,
        session.summary_count,
        session.primary_model_id,
    );
    if let Some(name) = &session.name {
        row.push_str(&format!("  ({name})"));
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parley_core::message::Message;
    use parley_store::SessionData;

    #[test]
    fn row_includes_name_when_present() {
        let mut data = SessionData::new(
            "s1",
            Some("planning".into()),
            "gpt-4o-mini",
            vec![Message::user("hi")],
            Vec::new(),
        );
        data.metadata.updated_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let row = format_row(&data.metadata);
        assert!(row.starts_with("s1  2026-03-01 09:30"));
        assert!(row.contains("1 messages"));
        assert!(row.ends_with("(planning)"));
    }

    #[tokio::test]
    async fn delete_then_list_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.persistence.directory = dir.path().to_path_buf();

        let store = FileSessionStore::from_config(&config.persistence);
        let data = SessionData::new("s1", None, "m", vec![Message::user("hi")], Vec::new());
        store.save(&data).await.unwrap();

        delete(&config, "s1").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        list(&config).await.unwrap();
    }
}
