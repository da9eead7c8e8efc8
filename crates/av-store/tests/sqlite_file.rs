use av_core::{AgentConfig, AgentConfigInput, AgentInputItem, ModelConfig};
use av_store::{AgentRepository, SessionRepository, SqliteStore};

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("vault.db");

    let agent = AgentConfig::from_input(AgentConfigInput::new(
        "Persistent",
        "Remember things",
        ModelConfig::new("openai-default", "gpt-5-mini"),
    ));

    {
        let store = SqliteStore::open(&path).unwrap();
        store.upsert(&agent).await.unwrap();
        store.create("session-1", Some("Notes")).await.unwrap();
        store
            .append_items("session-1", &[AgentInputItem::user("hello")])
            .await
            .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let agents = AgentRepository::list(&store).await.unwrap();
    assert_eq!(agents, vec![agent]);

    let sessions = SessionRepository::list(&store, None).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name.as_deref(), Some("Notes"));
    assert_eq!(
        store.get_items("session-1", None).await.unwrap(),
        vec![AgentInputItem::user("hello")]
    );
}

#[tokio::test]
async fn test_mixed_item_kinds_keep_order() {
    let store = SqliteStore::in_memory().unwrap();
    store.create("s", None).await.unwrap();
    store
        .append_items(
            "s",
            &[
                AgentInputItem::Reasoning {
                    content: "thinking".into(),
                },
                AgentInputItem::user("q"),
            ],
        )
        .await
        .unwrap();

    let items = store.get_items("s", None).await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items[1].is_user());
}
