//! Localized message resolution through a running engine.

use std::sync::Arc;
use std::time::Duration;

use docsync::{Engine, FeedState, InMemoryDocumentStore, Placeholders};
use docsync_test_utils::assertions::eventually;
use docsync_test_utils::fixtures::{fast_options, messages_de, messages_key, seed_messages};
use docsync_test_utils::{Document, DocumentStore};

fn placeholders(pairs: &[(&str, &str)]) -> Placeholders {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_localized_with_default_locale_fallback() {
    let store = InMemoryDocumentStore::new();
    seed_messages(&store).await.unwrap();
    let engine = Engine::builder(fast_options().with_default_locale("en"))
        .store(Arc::new(store))
        .build()
        .unwrap();
    let messages = engine.messages();
    let base = messages_key();

    let welcome = messages
        .resolve(&base, "lobby.welcome", "de", &placeholders(&[("player", "Ana")]))
        .await
        .unwrap();
    assert_eq!(welcome.as_deref(), Some("Willkommen, Ana!"));

    let online = messages
        .resolve(
            &base,
            "lobby.players",
            "de",
            &placeholders(&[("count", "3"), ("max", "10")]),
        )
        .await
        .unwrap();
    assert_eq!(online.as_deref(), Some("3 of 10 players online"));

    let partial = messages
        .resolve(&base, "lobby.players", "en", &placeholders(&[("count", "3")]))
        .await
        .unwrap();
    assert_eq!(partial.as_deref(), Some("3 of {max} players online"));

    let shown = messages
        .resolve_or_path(&base, "lobby.nothing", "de", &Placeholders::new())
        .await;
    assert_eq!(shown, "lobby.nothing");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_edits_arrive_through_the_feed() {
    let store = InMemoryDocumentStore::new();
    seed_messages(&store).await.unwrap();
    let engine = Engine::builder(fast_options().watch("messages"))
        .store(Arc::new(store.clone()))
        .build()
        .unwrap();
    engine.start();
    eventually(
        || engine.feed_status().iter().all(|s| s.state == FeedState::Streaming),
        Duration::from_secs(5),
    )
    .await;

    let base = messages_key();
    let values = placeholders(&[("player", "Ana")]);
    let before = engine
        .messages()
        .resolve(&base, "lobby.welcome", "de", &values)
        .await
        .unwrap();
    assert_eq!(before.as_deref(), Some("Willkommen, Ana!"));

    let mut edited = messages_de();
    edited.insert(
        "lobby",
        serde_json::json!({ "welcome": "Hallo {player}, willkommen zurück!" }),
    );
    store.upsert(&base.localized("de"), &edited).await.unwrap();

    let key = base.localized("de");
    eventually(
        || {
            engine
                .facade()
                .peek(&key)
                .and_then(|e| e.value)
                .map(|doc: Arc<Document>| doc.get_path("lobby.welcome").is_some_and(|v| {
                    v.as_str().is_some_and(|s| s.starts_with("Hallo"))
                }))
                .unwrap_or(false)
        },
        Duration::from_secs(5),
    )
    .await;

    let after = engine
        .messages()
        .resolve(&base, "lobby.welcome", "de", &values)
        .await
        .unwrap();
    assert_eq!(after.as_deref(), Some("Hallo Ana, willkommen zurück!"));
    engine.shutdown().await;
}
