mod config;
mod logging;

use std::sync::Arc;

use chat_session::{
    ChatSession,
    chat_core::{
        CallerIdentity, ChatMetadata, Profile, SessionError, SessionEvent, SessionSnapshot,
        TimelineItem,
    },
    chat_platform::InMemoryChatApi,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::SmokeConfig;

const CONVERSATION_ID: &str = "general";
const OTHER_CONVERSATION_ID: &str = "random";
const CREDENTIAL: &str = "smoke-credential";

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        eprintln!("Smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: SmokeConfig) -> Result<(), SessionError> {
    let me = Profile::bare(config.user_id.clone());
    let bob = Profile {
        user_id: "@bob".to_owned(),
        display_name: Some("Bob".to_owned()),
    };

    let api = InMemoryChatApi::new();
    api.authorize(CREDENTIAL)?;
    for conversation_id in [CONVERSATION_ID, OTHER_CONVERSATION_ID] {
        api.create_conversation(ChatMetadata {
            conversation_id: conversation_id.to_owned(),
            title: Some(format!("#{conversation_id}")),
            participants: vec![me.clone(), bob.clone()],
        })?;
    }
    for n in 1..=3 {
        api.post_message(CONVERSATION_ID, bob.clone(), &format!("earlier message {n}"))?;
    }

    let session = ChatSession::new(
        CONVERSATION_ID,
        CallerIdentity::new(config.user_id.clone(), CREDENTIAL),
        Arc::new(api.clone()),
        config.session.clone(),
    );
    let watcher = tokio::spawn(watch_events(session.clone()));

    session.initialize().await;
    if let SessionSnapshot::Error { error } = session.state() {
        session.destroy();
        return Err(error);
    }
    info!(items = session.state().items().len(), "session initialized");

    session.send_message("hello from the smoke run").await;
    api.post_message(CONVERSATION_ID, bob.clone(), "hi! welcome back")?;
    api.post_message(OTHER_CONVERSATION_ID, bob, "this belongs elsewhere")?;

    tokio::time::sleep(config.run_duration()).await;
    session.fetch_message_history().await;

    print_timeline(&session.state());
    session.destroy();
    if let Err(err) = watcher.await {
        warn!(error = %err, "event watcher ended abnormally");
    }
    Ok(())
}

async fn watch_events(session: ChatSession) {
    let mut events = session.subscribe();
    loop {
        match events.recv().await {
            Ok(SessionEvent::Changed) => {
                debug!(status = session.status().as_str(), "session changed");
                if session.is_destroyed() {
                    break;
                }
            }
            Ok(SessionEvent::OperationFailed(failure)) => {
                warn!(operation = ?failure.operation, error = %failure.error, "operation failed");
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "event watcher lagged");
                if session.is_destroyed() {
                    break;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_timeline(snapshot: &SessionSnapshot) {
    println!("status: {}", snapshot.status().as_str());
    for item in snapshot.items() {
        match item {
            TimelineItem::Message { message, .. } => {
                let sender = message
                    .sender
                    .display_name
                    .as_deref()
                    .unwrap_or(&message.sender.user_id);
                println!("  [{}] {sender}: {}", message.id, message.content);
            }
            TimelineItem::DeletedMessage { message, .. } => {
                println!("  [{}] (deleted)", message.id);
            }
            TimelineItem::PendingMessage { key, message } => {
                println!("  [{key}] (pending) {}", message.content);
            }
        }
    }
}
