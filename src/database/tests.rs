use super::*;

async fn service() -> SessionService {
    let db = Database::in_memory().await.expect("db should open");
    SessionService::new(db)
}

/// Pushes a session's start time into the past so reaper tests do not sleep.
async fn backdate_session(service: &SessionService, session_id: &str, minutes: i64) {
    let started_at = Utc::now().naive_utc() - Duration::minutes(minutes);
    sqlx::query("UPDATE streaming_sessions SET started_at = ? WHERE id = ?")
        .bind(started_at)
        .bind(session_id)
        .execute(service.db.pool())
        .await
        .expect("backdate should succeed");
}

#[tokio::test]
async fn full_session_lifecycle_assembles_the_reply() {
    let service = service().await;
    let session_id = service
        .start_session(1, 42, "What is mitosis?")
        .await
        .expect("session should start");

    assert!(service.append_chunk(&session_id, "Hello ").await.unwrap());
    assert!(service.append_chunk(&session_id, "world!").await.unwrap());

    let message = service.finalize(&session_id).await.expect("finalize");
    assert_eq!(message.content, "Hello world!");
    assert_eq!(message.role, MessageRole::Assistant);
    assert_eq!(message.streaming_session_id.as_deref(), Some(session_id.as_str()));

    let session = service
        .get_session(&session_id)
        .await
        .unwrap()
        .expect("session should exist");
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.completed_at.is_some());
}

#[tokio::test]
async fn start_session_persists_the_user_message() {
    let service = service().await;
    service
        .start_session(7, 1, "First question")
        .await
        .expect("session should start");

    let messages = service.db.recent_messages(7, 10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "First question");
    assert!(messages[0].streaming_session_id.is_none());
}

#[tokio::test]
async fn start_session_rejects_blank_messages() {
    let service = service().await;
    let result = service.start_session(1, 1, "   ").await;
    assert!(matches!(result, Err(RagError::Validation(_))));
}

#[tokio::test]
async fn stop_persists_partial_content() {
    let service = service().await;
    let session_id = service.start_session(1, 42, "Question").await.unwrap();
    service.append_chunk(&session_id, "Partial ans").await.unwrap();

    let message = service.stop(&session_id, 42).await.expect("stop");
    assert_eq!(message.content, "Partial ans");

    let session = service.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
}

#[tokio::test]
async fn stop_rejects_other_users_without_mutating() {
    let service = service().await;
    let session_id = service.start_session(1, 42, "Question").await.unwrap();
    service.append_chunk(&session_id, "chunk").await.unwrap();

    let result = service.stop(&session_id, 99).await;
    assert!(matches!(result, Err(RagError::Unauthorized(_))));

    // Still active; the owner can stop it afterwards.
    let session = service.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    service.stop(&session_id, 42).await.expect("owner stop");
}

#[tokio::test]
async fn stop_unknown_session_is_not_found() {
    let service = service().await;
    let result = service.stop("no-such-session", 1).await;
    assert!(matches!(result, Err(RagError::NotFound(_))));
}

#[tokio::test]
async fn append_after_finalize_reports_inactive() {
    let service = service().await;
    let session_id = service.start_session(1, 42, "Question").await.unwrap();
    service.append_chunk(&session_id, "done").await.unwrap();
    service.finalize(&session_id).await.unwrap();

    assert!(!service.append_chunk(&session_id, "late").await.unwrap());
}

#[tokio::test]
async fn finalize_twice_is_not_found() {
    let service = service().await;
    let session_id = service.start_session(1, 42, "Question").await.unwrap();
    service.finalize(&session_id).await.unwrap();

    let result = service.finalize(&session_id).await;
    assert!(matches!(result, Err(RagError::NotFound(_))));
}

#[tokio::test]
async fn fail_preserves_buffer_with_error_marker() {
    let service = service().await;
    let session_id = service.start_session(1, 42, "Question").await.unwrap();
    service.append_chunk(&session_id, "half an answer").await.unwrap();

    service.fail(&session_id, "provider timeout").await.unwrap();

    let session = service.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Error);

    let messages = service.db.recent_messages(1, 10).await.unwrap();
    let assistant = messages.last().expect("assistant message persisted");
    assert_eq!(
        assistant.content,
        "half an answer\n\n[Error: provider timeout]"
    );
}

#[tokio::test]
async fn fail_with_empty_buffer_writes_no_message() {
    let service = service().await;
    let session_id = service.start_session(1, 42, "Question").await.unwrap();

    service.fail(&session_id, "immediate failure").await.unwrap();

    let session = service.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Error);

    let messages = service.db.recent_messages(1, 10).await.unwrap();
    assert_eq!(messages.len(), 1); // only the user message
}

#[tokio::test]
async fn reaper_sweeps_stale_sessions_only() {
    let service = service().await;
    let stale = service.start_session(1, 42, "Old question").await.unwrap();
    service.append_chunk(&stale, "partial").await.unwrap();
    backdate_session(&service, &stale, 31).await;

    let fresh = service.start_session(2, 42, "New question").await.unwrap();
    backdate_session(&service, &fresh, 5).await;

    let reaped = service.reap_abandoned(30).await.unwrap();
    assert_eq!(reaped, 1);

    let stale_session = service.get_session(&stale).await.unwrap().unwrap();
    assert_eq!(stale_session.status, SessionStatus::Error);
    let fresh_session = service.get_session(&fresh).await.unwrap().unwrap();
    assert_eq!(fresh_session.status, SessionStatus::Active);

    let messages = service.db.recent_messages(1, 10).await.unwrap();
    let salvaged = messages.last().expect("salvaged message");
    assert_eq!(
        salvaged.content,
        "partial\n\n[Error: Streaming was interrupted]"
    );
}

#[tokio::test]
async fn recent_messages_are_chronological_and_limited() {
    let service = service().await;
    for i in 0..5 {
        service
            .db
            .create_message(&NewMessage {
                chat_id: 3,
                role: MessageRole::User,
                content: format!("message {i}"),
                streaming_session_id: None,
            })
            .await
            .unwrap();
    }

    let messages = service.db.recent_messages(3, 3).await.unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "message 2");
    assert_eq!(messages[2].content, "message 4");
}
