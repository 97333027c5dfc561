//! Integration tests against the live generative-language service.
//! These tests require an API key in the environment to run.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use concierge::{
        GeminiTransport, MessageStatus, Phase, Preamble, SessionOptions, spawn_session,
    };

    fn api_key() -> Option<String> {
        let api_key = std::env::var("GEMINI_API_KEY").ok();
        if api_key.is_none() {
            eprintln!("Skipping test: GEMINI_API_KEY not set");
        }
        api_key
    }

    #[tokio::test]
    async fn test_streamed_turn_completes() {
        let Some(api_key) = api_key() else {
            return;
        };

        let transport = GeminiTransport::new(Some(api_key)).expect("Failed to create transport");
        let session = spawn_session(
            Arc::new(transport),
            Arc::new(Preamble::default()),
            SessionOptions::default(),
        );

        session
            .submit("What are VCNR's four core businesses?")
            .await
            .expect("Submission should be admitted");
        let snapshot = session
            .watch()
            .wait_for(|s| s.phase == Phase::Idle)
            .await
            .expect("Session should stay alive")
            .clone();

        assert_eq!(snapshot.transcript.len(), 2);
        let reply = &snapshot.transcript[1];
        assert_eq!(
            reply.status,
            MessageStatus::Complete,
            "Turn should complete with a valid API key"
        );
        assert!(!reply.content.is_empty());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_key_fails_the_turn() {
        if api_key().is_none() {
            return;
        }

        let transport = GeminiTransport::new(Some("invalid-key".to_string()))
            .expect("Failed to create transport");
        let session = spawn_session(
            Arc::new(transport),
            Arc::new(Preamble::default()),
            SessionOptions::default(),
        );
        let mut notifications = session.notifications();

        session.submit("Hello").await.expect("Submission should be admitted");
        let notification = notifications.recv().await.expect("Failure should be reported");
        assert_eq!(notification.text, concierge::NOTIFICATION_TEXT);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.transcript[1].status, MessageStatus::Failed);
        assert_eq!(snapshot.transcript[1].content, concierge::APOLOGY);
        session.shutdown().await;
    }
}
