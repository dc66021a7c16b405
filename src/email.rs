use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email delivery failed: {0}")]
    Delivery(String),
}

/// One outbound mail server from the flow-utilities bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailServerConfig {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub start_tls: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EmailMessage {
    pub subject: String,
    pub text: String,
    pub recipients: Vec<String>,
    pub attachments: Vec<String>,
    pub format: String,
    pub encode_type: String,
}

/// Delivery itself happens outside this crate; the engine only dispatches
/// fire-and-forget through whatever sender the host wired in per server id.
#[async_trait]
pub trait EmailSender: Send + Sync + Debug {
    async fn send_email(&self, message: EmailMessage) -> Result<(), EmailError>;
}

/// Email clients, cached by server id for the process lifetime.
#[derive(Debug, Default)]
pub struct EmailRegistry {
    clients: DashMap<String, Arc<dyn EmailSender>>,
}

impl EmailRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, server_id: impl Into<String>, client: Arc<dyn EmailSender>) {
        let server_id = server_id.into();
        info!(server_id = %server_id, "registered email client");
        self.clients.insert(server_id, client);
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<dyn EmailSender>> {
        self.clients.get(server_id).map(|c| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingSender {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send_email(&self, message: EmailMessage) -> Result<(), EmailError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let registry = EmailRegistry::new();
        let sender = Arc::new(RecordingSender::default());
        registry.register("billing", sender.clone());

        let client = registry.get("billing").expect("client registered");
        client
            .send_email(EmailMessage {
                subject: "hello".into(),
                recipients: vec!["ops@example.com".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(sender.sent.lock().unwrap().len(), 1);
        assert!(registry.get("missing").is_none());
    }
}
