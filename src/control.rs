use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("call-control command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("call-control transport error: {0}")]
    Transport(String),
}

/// Outcome of a digit-collection command.
#[derive(Debug, Clone, Default)]
pub struct DigitCapture {
    pub value: String,
    pub timed_out: bool,
}

/// Imperative operations against the call leg. The engine depends only on
/// this contract; the transport that carries it is an external collaborator.
#[async_trait]
pub trait CallControl: Send + Sync + Debug {
    async fn answer(&self) -> Result<(), ControlError>;
    /// Hang up the current leg, or a named one.
    async fn hangup(&self, channel: Option<&str>) -> Result<(), ControlError>;
    async fn stream_file(
        &self,
        path: &str,
        escape_digits: &str,
        offset: i64,
    ) -> Result<(), ControlError>;
    #[allow(clippy::too_many_arguments)]
    async fn record_file(
        &self,
        path: &str,
        format: &str,
        escape_digits: &str,
        timeout: i64,
        silence: i64,
        beep: bool,
        offset: i64,
    ) -> Result<(), ControlError>;
    /// Play a prompt and collect DTMF digits.
    async fn get_data(
        &self,
        prompt: &str,
        timeout: i64,
        max_digits: i64,
    ) -> Result<DigitCapture, ControlError>;
    async fn set_caller_id(&self, number: &str) -> Result<(), ControlError>;
    async fn set_music(&self, class: &str, toggle: bool) -> Result<(), ControlError>;
    async fn exec_application(&self, application: &str, options: &str) -> Result<(), ControlError>;
    async fn db_get(&self, family: &str, key: &str) -> Result<Option<String>, ControlError>;
    async fn db_put(&self, family: &str, key: &str, value: &str) -> Result<(), ControlError>;
    async fn db_del(&self, family: &str, key: &str) -> Result<(), ControlError>;
    /// Read a variable from the call platform's channel (not the flow scope).
    async fn get_channel_variable(&self, name: &str) -> Result<Option<String>, ControlError>;
    async fn verbose(&self, message: &str, level: i64) -> Result<(), ControlError>;
    async fn goto_on_exit(
        &self,
        context: &str,
        extension: &str,
        priority: &str,
    ) -> Result<(), ControlError>;
}
