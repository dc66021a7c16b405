use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::channel::{ChannelError, ChannelManager, ChannelState};
use crate::config::Config;
use crate::context::{NodeContext, SessionCounters};
use crate::control::CallControl;
use crate::email::EmailRegistry;
use crate::flow::{FlowError, FlowManager};
use crate::middleware::FlowUtils;
use crate::nodes::NodeError;
use crate::render::Renderer;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("step limit ({0}) exceeded in one protocol event, flow is likely cyclic")]
    StepLimit(u32),
}

/// Orchestrates one protocol event: load channel and flow, resolve the
/// current node, execute it, persist, and keep walking until the channel
/// reaches a terminal state or the step aborts.
pub struct SessionDriver {
    config: Arc<Config>,
    flows: Arc<FlowManager>,
    channels: Arc<ChannelManager>,
    control: Arc<dyn CallControl>,
    http: reqwest::Client,
    flow_utils: Arc<FlowUtils>,
    emails: Arc<EmailRegistry>,
    counters: Arc<SessionCounters>,
    renderer: Arc<Renderer>,
}

impl SessionDriver {
    pub fn new(
        config: Arc<Config>,
        flows: Arc<FlowManager>,
        channels: Arc<ChannelManager>,
        control: Arc<dyn CallControl>,
        flow_utils: Arc<FlowUtils>,
        emails: Arc<EmailRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            flows,
            channels,
            control,
            http: reqwest::Client::new(),
            flow_utils,
            emails,
            counters: SessionCounters::new(),
            renderer: Arc::new(Renderer::new()),
        })
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }

    pub fn channels(&self) -> Arc<ChannelManager> {
        self.channels.clone()
    }

    #[tracing::instrument(skip(self), fields(flow = %flow_name, channel = %channel_uid))]
    pub async fn handle_event(
        &self,
        flow_name: &str,
        channel_uid: &str,
    ) -> Result<(), DriverError> {
        let flow = self.flows.get(flow_name)?;
        let ctx = NodeContext::new(
            self.config.clone(),
            self.control.clone(),
            self.http.clone(),
            self.channels.clone(),
            self.flow_utils.clone(),
            self.emails.clone(),
            self.counters.clone(),
            self.renderer.clone(),
            flow.flow_variables().clone(),
        );

        let mut steps = 0u32;
        loop {
            let mut channel = self.channels.get_or_create(channel_uid).await?;

            let Some(node) = flow.node(&channel.node_id) else {
                warn!(node = %channel.node_id, "node not in flow, resetting channel to start");
                channel.update_position(Some("start".to_string()), None);
                self.channels.persist(&channel).await?;
                return Ok(());
            };

            steps += 1;
            if steps > self.config.max_steps {
                error!(limit = self.config.max_steps, "aborting event");
                return Err(DriverError::StepLimit(self.config.max_steps));
            }

            debug!(node = %node.id(), kind = %node.type_name(), state = ?channel.state, "executing node");
            match node.run(&ctx, &mut channel).await {
                Ok(()) => {}
                Err(NodeError::Channel(e)) => {
                    error!(node = %node.id(), error = %e, "fatal channel error");
                    return Err(e.into());
                }
                Err(e) => {
                    // Recoverable: the channel stays positioned at this node
                    // so the next protocol event retries it.
                    error!(node = %node.id(), error = %e, "step aborted without advancing");
                    return Ok(());
                }
            }

            if channel.state == Some(ChannelState::End) {
                debug!("flow terminated, resetting channel");
                channel.reset();
                self.channels.persist(&channel).await?;
                self.channels.evict(channel_uid).await;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannelStore;
    use crate::flow::Flow;
    use crate::testing::MockControl;
    use std::path::PathBuf;

    const FLOW: &str = r#"
nodes:
  - id: start
    type: playback
    file: "welcome"
    o_connection: ask
  - id: ask
    type: get_data
    file: "menu"
    max_digits: 1
    variable: opt
    validation: "{{ opt }}"
    cases:
      - id: 1
        o_connection: m1
      - id: default
        o_connection: m2
  - id: m1
    type: playback
    file: "option-one"
  - id: m2
    type: playback
    file: "sorry"
    o_connection: start
"#;

    fn driver_with(control: Arc<MockControl>) -> Arc<SessionDriver> {
        let flows = FlowManager::new(PathBuf::from("/nonexistent"));
        flows.register(Flow::from_yaml("ivr", FLOW).unwrap());
        SessionDriver::new(
            Arc::new(Config::default()),
            flows,
            ChannelManager::new(MemoryChannelStore::new()),
            control,
            Arc::new(FlowUtils::empty()),
            EmailRegistry::new(),
        )
    }

    #[tokio::test]
    async fn test_full_walk_terminates_and_resets() {
        let control = MockControl::new();
        control.script_digits("1", false);
        let driver = driver_with(control.clone());

        driver.handle_event("ivr", "call-1").await.unwrap();

        let calls = control.calls();
        assert_eq!(
            calls,
            vec![
                "stream_file(welcome, , 0)",
                "get_data(menu, 5000, 1)",
                "stream_file(option-one, , 0)",
            ]
        );

        // m1 had no edge: the flow ended and the channel was reset.
        let channel = driver.channels().get_or_create("call-1").await.unwrap();
        assert_eq!(channel.node_id, "start");
        assert_eq!(channel.state, None);
        assert!(channel.variables().is_empty());
    }

    #[tokio::test]
    async fn test_missing_node_resets_to_start() {
        let control = MockControl::new();
        let driver = driver_with(control.clone());

        let channels = driver.channels();
        let mut channel = channels.get_or_create("call-2").await.unwrap();
        channel.update_position(Some("vanished".to_string()), None);
        channels.persist(&channel).await.unwrap();

        driver.handle_event("ivr", "call-2").await.unwrap();

        let channel = channels.get_or_create("call-2").await.unwrap();
        assert_eq!(channel.node_id, "start");
        assert!(control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cyclic_flow_hits_step_limit() {
        let control = MockControl::new();
        // every digit misses, so ask -> m2 -> start -> ask loops forever
        for _ in 0..600 {
            control.script_digits("9", false);
        }
        let driver = driver_with(control.clone());

        let result = driver.handle_event("ivr", "call-3").await;
        assert!(matches!(result, Err(DriverError::StepLimit(_))));
    }

    #[tokio::test]
    async fn test_unknown_flow_is_an_error() {
        let driver = driver_with(MockControl::new());
        assert!(matches!(
            driver.handle_event("nope", "call-4").await,
            Err(DriverError::Flow(FlowError::NotFound(_)))
        ));
    }
}
