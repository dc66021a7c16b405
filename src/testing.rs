use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Map;

use crate::channel::{ChannelManager, MemoryChannelStore};
use crate::config::Config;
use crate::context::{NodeContext, SessionCounters};
use crate::control::{CallControl, ControlError, DigitCapture};
use crate::email::EmailRegistry;
use crate::middleware::FlowUtils;
use crate::render::Renderer;

/// Records every issued command and replays scripted digit captures, so
/// node tests can assert on the exact call-control traffic.
#[derive(Debug, Default)]
pub(crate) struct MockControl {
    pub calls: Mutex<Vec<String>>,
    pub digits: Mutex<VecDeque<DigitCapture>>,
    pub db: Mutex<Vec<(String, String, Option<String>)>>,
    pub channel_vars: Mutex<Vec<(String, Option<String>)>>,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_digits(&self, value: &str, timed_out: bool) {
        self.digits.lock().unwrap().push_back(DigitCapture {
            value: value.to_string(),
            timed_out,
        });
    }

    pub fn script_channel_var(&self, name: &str, value: Option<&str>) {
        self.channel_vars
            .lock()
            .unwrap()
            .push((name.to_string(), value.map(str::to_string)));
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallControl for MockControl {
    async fn answer(&self) -> Result<(), ControlError> {
        self.record("answer".into());
        Ok(())
    }

    async fn hangup(&self, channel: Option<&str>) -> Result<(), ControlError> {
        self.record(format!("hangup({})", channel.unwrap_or("")));
        Ok(())
    }

    async fn stream_file(
        &self,
        path: &str,
        escape_digits: &str,
        offset: i64,
    ) -> Result<(), ControlError> {
        self.record(format!("stream_file({path}, {escape_digits}, {offset})"));
        Ok(())
    }

    async fn record_file(
        &self,
        path: &str,
        format: &str,
        escape_digits: &str,
        timeout: i64,
        silence: i64,
        beep: bool,
        offset: i64,
    ) -> Result<(), ControlError> {
        self.record(format!(
            "record_file({path}, {format}, {escape_digits}, {timeout}, {silence}, {beep}, {offset})"
        ));
        Ok(())
    }

    async fn get_data(
        &self,
        prompt: &str,
        timeout: i64,
        max_digits: i64,
    ) -> Result<DigitCapture, ControlError> {
        self.record(format!("get_data({prompt}, {timeout}, {max_digits})"));
        Ok(self
            .digits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn set_caller_id(&self, number: &str) -> Result<(), ControlError> {
        self.record(format!("set_caller_id({number})"));
        Ok(())
    }

    async fn set_music(&self, class: &str, toggle: bool) -> Result<(), ControlError> {
        self.record(format!("set_music({class}, {toggle})"));
        Ok(())
    }

    async fn exec_application(&self, application: &str, options: &str) -> Result<(), ControlError> {
        self.record(format!("exec_application({application}, {options})"));
        Ok(())
    }

    async fn db_get(&self, family: &str, key: &str) -> Result<Option<String>, ControlError> {
        self.record(format!("db_get({family}, {key})"));
        let db = self.db.lock().unwrap();
        Ok(db
            .iter()
            .find(|(f, k, _)| f == family && k == key)
            .and_then(|(_, _, v)| v.clone()))
    }

    async fn db_put(&self, family: &str, key: &str, value: &str) -> Result<(), ControlError> {
        self.record(format!("db_put({family}, {key}, {value})"));
        self.db
            .lock()
            .unwrap()
            .push((family.to_string(), key.to_string(), Some(value.to_string())));
        Ok(())
    }

    async fn db_del(&self, family: &str, key: &str) -> Result<(), ControlError> {
        self.record(format!("db_del({family}, {key})"));
        Ok(())
    }

    async fn get_channel_variable(&self, name: &str) -> Result<Option<String>, ControlError> {
        self.record(format!("get_channel_variable({name})"));
        let vars = self.channel_vars.lock().unwrap();
        Ok(vars
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.clone()))
    }

    async fn verbose(&self, message: &str, level: i64) -> Result<(), ControlError> {
        self.record(format!("verbose({message}, {level})"));
        Ok(())
    }

    async fn goto_on_exit(
        &self,
        context: &str,
        extension: &str,
        priority: &str,
    ) -> Result<(), ControlError> {
        self.record(format!("goto_on_exit({context}, {extension}, {priority})"));
        Ok(())
    }
}

pub(crate) fn test_context() -> (NodeContext, Arc<ChannelManager>) {
    test_context_with(MockControl::new(), Map::new())
}

pub(crate) fn test_context_with(
    control: Arc<MockControl>,
    default_variables: Map<String, serde_json::Value>,
) -> (NodeContext, Arc<ChannelManager>) {
    let channels = ChannelManager::new(MemoryChannelStore::new());
    let ctx = NodeContext::new(
        Arc::new(Config::default()),
        control,
        reqwest::Client::new(),
        channels.clone(),
        Arc::new(FlowUtils::empty()),
        EmailRegistry::new(),
        SessionCounters::new(),
        Arc::new(Renderer::new()),
        default_variables,
    );
    (ctx, channels)
}
