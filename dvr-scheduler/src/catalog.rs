//! Read-only metadata lookups: channels, inputs, EPG programs and series info.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::Result;
use crate::domain::{Channel, ChannelId, InputId, InputInfo, Program, SeriesInfo};

/// Channel and input metadata.
pub trait ChannelCatalog: Send + Sync {
    /// Channel metadata finished its initial load.
    fn is_loaded(&self) -> bool;
    fn channel(&self, id: ChannelId) -> Option<Channel>;
    fn channels(&self) -> Vec<Channel>;
    fn input(&self, id: &InputId) -> Option<InputInfo>;
    fn inputs(&self) -> Vec<InputInfo>;

    /// Input that currently serves `channel_id`, if both are known.
    fn input_for_channel(&self, channel_id: ChannelId) -> Option<InputInfo> {
        self.channel(channel_id)
            .and_then(|channel| self.input(&channel.input_id))
    }
}

/// Program query issued by series expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramQuery {
    /// Series keys to match.
    pub series_ids: Vec<String>,
    /// Only programs starting strictly after this instant.
    pub start_after_ms: i64,
    /// Restrict to one channel; `None` means any channel.
    pub channel_id: Option<ChannelId>,
}

/// EPG program lookup.
#[async_trait]
pub trait ProgramSource: Send + Sync {
    async fn query_programs(&self, query: &ProgramQuery) -> Result<Vec<Program>>;
    /// Program airing on `channel_id` at `now_ms`.
    fn current_program(&self, channel_id: ChannelId, now_ms: i64) -> Option<Program>;
}

/// Series metadata lookup.
#[async_trait]
pub trait SeriesInfoSource: Send + Sync {
    async fn series_info(&self, series_id: &str) -> Result<Option<SeriesInfo>>;
}

/// Catalog held in memory, populated by the embedding application.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    channels: RwLock<HashMap<ChannelId, Channel>>,
    inputs: RwLock<HashMap<InputId, InputInfo>>,
    programs: RwLock<Vec<Program>>,
    series_info: RwLock<HashMap<String, SeriesInfo>>,
    loaded: AtomicBool,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    pub fn upsert_input(&self, input: InputInfo) {
        self.inputs.write().insert(input.id.clone(), input);
    }

    pub fn remove_input(&self, id: &InputId) -> Option<InputInfo> {
        self.inputs.write().remove(id)
    }

    pub fn upsert_channel(&self, channel: Channel) {
        self.channels.write().insert(channel.id, channel);
    }

    pub fn remove_channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.write().remove(&id)
    }

    pub fn set_programs(&self, programs: Vec<Program>) {
        *self.programs.write() = programs;
    }

    pub fn upsert_series_info(&self, info: SeriesInfo) {
        self.series_info.write().insert(info.series_id.clone(), info);
    }
}

impl ChannelCatalog for StaticCatalog {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.read().get(&id).cloned()
    }

    fn channels(&self) -> Vec<Channel> {
        let mut list: Vec<Channel> = self.channels.read().values().cloned().collect();
        list.sort_by_key(|c| c.id);
        list
    }

    fn input(&self, id: &InputId) -> Option<InputInfo> {
        self.inputs.read().get(id).cloned()
    }

    fn inputs(&self) -> Vec<InputInfo> {
        let mut list: Vec<InputInfo> = self.inputs.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[async_trait]
impl ProgramSource for StaticCatalog {
    async fn query_programs(&self, query: &ProgramQuery) -> Result<Vec<Program>> {
        let mut programs: Vec<Program> = self
            .programs
            .read()
            .iter()
            .filter(|p| p.start_ms > query.start_after_ms)
            .filter(|p| query.channel_id.is_none_or(|c| c == p.channel_id))
            .filter(|p| {
                p.series_id
                    .as_ref()
                    .is_some_and(|id| query.series_ids.contains(id))
            })
            .cloned()
            .collect();
        programs.sort_by_key(|p| (p.start_ms, p.id));
        Ok(programs)
    }

    fn current_program(&self, channel_id: ChannelId, now_ms: i64) -> Option<Program> {
        self.programs
            .read()
            .iter()
            .find(|p| p.channel_id == channel_id && p.time_range().contains(now_ms))
            .cloned()
    }
}

#[async_trait]
impl SeriesInfoSource for StaticCatalog {
    async fn series_info(&self, series_id: &str) -> Result<Option<SeriesInfo>> {
        Ok(self.series_info.read().get(series_id).cloned())
    }
}
