use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub phase: String,
    pub channel: Option<String>,
    pub channels_total: Option<u64>,
    pub channels_done: Option<u64>,
    pub messages: Option<u64>,
    pub attachments_saved: Option<u64>,
    pub attachments_reused: Option<u64>,
    pub bans: Option<u64>,
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: TaskProgress);
}
