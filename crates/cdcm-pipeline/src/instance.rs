use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stage::{MetaManager, ParserStage, SinkStage, StoreStage};

/// How the instance was assembled by its host.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceMode {
    Spring,
    #[default]
    Manager,
}

impl InstanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceMode::Spring => "spring",
            InstanceMode::Manager => "manager",
        }
    }
}

/// One running pipeline, identified by its destination.
pub trait PipelineInstance: Send + Sync {
    fn destination(&self) -> &str;

    fn mode(&self) -> InstanceMode {
        InstanceMode::default()
    }

    fn sink(&self) -> SinkStage;

    fn parser(&self) -> ParserStage;

    fn store(&self) -> StoreStage;

    fn meta_manager(&self) -> Option<Arc<dyn MetaManager>>;
}
