//! [`MbsContext`]: the injected handle to every external collaborator a
//! strategy needs (spec §9 design note, "inject, don't globalize" — replaces
//! the original's process-wide `getMbs()` singleton).

use std::sync::Arc;

use crate::assistant::{BackupAssistant, Notifier, TaskStore};
use crate::config::EngineConfig;
use crate::connector::ConnectorFactory;
use crate::naming::NamingScheme;

/// Everything a strategy or the restore executor needs from the outside
/// world, bundled into one `Clone`-able handle. Every field is an `Arc`, so
/// cloning is cheap and the same context can be handed to a detached
/// watchdog task without lifetime gymnastics.
#[derive(Clone)]
pub struct MbsContext {
    pub config: EngineConfig,
    pub notifier: Arc<dyn Notifier>,
    pub backup_assistant: Arc<dyn BackupAssistant>,
    pub task_store: Arc<dyn TaskStore>,
    pub connector_factory: Arc<dyn ConnectorFactory>,
    /// Optional templating engine for backup name/description (spec §6,
    /// "Snapshot artifact naming"). `None` means callers have already
    /// rendered `backup.name`/`backup.description` themselves and this
    /// context need not re-render anything.
    pub naming_scheme: Option<Arc<dyn NamingScheme>>,
}

impl MbsContext {
    pub fn new(
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        backup_assistant: Arc<dyn BackupAssistant>,
        task_store: Arc<dyn TaskStore>,
        connector_factory: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self {
            config,
            notifier,
            backup_assistant,
            task_store,
            connector_factory,
            naming_scheme: None,
        }
    }

    pub fn with_naming_scheme(mut self, scheme: Arc<dyn NamingScheme>) -> Self {
        self.naming_scheme = Some(scheme);
        self
    }
}
