//! # Handler Registry
//!
//! Maps a work definition's `handler_id` to the [`ItemHandler`] that implements
//! the activity kind. Built once at startup and shared read-only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::execution::ItemHandler;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ItemHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_ids", &self.handler_ids())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `handler_id`; an id can only be registered once
    pub fn register(&mut self, handler_id: impl Into<String>, handler: Arc<dyn ItemHandler>) -> EngineResult<()> {
        let handler_id = handler_id.into();
        if handler_id.trim().is_empty() {
            return Err(EngineError::Validation("handler id must not be empty".to_string()));
        }
        if self.handlers.contains_key(&handler_id) {
            return Err(EngineError::Validation(format!(
                "handler '{handler_id}' is already registered"
            )));
        }
        debug!(handler_id = %handler_id, handler = handler.name(), "Registered item handler");
        self.handlers.insert(handler_id, handler);
        Ok(())
    }

    /// Builder-style registration
    pub fn with_handler(mut self, handler_id: impl Into<String>, handler: Arc<dyn ItemHandler>) -> EngineResult<Self> {
        self.register(handler_id, handler)?;
        Ok(self)
    }

    pub fn get(&self, handler_id: &str) -> EngineResult<Arc<dyn ItemHandler>> {
        self.handlers
            .get(handler_id)
            .cloned()
            .ok_or_else(|| EngineError::HandlerNotFound(handler_id.to_string()))
    }

    pub fn contains(&self, handler_id: &str) -> bool {
        self.handlers.contains_key(handler_id)
    }

    /// Registered ids, sorted
    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
