use crate::error::ModelError;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

type Factory<T> = Box<dyn Fn() -> anyhow::Result<Arc<T>> + Send + Sync>;

/// A model that is constructed on first use and then shared for the life of
/// the process. A failed initialization is reported as
/// [`ModelError::Unavailable`] and attempted again on the next call.
pub struct LazyModel<T: ?Sized> {
    name: String,
    factory: Factory<T>,
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> LazyModel<T> {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            slot: Mutex::new(None),
        }
    }

    /// Wraps an already constructed model.
    pub fn ready(name: impl Into<String>, model: Arc<T>) -> Self
    where
        T: Send + Sync + 'static,
    {
        let name = name.into();
        let failure_name = name.clone();
        Self {
            name,
            factory: Box::new(move || {
                Err(anyhow::anyhow!("model {failure_name} was provided pre-initialized"))
            }),
            slot: Mutex::new(Some(model)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns the shared model, initializing it if needed. Blocks while
    /// another caller is initializing, so call it off the async scheduler.
    pub fn get(&self) -> Result<Arc<T>, ModelError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = slot.as_ref() {
            return Ok(Arc::clone(model));
        }

        let model = (self.factory)().map_err(|error| ModelError::Unavailable {
            model: self.name.clone(),
            reason: format!("{error:#}"),
        })?;
        info!(model = %self.name, "model initialized");
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }
}
