//! Command dispatch with exactly-one-handler semantics.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BusError, Result};

/// A command is a request to change state.
///
/// Each command type routes to exactly one handler, registered at startup.
pub trait Command: Send + 'static {
    /// The result produced by handling this command.
    type Output: Send;

    /// Stable name used in errors and logs.
    fn name() -> &'static str;
}

/// Handles a single command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(
        &self,
        command: C,
    ) -> std::result::Result<C::Output, Box<dyn std::error::Error + Send + Sync>>;
}

struct Registration {
    name: &'static str,
    // Holds an Arc<dyn CommandHandler<C>> behind type erasure; the TypeId
    // key guarantees the downcast in dispatch always succeeds.
    handler: Box<dyn Any + Send + Sync>,
}

/// Builds a [`CommandBus`].
///
/// Duplicate registrations for the same command type are rejected here, at
/// startup, rather than surfacing as ambiguity at dispatch time.
#[derive(Default)]
pub struct CommandBusBuilder {
    handlers: HashMap<TypeId, Registration>,
}

impl CommandBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for command type `C`.
    pub fn register<C, H>(mut self, handler: H) -> Result<Self>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let type_id = TypeId::of::<C>();
        if self.handlers.contains_key(&type_id) {
            return Err(BusError::MultipleHandlersRegistered { command: C::name() });
        }

        let handler: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.handlers.insert(
            type_id,
            Registration {
                name: C::name(),
                handler: Box::new(handler),
            },
        );
        Ok(self)
    }

    /// Finalizes the bus. The handler set is immutable from here on.
    pub fn build(self) -> CommandBus {
        CommandBus {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Routes commands to their registered handlers.
///
/// Cheap to clone; all clones share the same immutable handler map.
#[derive(Clone)]
pub struct CommandBus {
    handlers: Arc<HashMap<TypeId, Registration>>,
}

impl CommandBus {
    pub fn builder() -> CommandBusBuilder {
        CommandBusBuilder::new()
    }

    /// Dispatches a command to its handler.
    pub async fn dispatch<C: Command>(&self, command: C) -> Result<C::Output> {
        let registration = self
            .handlers
            .get(&TypeId::of::<C>())
            .ok_or(BusError::NoHandlerRegistered { command: C::name() })?;

        let handler = registration
            .handler
            .downcast_ref::<Arc<dyn CommandHandler<C>>>()
            .ok_or(BusError::NoHandlerRegistered { command: C::name() })?;

        tracing::debug!(command = registration.name, "dispatching command");

        handler
            .handle(command)
            .await
            .map_err(|source| BusError::Handler {
                command: C::name(),
                source,
            })
    }

    /// Returns true if a handler is registered for command type `C`.
    pub fn has_handler<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }
}
