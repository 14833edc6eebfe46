//! Query dispatch with fan-out semantics.
//!
//! Unlike commands, a query may have any number of providers. Dispatch
//! returns every provider's answer; zero providers is not an error, the
//! result is simply empty.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BusError, Result};

/// A query is a read-only request for information.
///
/// Queries are cloned per provider, so they must be cheap to clone.
pub trait Query: Clone + Send + 'static {
    /// The answer each provider produces.
    type Output: Send;

    /// Stable name used in errors and logs.
    fn name() -> &'static str;
}

/// Answers a single query type.
#[async_trait]
pub trait QueryProvider<Q: Query>: Send + Sync {
    async fn provide(
        &self,
        query: Q,
    ) -> std::result::Result<Q::Output, Box<dyn std::error::Error + Send + Sync>>;
}

type ErasedProvider = Box<dyn Any + Send + Sync>;

/// Builds a [`QueryBus`].
#[derive(Default)]
pub struct QueryBusBuilder {
    providers: HashMap<TypeId, Vec<ErasedProvider>>,
}

impl QueryBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for query type `Q`. Multiple providers per
    /// query type are allowed.
    pub fn register<Q, P>(mut self, provider: P) -> Self
    where
        Q: Query,
        P: QueryProvider<Q> + 'static,
    {
        let provider: Arc<dyn QueryProvider<Q>> = Arc::new(provider);
        self.providers
            .entry(TypeId::of::<Q>())
            .or_default()
            .push(Box::new(provider));
        self
    }

    /// Finalizes the bus. The provider set is immutable from here on.
    pub fn build(self) -> QueryBus {
        QueryBus {
            providers: Arc::new(self.providers),
        }
    }
}

/// Routes queries to all registered providers.
#[derive(Clone)]
pub struct QueryBus {
    providers: Arc<HashMap<TypeId, Vec<ErasedProvider>>>,
}

impl QueryBus {
    pub fn builder() -> QueryBusBuilder {
        QueryBusBuilder::new()
    }

    /// Dispatches a query to every registered provider, in registration
    /// order. The first provider failure aborts the dispatch.
    pub async fn dispatch<Q: Query>(&self, query: Q) -> Result<Vec<Q::Output>> {
        let Some(providers) = self.providers.get(&TypeId::of::<Q>()) else {
            return Ok(vec![]);
        };

        let mut outputs = Vec::with_capacity(providers.len());
        for erased in providers {
            let provider = erased
                .downcast_ref::<Arc<dyn QueryProvider<Q>>>()
                .ok_or(BusError::NoHandlerRegistered { command: Q::name() })?;
            let output =
                provider
                    .provide(query.clone())
                    .await
                    .map_err(|source| BusError::Handler {
                        command: Q::name(),
                        source,
                    })?;
            outputs.push(output);
        }

        Ok(outputs)
    }

    /// Returns the number of providers registered for query type `Q`.
    pub fn provider_count<Q: Query>(&self) -> usize {
        self.providers
            .get(&TypeId::of::<Q>())
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct StockLevel {
        sku: String,
    }

    impl Query for StockLevel {
        type Output = u32;

        fn name() -> &'static str {
            "StockLevel"
        }
    }

    struct WarehouseProvider {
        on_hand: u32,
    }

    #[async_trait]
    impl QueryProvider<StockLevel> for WarehouseProvider {
        async fn provide(
            &self,
            query: StockLevel,
        ) -> std::result::Result<u32, Box<dyn std::error::Error + Send + Sync>> {
            if query.sku == "unknown" {
                return Err("no such sku".into());
            }
            Ok(self.on_hand)
        }
    }

    #[tokio::test]
    async fn test_dispatch_collects_all_providers() {
        let bus = QueryBus::builder()
            .register(WarehouseProvider { on_hand: 3 })
            .register(WarehouseProvider { on_hand: 7 })
            .build();

        let outputs = bus
            .dispatch(StockLevel {
                sku: "widget".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outputs, vec![3, 7]);
    }

    #[tokio::test]
    async fn test_dispatch_with_no_providers_returns_empty() {
        let bus = QueryBus::builder().build();

        let outputs = bus
            .dispatch(StockLevel {
                sku: "widget".to_string(),
            })
            .await
            .unwrap();

        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_aborts_dispatch() {
        let bus = QueryBus::builder()
            .register(WarehouseProvider { on_hand: 3 })
            .build();

        let err = bus
            .dispatch(StockLevel {
                sku: "unknown".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BusError::Handler { command: "StockLevel", .. }));
    }

    #[tokio::test]
    async fn test_provider_count() {
        let bus = QueryBus::builder()
            .register(WarehouseProvider { on_hand: 3 })
            .build();

        assert_eq!(bus.provider_count::<StockLevel>(), 1);
    }
}
