use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Delivery;

/// Trait for implementing message consumers
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivery. Errors are logged; the delivery is still acknowledged.
    async fn handle(&self, delivery: Delivery) -> Result<()>;

    /// Get handler name for debugging
    fn name(&self) -> &'static str {
        "MessageHandler"
    }
}

/// Simple function-based handler
pub struct FunctionHandler<F> {
    name: &'static str,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: &'static str, handler: F) -> Self {
        Self { name, handler }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FunctionHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        (self.handler)(delivery).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RideMeshError;

    #[tokio::test]
    async fn test_function_handler() {
        let handler = FunctionHandler::new("reject-empty", |delivery: Delivery| async move {
            if delivery.data.is_empty() {
                Err(RideMeshError::handler_error("empty payload"))
            } else {
                Ok(())
            }
        });

        let delivery = Delivery {
            delivery_tag: 1,
            routing_key: "hello".to_string(),
            redelivered: false,
            data: Vec::new(),
        };
        assert_eq!(handler.name(), "reject-empty");
        assert!(handler.handle(delivery.clone()).await.is_err());
        assert!(handler
            .handle(Delivery {
                data: b"ping".to_vec(),
                ..delivery
            })
            .await
            .is_ok());
    }
}
