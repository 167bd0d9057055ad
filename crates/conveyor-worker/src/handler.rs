//! Handler contract and the type-erased invoker stored in the registry.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use conveyor_core::models::message::DEFAULT_CONTENT_TYPE;
use conveyor_core::TaskError;

use crate::context::TaskContext;

/// A task implementation. The task name is static, the input and output are
/// typed; serialization happens at the registry boundary so handlers never
/// see raw bytes.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    const NAME: &'static str;
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn execute(
        &self,
        input: Self::Input,
        ctx: &TaskContext,
        token: CancellationToken,
    ) -> Result<Self::Output, TaskError>;
}

/// Object-safe wrapper the executor invokes; deserializes the message
/// payload into the handler's input type and serializes the output back.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn invoke(
        &self,
        args: &[u8],
        content_type: &str,
        ctx: &TaskContext,
        token: CancellationToken,
    ) -> Result<(Vec<u8>, String), TaskError>;
}

pub(crate) struct HandlerInvoker<H> {
    handler: H,
}

impl<H> HandlerInvoker<H> {
    pub(crate) fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: TaskHandler> ErasedHandler for HandlerInvoker<H> {
    async fn invoke(
        &self,
        args: &[u8],
        content_type: &str,
        ctx: &TaskContext,
        token: CancellationToken,
    ) -> Result<(Vec<u8>, String), TaskError> {
        if content_type != DEFAULT_CONTENT_TYPE {
            // Input that cannot be decoded will not change on redelivery.
            return Err(TaskError::reject(format!(
                "unsupported content type \"{}\" for task {}",
                content_type,
                H::NAME
            )));
        }
        let input: H::Input = serde_json::from_slice(args).map_err(|e| {
            TaskError::reject(format!(
                "input deserialization failed for task {}: {}",
                H::NAME,
                e
            ))
        })?;

        let output = self.handler.execute(input, ctx, token).await?;

        let bytes = serde_json::to_vec(&output)
            .map_err(|e| anyhow::anyhow!("output serialization failed for task {}: {}", H::NAME, e))?;
        Ok((bytes, DEFAULT_CONTENT_TYPE.to_string()))
    }
}
