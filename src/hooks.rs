use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Message, ToolCall};

/// Observation points inside the run loop. Returning an error aborts the run.
#[async_trait]
pub trait AgentHook: Send + Sync {
    async fn before_model(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }

    /// Called with the assembled assistant message once its stream ends.
    async fn after_model(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn before_tool_call(&self, _call: &ToolCall) -> Result<()> {
        Ok(())
    }

    async fn after_tool_result(&self, _result: &Message) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm_tool_call(&self, call: &ToolCall) -> Result<bool>;
}
