pub mod chat_completions;
pub mod gateway;

pub use chat_completions::{
    ChatCompletionsConfigError, ChatCompletionsGateway, ChatCompletionsGatewayConfig, SseDecoder,
    SseEvent,
};
pub use gateway::{
    LlmGateway, LlmGatewayError, LlmGatewayFuture, LlmGatewayRequest, LlmGatewayResponse,
    LlmStreamFuture, LlmTokenStream,
};
