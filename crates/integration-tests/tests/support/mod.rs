pub mod chat_app;
pub mod stubs;
