pub mod handler_error;
pub mod relay_http_handler;
pub mod session_pipeline;
