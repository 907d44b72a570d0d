/// Admin commands
pub mod admin;
/// Command enum, `/start` and callback handlers
pub mod handlers;
/// Bot API relay
pub mod relay;
/// Send/edit helpers with retry
pub mod resilient;
/// Texts and keyboards
pub mod views;

pub use handlers::Command;
pub use relay::TelegramRelay;
