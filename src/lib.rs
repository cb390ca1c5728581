pub mod batch;
pub mod capabilities;
pub mod channel;
pub mod channel_actor;
pub mod client_listener;
pub mod client_sender;
pub mod codec;
pub mod connection;
pub mod context;
pub mod delivery;
pub mod error;
pub mod events;
pub mod handlers;
pub mod mailbox;
pub mod message;
pub mod message_parsing;
pub mod rate_limit;
pub mod registry;
pub mod replies;
pub mod result;
pub mod sasl;
pub mod server;
pub mod settings;
pub mod store;
pub mod util;
