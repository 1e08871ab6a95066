pub mod consumer;

pub use consumer::{
    ConsumedMessage, ConsumerConfig, EventConsumer, IdempotentMessageHandler, MessageHandler,
    MissingTokenPolicy,
};
