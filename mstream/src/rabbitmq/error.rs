use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RabbitMQ error: {0}")]
    Lapin(#[from] lapin::Error),
    #[error("Message {delivery_tag} was rejected by the broker")]
    Nacked { delivery_tag: u64 },
}
