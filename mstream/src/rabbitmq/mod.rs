pub mod amqp;
pub mod error;
pub mod publish;
pub use amqp::Publisher;
pub use error::Error;
pub use publish::{Message, PendingAck, Publish};
