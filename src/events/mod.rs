pub mod event;
pub mod forwarder;
pub mod pipeline;
pub mod stream;
pub mod subscriber;

pub use event::{DeliveredEvent, LedgerEvent, StreamRecord};
pub use forwarder::{EventForwarder, ForwarderHandle};
pub use pipeline::{EventPipeline, PipelineKey, StreamTarget};
pub use stream::{CsvStreamSink, StreamClient};
pub use subscriber::{EventSubscriber, SubscriberHandle, SubscriberState};
