pub mod memory;
pub mod traits;
pub mod video;

pub use memory::MemoryBroker;
pub use traits::{Message, PubSubTransport, Subscription, VideoTransport};
pub use video::RecordingVideo;
