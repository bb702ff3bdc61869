pub mod delta;
pub mod events;
pub mod ids;
pub mod window;
pub mod wire;

pub use delta::{apply, diff, merge, ContextDelta, ContextValue, DeltaError};
pub use events::{ActivityEvent, ActivityStatus};
pub use ids::{ActivityId, AttachmentId, ContextName, PeerId, SubscriberId, WindowId};
pub use window::{AppDirectory, Bounds, WindowDefinition, WindowHandle, Windowing, WindowingError};
pub use wire::{Envelope, Snapshot};
