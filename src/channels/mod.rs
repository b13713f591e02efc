/*!
 * Channels Module
 * Asynchronous record exchange between the kernel program and userspace
 */

mod dispatch;
mod event;
mod types;

pub use dispatch::{DispatchChannel, DispatchSender};
pub use event::EventChannel;
pub use types::{
    ChannelStats, ChannelTuning, DispatchDecision, EventRecord, ExitEvent, QueuedTask,
};
