//! Reactive channel state: the path-addressed container and the typed
//! per-kind channel tables built on top of it.

pub mod channels;
pub mod reactive;

pub use channels::{
    ChannelField, ChannelKind, ChannelLocation, ChannelModel, ChannelRow, ChannelSnapshot, ChannelTable,
    ChannelTarget, LoadMetadata,
};
pub use reactive::{ReactiveState, StateChange, StatePath, SubscribeOptions, SubscriptionId};
