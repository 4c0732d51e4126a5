//! Bridge runtime between `loxinflux-api` and the Telegraf listeners.
//!
//! This crate owns everything that happens to a value after the Miniserver
//! session has decoded it:
//!
//! - **[`model`]**: the structure snapshot. [`StructureIndex`] maps every
//!   state identifier to its [`Device`] (and sub-field), and is swapped
//!   atomically when the structure is reloaded after a reconnect.
//!
//! - **[`filter`]**: ordered allow/deny rules per record source, plus the
//!   global type blacklist.
//!
//! - **[`format`]**: Influx line protocol rendering with the fixed tag order
//!   Telegraf expects.
//!
//! - **[`delivery`]**: one task per output (UDP, TCP, MQTT, stdout), each
//!   with its own bounded queue and reconnect budget.
//!
//! - **[`poll`]**: the scheduler that reads devices the event stream does
//!   not cover.
//!
//! - **[`Bridge`]**: the supervisor that wires the session, the
//!   [`Pipeline`] and the delivery channels together and decides when the
//!   process should stop.

pub mod bridge;
pub mod config;
pub mod delivery;
pub mod error;
pub mod filter;
pub mod format;
pub mod model;
pub mod pipeline;
pub mod poll;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::Bridge;
pub use config::{
    BridgeConfig, MiniserverSettings, MqttSettings, OutputProtocol, OutputTarget, PollSettings,
};
pub use delivery::{Batch, ChannelHandle, ChannelState, DeliveryManager, Enqueue, Transport};
pub use error::{CoreError, DeliveryError};
pub use filter::{Decision, DropReason, FilterRuleSet, FilterRules};
pub use format::{FormatSettings, MetricFormatter, OutputMetric};
pub use model::{Device, Resolved, StructureIndex, StructureSource, SubField};
pub use pipeline::{Pipeline, PipelineStats};
pub use poll::{PollScheduler, poll_targets};
