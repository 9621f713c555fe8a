//! Domain logic for the preview-site bot.
//!
//! Everything in this crate is pure and synchronous: the port pool, the
//! per-instance lifecycle state machine, comment templates and the comment
//! command grammar. The server crate wires these to HTTP, GitHub and child
//! processes.

pub mod command;
pub mod instance;
pub mod lifecycle;
pub mod ports;
pub mod template;

pub use command::{parse_comment, ParseResult, SiteCommand};
pub use instance::{InstanceData, InstanceError, InstanceRecord, InstanceState, PrId};
pub use lifecycle::{
    plan, transition, DispatchPlan, Effect, Event, LogLevel, Notice, PrAction, TransitionResult,
};
pub use ports::{PortAllocator, PortBlock, PortError};
pub use template::{
    normalize_indentation, render, CommentContext, ContextField, TemplateError, TemplateRegistry,
};
