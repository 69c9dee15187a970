pub mod bus;
pub mod event;
pub mod sink;

pub use bus::{EventBus, EventBusError};
pub use event::{
    channels, AnswerPayload, BusEvent, EventChannel, SourceItem, StatusPayload, StepPayload,
    SubStep, TaskExecutionPayload, WorkflowStatus,
};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
