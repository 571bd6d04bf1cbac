pub mod observability;
pub mod staging;

pub use staging::{
    Gateway, GatewayConfig, PipelineError, PipelineResult, Producer, RecordKind, Stage, StageStore,
};
