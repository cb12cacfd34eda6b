pub mod config;
pub mod events;
pub mod types;
pub mod validation;

pub use config::{Config, ImageBuilderMode};
pub use events::{EventKind, OpEvent};
pub use types::{
    Delivery, DeliveryStage, EnvironmentSpec, Id, NetworkPolicies, NetworkPolicyValue, OpKind,
    OpStatus, Operation, Project, ProjectPhase, ProjectSpec, ProjectStatus, ReleaseRecord,
    RollbackScope, Step, API_VERSION, KIND,
};
pub use validation::{validate, ValidationError};
