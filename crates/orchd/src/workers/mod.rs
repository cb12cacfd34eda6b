//! Step Workers (Section 4.5): registrar, repoBootstrap, imageBuilder, and
//! the manifestRenderer/deployer/promoter family. Each module exposes a
//! `run(ctx, envelope)` function with the signature `worker_runtime::run_worker`
//! expects; the subject wiring that chains them lives in `lib.rs`.

pub mod delivery;
pub mod image_builder;
pub mod registrar;
pub mod repo_bootstrap;

/// Entry subject for the create/update/delete/ci pipeline (Section 4.7).
pub const SUBJECT_OP_START: &str = "op.start";
pub const SUBJECT_REGISTRATION_DONE: &str = "registration.done";
pub const SUBJECT_BOOTSTRAP_DONE: &str = "bootstrap.done";
pub const SUBJECT_BUILD_DONE: &str = "build.done";
pub const SUBJECT_DEPLOY_DONE: &str = "deploy.done";
pub const SUBJECT_DEPLOYMENT_START: &str = "deployment.start";
pub const SUBJECT_PROMOTION_START: &str = "promotion.start";
pub const SUBJECT_PROMOTION_DONE: &str = "promotion.done";

/// Stable worker-name identifiers stamped on `Step` records (Section 4.4
/// "worker names are stable identifiers used for idempotency lookup").
pub const WORKER_REGISTRAR: &str = "registrar";
pub const WORKER_REPO_BOOTSTRAP: &str = "repoBootstrap";
pub const WORKER_IMAGE_BUILDER: &str = "imageBuilder";
pub const WORKER_MANIFEST_RENDERER: &str = "manifestRenderer";
pub const WORKER_DEPLOYER: &str = "deployer";
pub const WORKER_PROMOTER: &str = "promoter";
