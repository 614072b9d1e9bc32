//! LXD daemon API bindings
//!
//! Only the parts of the REST API that yurt needs: instances, networks,
//! profiles, images and background operations.

pub mod client;
pub mod handle;
pub mod operation;

pub use client::{DaemonApi, ExecRequest, ExecSession, LxdClient, StateAction};
pub use handle::ClientHandle;
pub use operation::{
    image_progress, ArmedGuard, CancelToken, FollowOutcome, FollowPhase, FollowerConfig, Operation,
    OperationFollower, OperationMetadata, OperationStatus, ProgressUnpacker,
};
