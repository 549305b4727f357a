//! Adapters to the Rig framework
//!
//! ```text
//!   call_model node ──▶ ModelClient ──▶ RigModelClient ──▶ rig Agent<M> ──▶ provider
//! ```

mod rig_model;

pub use rig_model::RigModelClient;
