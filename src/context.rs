//! Process-wide context shared by the long-running components.
//!
//! Everything a component used to reach for globally (model, scheduler,
//! settings, interception registry, shutdown signal) travels through here.

use std::sync::Arc;

use tokio::sync::watch;

use crate::ipc::Interceptors;
use crate::model::ModelStore;
use crate::scheduler::Scheduler;
use crate::settings::Settings;

#[derive(Clone)]
pub struct Context {
    pub settings: Arc<Settings>,
    pub model: ModelStore,
    pub scheduler: Arc<Scheduler>,
    pub interceptors: Arc<Interceptors>,
    /// Process-wide cancellation: flips to `true` exactly once.
    pub shutdown: watch::Receiver<bool>,
}
