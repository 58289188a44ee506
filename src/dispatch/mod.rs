//! Task dispatch: host resolution, worker RPC and the dispatcher itself.

mod client;
mod dispatcher;
mod host;

pub use client::{DispatchAck, DispatchRequest, WorkerClient};
pub use dispatcher::{DispatchSettings, DispatchTarget, TaskDispatcher};
pub use host::{
    selector_for, Host, HostManager, HostSelector, HostSelectorKind, LowerWeightSelector, RandomSelector,
    RoundRobinSelector, WorkerDirectory,
};
