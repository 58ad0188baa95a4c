//! Active health checking of static endpoints.
//!
//! A [`ProbeManager`] owns one [`ProbeWorker`] per endpoint of each probed
//! component. Workers run the component's [`Probe`](crate::Probe) on a fixed
//! period through a shared [`Prober`] and publish results that crossed their
//! threshold into a [`ResultsCache`], which only notifies on change.

mod manager;
mod prober;
mod results;
mod worker;

pub use manager::ProbeManager;
pub use prober::Prober;
pub use results::{ResultUpdate, ResultsCache};
pub use worker::{Hysteresis, ProbeWorker, WorkerSpec};

/// Visible outcome of probing an endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProbeResult {
    /// Not probed yet, or no verdict could be reached.
    #[default]
    Unknown,
    /// The endpoint answered as expected.
    Success,
    /// The endpoint did not answer as expected.
    Failure,
}

impl ProbeResult {
    /// Lower-case name, used as a metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}
