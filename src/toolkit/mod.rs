//! External toolkit invocation: environment handle, command runner, and the
//! stage runners built on top of it.

pub(crate) mod invoker;
mod spectral;
mod stats;

pub use invoker::{ToolOutput, ToolkitEnv, ToolkitRunner};
pub use spectral::{CollapseEstimator, SpectralStageRunner};
pub use stats::{NoiseStatsExtractor, NoiseStatsRecord, StatsComponent};
