//! Fleet sizing.
//!
//! - `AutoScaler` turns queue pressure into a target worker count
//! - `ResourceManager` vetoes scale-ups the host cannot absorb
//! - `FleetManager` implementations start and stop the workers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use crawlfleet::scaling::{AutoScaler, AutoScalerConfig, DryRunFleet, ResourceManager};
//!
//! let scaler = AutoScaler::new(
//!     AutoScalerConfig::default(),
//!     store,
//!     keys,
//!     ResourceManager::system(Default::default()),
//!     Arc::new(DryRunFleet::new()),
//! );
//! let decision = scaler.evaluate(&snapshot).await?;
//! ```

pub mod autoscaler;
pub mod fleet;
pub mod resources;

pub use autoscaler::{AutoScaler, AutoScalerConfig, ScalingDecision, ScalingEvent, ScalingPolicy};
pub use fleet::{DryRunFleet, FleetManager, ProcessFleet};
pub use resources::{
    HostProbe, ResourceCheck, ResourceLimits, ResourceManager, ResourceUsage, SystemProbe,
};
