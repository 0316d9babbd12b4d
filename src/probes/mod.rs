//! The three network diagnostics orchestrators.

pub mod connectivity;
pub mod quality;
pub mod reachability;
pub mod websocket;

pub use connectivity::{ConnectivitySettings, ConnectivityTest};
pub use quality::{LiveSample, QualitySettings, QualityTest};
pub use reachability::{ReachabilityTest, DEFAULT_REGIONS};
pub use websocket::{ReachabilityError, RegionProbe, ScriptedRegionProbe, WebSocketRegionProbe};
