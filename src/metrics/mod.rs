pub mod counters;
pub mod instrument;
pub mod percentiles;
pub mod registry;
pub mod stream;
pub mod system;
pub mod window;

pub use counters::CounterTable;
pub use instrument::{track_operation, Instrument, OperationTimer};
pub use percentiles::PercentileSet;
pub use registry::{
    EndpointStats, MetricsConfig, MetricsRegistry, MetricsSummary, ModelStats, OVERFLOW_KEY,
};
pub use system::{
    AcceleratorProbe, HostProbe, NoAccelerator, NvidiaSmi, ResourceProbe, SystemSampler,
    SystemSnapshot,
};
pub use window::RollingWindow;
