/*!
# Vigil DevKit - Stubs and utilities for development

Lets the agent be developed and tested without a browser or backend:
- In-memory devtools transport with scripted metrics and failures
- Mock job store, stability service and text generator
- Test harness wiring a monitor to the mock transport
*/

pub mod devtools_stub;
pub mod services_stub;
pub mod test_utils;

pub use devtools_stub::{DevtoolsEventBuilder, MetricsReading, MockDevtools};
pub use services_stub::{CannedGenerator, JobStep, MockJobService, MockStabilityService};
pub use test_utils::TestHarness;
