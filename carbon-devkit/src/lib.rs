/*!
# Carbon DevKit - Test support for the carbon kernel

Building blocks for tests that need more than one module:
- Emission factor and instance fixtures
- Scripted sources for the scheduler
- A recording exporter to observe what leaves the bus
- `TestHarness` wiring a real bus, calculator and exporter
*/

pub mod exporters;
pub mod fixtures;
pub mod sources;
pub mod test_utils;

pub use exporters::RecordingExporter;
pub use sources::ScriptedSource;
pub use test_utils::TestHarness;
