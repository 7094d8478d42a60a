// LEALT -- MEMORY-LATENCY-AWARE FREQUENCY/LLC GOVERNOR
// GOVERNOR CORE AS A LIBRARY: PURE DECISION LOGIC, SCHEDULING CORE AND
// EVENT BRIDGES, WITH HARDWARE BEHIND COLLABORATOR TRAITS.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod governor;
pub mod llc;
pub mod node;
pub mod sample;
pub mod scheduler;
pub mod sim;
pub mod stability;
pub mod tuning;
