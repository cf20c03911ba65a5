//! Test harness for strand: in-memory transports, fault injection, and
//! tracing capture.

pub mod capture;
pub mod faulty;
pub mod memory;

pub use capture::{CaptureLayer, CapturedEvent, CapturedEvents};
pub use faulty::FaultyListenerFactory;
pub use memory::{MemoryClient, MemoryMultiplexedFactory, MemoryTransportFactory};
