// Quell Infrastructure - System Adapters
// Implements: MemoryProbe

pub mod memory_probe;

pub use memory_probe::SysinfoMemoryProbe;
