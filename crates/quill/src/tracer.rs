//! VM execution tracing.
//!
//! A trait-based tracing system with zero-cost abstraction: the VM is
//! monomorphized over its tracer, so with [`NoopTracer`] every hook
//! compiles away. [`StderrTracer`] prints a human-readable execution log
//! for debugging.

use crate::opcode::Opcode;

/// Hook points at key execution events.
///
/// All methods have default no-op implementations; implementations only
/// override the hooks they care about.
pub trait VmTracer: std::fmt::Debug {
    /// Called before each opcode dispatch. The hottest hook; keep
    /// implementations lightweight.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _frame_depth: usize) {}

    /// Called when a call pushes a new frame.
    #[inline(always)]
    fn on_call(&mut self, _name: &str, _depth: usize) {}

    /// Called when a return pops a frame.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when execution enters a module block.
    #[inline(always)]
    fn on_module(&mut self, _key: &str) {}
}

/// Zero-cost no-op tracer, the production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Human-readable execution log to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer {
    instructions: u64,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total instructions dispatched so far.
    #[must_use]
    pub fn instruction_count(&self) -> u64 {
        self.instructions
    }
}

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, frame_depth: usize) {
        self.instructions += 1;
        eprintln!("{:width$}{ip:06} {opcode}", "", width = frame_depth * 2);
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        eprintln!("{:width$}-> call {name}", "", width = depth * 2);
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("{:width$}<- return", "", width = depth * 2);
    }

    fn on_module(&mut self, key: &str) {
        eprintln!("== module {key}");
    }
}
