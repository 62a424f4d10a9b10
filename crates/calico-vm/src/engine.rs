//! The engine surface visible from inside a running script.
//!
//! The interpreter crate cannot depend on the scheduler crate, so everything
//! a script (or a host block implementation) may ask of the engine is routed
//! through this trait. The scheduler implements it; block implementations
//! receive it as `&mut dyn EngineInterface` alongside the VM.

use crate::vm::VirtualMachine;

/// A host block implementation.
///
/// The callback reads its inputs through [`VirtualMachine::read_input`] and
/// pushes any result with [`VirtualMachine::add_return`] or
/// [`VirtualMachine::replace_return`]. The returned count is the number of
/// registers the VM frees after the call: the inputs the callback consumed.
pub type BlockFunction = fn(&mut VirtualMachine, &mut dyn EngineInterface) -> usize;

/// Engine-level operations callable from the VM and from host blocks.
pub trait EngineInterface {
    /// A non-atomic script reached a yield point; the current frame's work
    /// should wind down so the host can redraw and sleep.
    fn break_frame(&mut self);

    /// A block changed something visible. Outside turbo mode the scheduler
    /// stops starting new passes until the next frame.
    fn request_redraw(&mut self);

    /// Start every "when I receive" hat for the broadcast with this index
    /// (backdrop broadcasts start "when backdrop switches to" hats instead).
    fn broadcast(&mut self, index: usize);

    /// True while any script started by this broadcast is still running.
    fn broadcast_running(&self, index: usize) -> bool;

    /// "stop all": kill the active script and schedule every other current
    /// thread for removal at the end of the step.
    fn stop_all(&mut self);

    /// "stop this script": mark the active thread finished.
    fn stop_current_script(&mut self);

    /// Create a clone of the named sprite, or of the active thread's own
    /// sprite when `name` is [`CLONE_MYSELF`]. Silently does nothing when the
    /// clone limit is reached or the sprite does not exist.
    fn init_clone(&mut self, name: &str);

    /// Delete the active thread's target if it is a clone, stopping all of
    /// its scripts.
    fn delete_this_clone(&mut self);

    fn key_pressed(&self, name: &str) -> bool;
    fn mouse_x(&self) -> f64;
    fn mouse_y(&self) -> f64;
    fn mouse_pressed(&self) -> bool;

    fn stage_width(&self) -> u32;
    fn stage_height(&self) -> u32;

    /// Seconds since the project timer was last reset.
    fn timer(&self) -> f64;
    fn reset_timer(&mut self);
}

/// The sprite-name placeholder meaning "the sprite running this script" in
/// [`EngineInterface::init_clone`].
pub const CLONE_MYSELF: &str = "_myself_";
