//! The cooperative scheduler: threads, frames, hats, clones, and the
//! project event loop.
//!
//! One [`Engine`] owns the whole running project. Every frame it performs a
//! step: remove finished threads, run each live thread once per pass until
//! the frame's work budget runs out (75 % of the frame duration) or a thread
//! yields or requests a redraw, then hand control back to the host for
//! rendering and sleep. Scripts start through hats, event-triggered entry
//! points keyed by (target, hat type), and everything a running script asks
//! of the engine arrives through the [`EngineInterface`] it implements.

use crate::broadcast::{Broadcast, BroadcastId};
use crate::clock::{Clock, SystemClock};
use crate::target::{Target, TargetId};
use calico_vm::engine::{EngineInterface, CLONE_MYSELF};
use calico_vm::script::{Script, ScriptId};
use calico_vm::vm::{VirtualMachine, VmFlags};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Share of the frame duration a step may spend running threads.
const WORK_SHARE: f64 = 0.75;

const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_CLONE_LIMIT: i32 = 300;
const DEFAULT_STAGE_WIDTH: u32 = 480;
const DEFAULT_STAGE_HEIGHT: u32 = 360;

// ---------------------------------------------------------------------------
// Hats
// ---------------------------------------------------------------------------

/// The event classes that can start a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HatType {
    GreenFlag,
    BroadcastReceived,
    BackdropChanged,
    CloneInit,
    KeyPressed,
}

impl HatType {
    /// Green-flag, broadcast, and backdrop hats restart a running instance
    /// of the same script in place; clone-init and key hats skip instead.
    fn restarts_existing_threads(self) -> bool {
        matches!(
            self,
            HatType::GreenFlag | HatType::BroadcastReceived | HatType::BackdropChanged
        )
    }
}

/// A script registered under a hat, with the field value the trigger must
/// match (broadcast name, backdrop name, or key name).
#[derive(Clone)]
struct HatScript {
    script: Rc<Script>,
    field: Option<String>,
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// A running script instance: a VM plus the flags and identity the scheduler
/// tracks it by. Cheap to clone; all clones refer to the same VM.
#[derive(Clone)]
pub struct Thread {
    vm: Rc<RefCell<VirtualMachine>>,
    flags: Rc<VmFlags>,
    script_id: ScriptId,
    target: TargetId,
}

impl Thread {
    pub fn at_end(&self) -> bool {
        self.flags.at_end()
    }

    /// Terminate this thread. Safe to call while the thread is the one
    /// currently running; the flags live outside the VM borrow.
    pub fn kill(&self) {
        self.flags.kill();
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn script_id(&self) -> ScriptId {
        self.script_id
    }

    pub fn vm(&self) -> &Rc<RefCell<VirtualMachine>> {
        &self.vm
    }

    fn same(a: &Thread, b: &Thread) -> bool {
        Rc::ptr_eq(&a.vm, &b.vm)
    }
}

// ---------------------------------------------------------------------------
// External events
// ---------------------------------------------------------------------------

/// Requests other threads (input, UI) may send at a running engine. They are
/// queued on a channel and applied between frames, so the engine itself
/// stays single-threaded.
enum ExternalEvent {
    StopAll,
    StopEventLoop,
    Broadcast(String),
    KeyState { name: String, pressed: bool },
    AnyKeyPressed(bool),
    MouseMove { x: f64, y: f64 },
    MousePressed(bool),
}

/// A cloneable, thread-safe handle for poking a running event loop.
#[derive(Clone)]
pub struct EngineHandle {
    sender: Sender<ExternalEvent>,
}

impl EngineHandle {
    pub fn stop_all(&self) {
        let _ = self.sender.send(ExternalEvent::StopAll);
    }

    pub fn stop_event_loop(&self) {
        let _ = self.sender.send(ExternalEvent::StopEventLoop);
    }

    pub fn broadcast(&self, name: &str) {
        let _ = self.sender.send(ExternalEvent::Broadcast(name.to_string()));
    }

    pub fn set_key_state(&self, name: &str, pressed: bool) {
        let _ = self.sender.send(ExternalEvent::KeyState {
            name: name.to_string(),
            pressed,
        });
    }

    pub fn set_any_key_pressed(&self, pressed: bool) {
        let _ = self.sender.send(ExternalEvent::AnyKeyPressed(pressed));
    }

    pub fn set_mouse_position(&self, x: f64, y: f64) {
        let _ = self.sender.send(ExternalEvent::MouseMove { x, y });
    }

    pub fn set_mouse_pressed(&self, pressed: bool) {
        let _ = self.sender.send(ExternalEvent::MousePressed(pressed));
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The project scheduler and world state.
pub struct Engine {
    targets: Vec<Option<Target>>,
    free_slots: Vec<TargetId>,
    /// Back-to-front execution order; the stage is always first.
    executable_targets: Vec<TargetId>,
    clones: Vec<TargetId>,
    broadcasts: Vec<Broadcast>,
    hats: HashMap<(TargetId, HatType), Vec<HatScript>>,
    /// Scripts attached to each regular broadcast, for `broadcast_running`.
    broadcast_scripts: HashMap<BroadcastId, Vec<ScriptId>>,

    threads: Vec<Thread>,
    threads_to_stop: Vec<Thread>,
    active_thread: Option<Thread>,
    running: bool,
    redraw_requested: bool,
    /// Set when a non-atomic script yields; ends the step's passes so a
    /// waiting loop advances once per frame. Ignored in turbo mode.
    frame_break: bool,
    yield_count: u64,
    redraw_handler: Option<Box<dyn FnMut()>>,

    fps: f64,
    frame_duration: Duration,
    turbo_mode: bool,
    clone_limit: i32,
    stage_width: u32,
    stage_height: u32,
    sprite_fencing: bool,

    key_map: HashMap<String, bool>,
    any_key_pressed: bool,
    mouse_x: f64,
    mouse_y: f64,
    mouse_pressed: bool,

    clock: Rc<dyn Clock>,
    timer_epoch: Instant,
    stop_event_loop: bool,
    events_tx: Sender<ExternalEvent>,
    events_rx: Receiver<ExternalEvent>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_clock(Rc::new(SystemClock))
    }

    /// Build an engine over an injected clock (tests, headless batch runs).
    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        let (events_tx, events_rx) = unbounded();
        let timer_epoch = clock.now();
        Self {
            targets: Vec::new(),
            free_slots: Vec::new(),
            executable_targets: Vec::new(),
            clones: Vec::new(),
            broadcasts: Vec::new(),
            hats: HashMap::new(),
            broadcast_scripts: HashMap::new(),
            threads: Vec::new(),
            threads_to_stop: Vec::new(),
            active_thread: None,
            running: false,
            redraw_requested: false,
            frame_break: false,
            yield_count: 0,
            redraw_handler: None,
            fps: DEFAULT_FPS,
            frame_duration: frame_duration_for(DEFAULT_FPS),
            turbo_mode: false,
            clone_limit: DEFAULT_CLONE_LIMIT,
            stage_width: DEFAULT_STAGE_WIDTH,
            stage_height: DEFAULT_STAGE_HEIGHT,
            sprite_fencing: true,
            key_map: HashMap::new(),
            any_key_pressed: false,
            mouse_x: 0.0,
            mouse_y: 0.0,
            mouse_pressed: false,
            clock,
            timer_epoch,
            stop_event_loop: false,
            events_tx,
            events_rx,
        }
    }

    // -- configuration ----------------------------------------------------

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
        self.frame_duration = frame_duration_for(fps);
    }

    pub fn turbo_mode(&self) -> bool {
        self.turbo_mode
    }

    pub fn set_turbo_mode(&mut self, turbo: bool) {
        self.turbo_mode = turbo;
    }

    pub fn clone_limit(&self) -> i32 {
        self.clone_limit
    }

    /// Maximum live clones; negative means unlimited.
    pub fn set_clone_limit(&mut self, limit: i32) {
        self.clone_limit = if limit < 0 { -1 } else { limit };
    }

    pub fn clone_count(&self) -> usize {
        self.clones.len()
    }

    pub fn set_stage_size(&mut self, width: u32, height: u32) {
        self.stage_width = width;
        self.stage_height = height;
    }

    pub fn sprite_fencing_enabled(&self) -> bool {
        self.sprite_fencing
    }

    pub fn set_sprite_fencing_enabled(&mut self, enabled: bool) {
        self.sprite_fencing = enabled;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Total yields signalled by non-atomic scripts since construction.
    pub fn yield_count(&self) -> u64 {
        self.yield_count
    }

    pub fn set_redraw_handler(&mut self, handler: impl FnMut() + 'static) {
        self.redraw_handler = Some(Box::new(handler));
    }

    /// A handle other threads can use to send stop/broadcast/input requests.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            sender: self.events_tx.clone(),
        }
    }

    // -- targets ----------------------------------------------------------

    /// Add a target and slot it into the execution order (stage first, then
    /// ascending layer order).
    pub fn add_target(&mut self, target: Target) -> TargetId {
        let id = self.insert_target(target);
        self.executable_targets.push(id);
        self.executable_targets.sort_by_key(|&t| {
            self.targets[t]
                .as_ref()
                .map(|target| (!target.is_stage() as usize, target.layer_order()))
                .unwrap_or((2, 0))
        });
        self.update_sprite_layer_order();
        id
    }

    pub fn target(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn target_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.targets.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Find a non-clone target by name; `"_stage_"` names the stage.
    pub fn find_target(&self, name: &str) -> Option<TargetId> {
        self.executable_targets.iter().copied().find(|&id| {
            self.target(id).is_some_and(|t| {
                !t.is_clone()
                    && if t.is_stage() {
                        name == "_stage_"
                    } else {
                        t.name() == name
                    }
            })
        })
    }

    pub fn stage(&self) -> Option<TargetId> {
        self.executable_targets
            .iter()
            .copied()
            .find(|&id| self.target(id).is_some_and(|t| t.is_stage()))
    }

    pub fn executable_targets(&self) -> &[TargetId] {
        &self.executable_targets
    }

    // -- broadcasts -------------------------------------------------------

    pub fn add_broadcast(&mut self, name: &str) -> BroadcastId {
        self.broadcasts.push(Broadcast::new(name));
        self.broadcasts.len() - 1
    }

    pub fn add_backdrop_broadcast(&mut self, name: &str) -> BroadcastId {
        self.broadcasts.push(Broadcast::backdrop(name));
        self.broadcasts.len() - 1
    }

    pub fn find_broadcast(&self, name: &str) -> Option<BroadcastId> {
        self.broadcasts.iter().position(|b| b.matches(name))
    }

    pub fn broadcast_at(&self, id: BroadcastId) -> Option<&Broadcast> {
        self.broadcasts.get(id)
    }

    /// Start every hat listening to this broadcast.
    pub fn broadcast(&mut self, id: BroadcastId) {
        let Some(broadcast) = self.broadcasts.get(id) else {
            return;
        };
        let name = broadcast.name().to_string();
        let hat = if broadcast.is_backdrop() {
            HatType::BackdropChanged
        } else {
            HatType::BroadcastReceived
        };
        self.start_hats(hat, Some(&name), None);
    }

    pub fn broadcast_by_name(&mut self, name: &str) {
        if let Some(id) = self.find_broadcast(name) {
            self.broadcast(id);
        }
    }

    /// True while any thread started by this broadcast is still live.
    pub fn broadcast_running(&self, id: BroadcastId) -> bool {
        let Some(broadcast) = self.broadcasts.get(id) else {
            return false;
        };
        if broadcast.is_backdrop() {
            let name = broadcast.name();
            self.threads.iter().any(|t| {
                !t.at_end()
                    && self
                        .hats
                        .get(&(self.hat_root(t.target), HatType::BackdropChanged))
                        .is_some_and(|scripts| {
                            scripts.iter().any(|h| {
                                h.script.id() == t.script_id && h.field.as_deref() == Some(name)
                            })
                        })
            })
        } else {
            let Some(script_ids) = self.broadcast_scripts.get(&id) else {
                return false;
            };
            self.threads
                .iter()
                .any(|t| !t.at_end() && script_ids.contains(&t.script_id))
        }
    }

    /// Switch the stage backdrop and raise the matching backdrop hats.
    pub fn switch_backdrop(&mut self, name: &str) {
        if let Some(stage_id) = self.stage() {
            if let Some(stage) = self.target_mut(stage_id) {
                stage.set_costume_by_name(name);
            }
        }
        self.start_hats(HatType::BackdropChanged, Some(name), None);
    }

    // -- hat registration -------------------------------------------------

    pub fn add_green_flag_script(&mut self, target: TargetId, script: Rc<Script>) {
        self.add_hat(target, HatType::GreenFlag, script, None);
    }

    pub fn add_broadcast_script(
        &mut self,
        target: TargetId,
        script: Rc<Script>,
        broadcast: BroadcastId,
    ) {
        let Some(name) = self.broadcasts.get(broadcast).map(|b| b.name().to_string()) else {
            return;
        };
        let scripts = self.broadcast_scripts.entry(broadcast).or_default();
        if !scripts.contains(&script.id()) {
            scripts.push(script.id());
        }
        self.add_hat(target, HatType::BroadcastReceived, script, Some(name));
    }

    pub fn add_backdrop_change_script(
        &mut self,
        target: TargetId,
        script: Rc<Script>,
        backdrop: &str,
    ) {
        self.add_hat(
            target,
            HatType::BackdropChanged,
            script,
            Some(backdrop.to_string()),
        );
    }

    pub fn add_clone_init_script(&mut self, target: TargetId, script: Rc<Script>) {
        self.add_hat(target, HatType::CloneInit, script, None);
    }

    pub fn add_key_press_script(&mut self, target: TargetId, script: Rc<Script>, key: &str) {
        self.add_hat(target, HatType::KeyPressed, script, Some(key.to_lowercase()));
    }

    fn add_hat(
        &mut self,
        target: TargetId,
        hat: HatType,
        script: Rc<Script>,
        field: Option<String>,
    ) {
        let entry = self.hats.entry((target, hat)).or_default();
        if !entry
            .iter()
            .any(|h| h.script.id() == script.id() && h.field == field)
        {
            entry.push(HatScript { script, field });
        }
    }

    /// Hats of a clone live on the sprite it was cloned from.
    fn hat_root(&self, target: TargetId) -> TargetId {
        self.target(target)
            .and_then(|t| t.clone_root())
            .unwrap_or(target)
    }

    // -- thread management ------------------------------------------------

    /// Start a script on a target and schedule it. The new thread gets its
    /// first tick in the step it was created in.
    pub fn start_script(&mut self, script: &Rc<Script>, target: TargetId) -> Thread {
        let thread = self.spawn_thread(script, target);
        self.threads.push(thread.clone());
        thread
    }

    pub fn stop_script(&mut self, thread: &Thread) {
        thread.kill();
    }

    /// Stop every thread of `target`, except `spared` if given.
    pub fn stop_target(&mut self, target: TargetId, spared: Option<&Thread>) {
        for thread in &self.threads {
            if thread.target == target && !spared.map_or(false, |s| Thread::same(s, thread)) {
                thread.kill();
            }
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    fn spawn_thread(&self, script: &Rc<Script>, target_id: TargetId) -> Thread {
        let needs_rebind = self.target(target_id).is_some_and(|t| t.is_clone());
        let vm = if needs_rebind {
            self.rebind_for_clone(script, target_id).start()
        } else {
            script.start()
        };
        Thread {
            flags: vm.flags(),
            vm: Rc::new(RefCell::new(vm)),
            script_id: script.id(),
            target: target_id,
        }
    }

    /// Swap a script's variable and list references over to a clone's own
    /// cells. References into other targets (the stage's globals) are kept.
    fn rebind_for_clone(&self, script: &Script, clone_id: TargetId) -> Script {
        let Some(clone) = self.target(clone_id) else {
            return script.rebound(script.variables().to_vec(), script.lists().to_vec());
        };
        let root = clone.clone_root().and_then(|id| self.target(id));
        let variables = script
            .variables()
            .iter()
            .map(|cell| {
                root.and_then(|r| {
                    r.variables()
                        .iter()
                        .position(|v| Rc::ptr_eq(v.cell(), cell))
                })
                .and_then(|i| clone.variable_cell(i))
                .unwrap_or_else(|| Rc::clone(cell))
            })
            .collect();
        let lists = script
            .lists()
            .iter()
            .map(|cell| {
                root.and_then(|r| r.lists().iter().position(|l| Rc::ptr_eq(l.cell(), cell)))
                    .and_then(|i| clone.list_cell(i))
                    .unwrap_or_else(|| Rc::clone(cell))
            })
            .collect();
        script.rebound(variables, lists)
    }

    // -- hats -------------------------------------------------------------

    /// Start all hats of a type, optionally filtered by a field value and
    /// restricted to one target. Targets are visited in reverse execution
    /// order (front-most sprite first).
    pub fn start_hats(
        &mut self,
        hat: HatType,
        match_field: Option<&str>,
        only_target: Option<TargetId>,
    ) -> Vec<Thread> {
        let target_ids: Vec<TargetId> = match only_target {
            Some(id) => vec![id],
            None => self.executable_targets.iter().rev().copied().collect(),
        };
        let mut new_threads = Vec::new();
        for target_id in target_ids {
            let root = self.hat_root(target_id);
            let Some(hat_scripts) = self.hats.get(&(root, hat)).cloned() else {
                continue;
            };
            for hat_script in hat_scripts {
                if let Some(expected) = match_field {
                    if hat_script.field.as_deref() != Some(expected) {
                        continue;
                    }
                }
                if hat.restarts_existing_threads() {
                    if let Some(index) = self
                        .threads
                        .iter()
                        .position(|t| t.target == target_id && t.script_id == hat_script.script.id())
                    {
                        let replacement = self.spawn_thread(&hat_script.script, target_id);
                        self.threads[index] = replacement.clone();
                        new_threads.push(replacement);
                        continue;
                    }
                } else if self.threads.iter().any(|t| {
                    t.target == target_id && t.script_id == hat_script.script.id() && !t.at_end()
                }) {
                    continue;
                }
                new_threads.push(self.start_script(&hat_script.script, target_id));
            }
        }
        new_threads
    }

    // -- clones -----------------------------------------------------------

    /// Create a clone of a sprite (or of another clone, which clones its
    /// root's scripts but the source's state). Returns the new target id, or
    /// `None` when the clone limit is reached or the source is unsuitable.
    pub fn init_clone_of(&mut self, source: TargetId) -> Option<TargetId> {
        if self.clone_limit >= 0 && self.clones.len() >= self.clone_limit as usize {
            tracing::warn!(limit = self.clone_limit, "clone limit reached, not cloning");
            return None;
        }
        let source_target = self.target(source)?;
        if source_target.is_stage() {
            return None;
        }
        let root = source_target.clone_root().unwrap_or(source);
        let clone = source_target.instantiate_clone(root);
        let id = self.insert_target(clone);
        self.clones.push(id);
        self.executable_targets.push(id);
        self.update_sprite_layer_order();
        self.start_hats(HatType::CloneInit, None, Some(id));
        Some(id)
    }

    /// Forget a clone. Its threads are not touched; callers that want them
    /// gone stop them first.
    pub fn delete_clone(&mut self, clone: TargetId) {
        self.clones.retain(|&c| c != clone);
        self.executable_targets.retain(|&t| t != clone);
        if let Some(slot) = self.targets.get_mut(clone) {
            if slot.take().is_some() {
                self.free_slots.push(clone);
            }
        }
        self.update_sprite_layer_order();
    }

    fn delete_all_clones(&mut self) {
        for clone in std::mem::take(&mut self.clones) {
            self.executable_targets.retain(|&t| t != clone);
            if let Some(slot) = self.targets.get_mut(clone) {
                if slot.take().is_some() {
                    self.free_slots.push(clone);
                }
            }
        }
        self.update_sprite_layer_order();
    }

    fn insert_target(&mut self, target: Target) -> TargetId {
        match self.free_slots.pop() {
            Some(id) => {
                self.targets[id] = Some(target);
                id
            }
            None => {
                self.targets.push(Some(target));
                self.targets.len() - 1
            }
        }
    }

    // -- layer order ------------------------------------------------------

    pub fn move_sprite_to_front(&mut self, sprite: TargetId) {
        if self.executable_targets.len() <= 2 {
            return;
        }
        if let Some(pos) = self.sprite_position(sprite) {
            let id = self.executable_targets.remove(pos);
            self.executable_targets.push(id);
            self.update_sprite_layer_order();
        }
    }

    pub fn move_sprite_to_back(&mut self, sprite: TargetId) {
        if self.executable_targets.len() <= 2 {
            return;
        }
        if let Some(pos) = self.sprite_position(sprite) {
            let id = self.executable_targets.remove(pos);
            self.executable_targets.insert(1, id); // the stage stays first
            self.update_sprite_layer_order();
        }
    }

    pub fn move_sprite_forward_layers(&mut self, sprite: TargetId, layers: i32) {
        if layers == 0 {
            return;
        }
        let Some(pos) = self.sprite_position(sprite) else {
            return;
        };
        let id = self.executable_targets.remove(pos);
        let top = self.executable_targets.len() as i64;
        let new_pos = (pos as i64 + layers as i64).clamp(1, top) as usize;
        self.executable_targets.insert(new_pos, id);
        self.update_sprite_layer_order();
    }

    pub fn move_sprite_backward_layers(&mut self, sprite: TargetId, layers: i32) {
        self.move_sprite_forward_layers(sprite, -layers);
    }

    /// Place `sprite` directly behind `other` in the draw order.
    pub fn move_sprite_behind_other(&mut self, sprite: TargetId, other: TargetId) {
        if sprite == other {
            return;
        }
        let (Some(pos), Some(_)) = (self.sprite_position(sprite), self.sprite_position(other))
        else {
            return;
        };
        let id = self.executable_targets.remove(pos);
        let other_pos = self
            .sprite_position(other)
            .expect("other still present after removal");
        self.executable_targets.insert(other_pos.max(1), id);
        self.update_sprite_layer_order();
    }

    fn sprite_position(&self, sprite: TargetId) -> Option<usize> {
        // The stage never moves.
        if self.target(sprite).map_or(true, |t| t.is_stage()) {
            return None;
        }
        self.executable_targets.iter().position(|&t| t == sprite)
    }

    fn update_sprite_layer_order(&mut self) {
        for layer in 1..self.executable_targets.len() {
            let id = self.executable_targets[layer];
            if let Some(target) = self.targets.get_mut(id).and_then(|slot| slot.as_mut()) {
                target.set_layer_order(layer);
            }
        }
    }

    // -- input state ------------------------------------------------------

    pub fn key_pressed(&self, name: &str) -> bool {
        if name == "any" {
            return self.any_key_pressed || self.key_map.values().any(|&pressed| pressed);
        }
        self.key_map
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(false)
    }

    /// Record a key transition; a press also fires "when key pressed" hats
    /// for the key and for "any".
    pub fn set_key_state(&mut self, name: &str, pressed: bool) {
        let key = name.to_lowercase();
        self.key_map.insert(key.clone(), pressed);
        if pressed {
            self.start_hats(HatType::KeyPressed, Some(&key), None);
            self.start_hats(HatType::KeyPressed, Some("any"), None);
        }
    }

    pub fn set_any_key_pressed(&mut self, pressed: bool) {
        self.any_key_pressed = pressed;
        if pressed {
            self.start_hats(HatType::KeyPressed, Some("any"), None);
        }
    }

    pub fn mouse_x(&self) -> f64 {
        self.mouse_x
    }

    pub fn mouse_y(&self) -> f64 {
        self.mouse_y
    }

    pub fn set_mouse_position(&mut self, x: f64, y: f64) {
        self.mouse_x = x;
        self.mouse_y = y;
    }

    pub fn mouse_pressed(&self) -> bool {
        self.mouse_pressed
    }

    pub fn set_mouse_pressed(&mut self, pressed: bool) {
        self.mouse_pressed = pressed;
    }

    // -- timer ------------------------------------------------------------

    /// Seconds since the project timer was last reset.
    pub fn timer(&self) -> f64 {
        self.clock
            .now()
            .duration_since(self.timer_epoch)
            .as_secs_f64()
    }

    pub fn reset_timer(&mut self) {
        self.timer_epoch = self.clock.now();
    }

    // -- lifecycle --------------------------------------------------------

    /// Green flag: wipe clones, reset the timer, and start GreenFlag hats.
    pub fn start(&mut self) {
        self.delete_all_clones();
        self.reset_timer();
        self.running = true;
        self.start_hats(HatType::GreenFlag, None, None);
    }

    /// Stop-all. When called from inside a running script the project keeps
    /// going for the rest of the step: the active thread dies immediately,
    /// every other current thread is removed after this step's pass, and
    /// threads those scripts start meanwhile survive. Called from outside a
    /// step, everything stops at once.
    pub fn stop(&mut self) {
        self.delete_all_clones();
        match self.active_thread.clone() {
            Some(active) => {
                active.kill();
                self.threads_to_stop = self.threads.clone();
            }
            None => {
                self.threads.clear();
                self.running = false;
            }
        }
    }

    /// One frame's worth of script execution plus the redraw callback.
    pub fn step(&mut self) {
        self.threads.retain(|t| !t.at_end());
        self.redraw_requested = false;
        self.frame_break = false;
        self.step_threads();
        if let Some(handler) = &mut self.redraw_handler {
            handler();
        }
    }

    /// Run passes over the thread list until the work budget is exhausted,
    /// every thread finished, or a redraw/yield gate closes the frame.
    /// Returns the threads that finished during this step.
    fn step_threads(&mut self) -> Vec<Thread> {
        let work_budget = self.frame_duration.mul_f64(WORK_SHARE);
        let step_start = self.clock.now();
        let mut num_active = 1usize;
        let mut done = Vec::new();

        while !self.threads.is_empty()
            && num_active > 0
            && self.clock.now().duration_since(step_start) < work_budget
            && (self.turbo_mode || (!self.redraw_requested && !self.frame_break))
        {
            num_active = 0;

            // One pass: attempt to run each thread once. Threads pushed
            // during the pass are picked up by the growing upper bound.
            let mut index = 0;
            while index < self.threads.len() {
                let thread = self.threads[index].clone();
                index += 1;
                if thread.at_end() {
                    continue;
                }
                self.active_thread = Some(thread.clone());
                thread.vm.borrow_mut().run(self);
                if !thread.at_end() {
                    num_active += 1;
                }
            }

            let stops = std::mem::take(&mut self.threads_to_stop);
            if !stops.is_empty() {
                self.threads
                    .retain(|t| !stops.iter().any(|s| Thread::same(s, t)));
            }
            self.threads.retain(|t| {
                if t.at_end() {
                    tracing::debug!(script = t.script_id.as_u64(), "thread finished");
                    done.push(t.clone());
                    false
                } else {
                    true
                }
            });
        }

        if self.threads.is_empty() {
            self.running = false;
        }
        self.active_thread = None;
        done
    }

    /// Green flag, then frames until the project has no threads left.
    pub fn run(&mut self) {
        self.start();
        self.event_loop(true);
    }

    /// Frames forever, until [`Engine::stop_event_loop`] (or a handle) asks
    /// to exit.
    pub fn run_event_loop(&mut self) {
        self.event_loop(false);
    }

    pub fn stop_event_loop(&mut self) {
        self.stop_event_loop = true;
    }

    fn event_loop(&mut self, until_project_stops: bool) {
        self.stop_event_loop = false;
        loop {
            let tick_start = self.clock.now();
            self.process_external_events();
            self.step();

            if until_project_stops && self.threads.is_empty() {
                break;
            }
            if self.stop_event_loop {
                break;
            }

            let elapsed = self.clock.now().duration_since(tick_start);
            if let Some(remaining) = self.frame_duration.checked_sub(elapsed) {
                if !remaining.is_zero() {
                    self.clock.sleep(remaining);
                }
            }
        }
        self.finalize();
    }

    /// Apply requests queued through [`EngineHandle`]s. The event loop calls
    /// this once per frame; step-driven embedders call it themselves.
    pub fn process_external_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                ExternalEvent::StopAll => self.stop(),
                ExternalEvent::StopEventLoop => self.stop_event_loop = true,
                ExternalEvent::Broadcast(name) => self.broadcast_by_name(&name),
                ExternalEvent::KeyState { name, pressed } => self.set_key_state(&name, pressed),
                ExternalEvent::AnyKeyPressed(pressed) => self.set_any_key_pressed(pressed),
                ExternalEvent::MouseMove { x, y } => self.set_mouse_position(x, y),
                ExternalEvent::MousePressed(pressed) => self.set_mouse_pressed(pressed),
            }
        }
    }

    fn finalize(&mut self) {
        self.threads.clear();
        self.running = false;
        self.redraw_requested = false;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_duration_for(fps: f64) -> Duration {
    Duration::from_millis((1000.0 / fps) as u64)
}

// ---------------------------------------------------------------------------
// EngineInterface: what scripts and host blocks see
// ---------------------------------------------------------------------------

impl EngineInterface for Engine {
    fn break_frame(&mut self) {
        self.frame_break = true;
        self.yield_count += 1;
    }

    fn request_redraw(&mut self) {
        self.redraw_requested = true;
    }

    fn broadcast(&mut self, index: usize) {
        Engine::broadcast(self, index);
    }

    fn broadcast_running(&self, index: usize) -> bool {
        Engine::broadcast_running(self, index)
    }

    fn stop_all(&mut self) {
        self.stop();
    }

    fn stop_current_script(&mut self) {
        if let Some(active) = &self.active_thread {
            active.kill();
        }
    }

    fn init_clone(&mut self, name: &str) {
        let source = if name == CLONE_MYSELF {
            self.active_thread.as_ref().map(|t| t.target)
        } else {
            self.find_target(name)
        };
        if let Some(source) = source {
            self.init_clone_of(source);
        }
    }

    fn delete_this_clone(&mut self) {
        let Some(active) = self.active_thread.clone() else {
            return;
        };
        if self.target(active.target).is_some_and(|t| t.is_clone()) {
            self.stop_target(active.target, None);
            self.delete_clone(active.target);
        }
    }

    fn key_pressed(&self, name: &str) -> bool {
        Engine::key_pressed(self, name)
    }

    fn mouse_x(&self) -> f64 {
        self.mouse_x
    }

    fn mouse_y(&self) -> f64 {
        self.mouse_y
    }

    fn mouse_pressed(&self) -> bool {
        self.mouse_pressed
    }

    fn stage_width(&self) -> u32 {
        self.stage_width
    }

    fn stage_height(&self) -> u32 {
        self.stage_height
    }

    fn timer(&self) -> f64 {
        Engine::timer(self)
    }

    fn reset_timer(&mut self) {
        Engine::reset_timer(self);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use calico_vm::bytecode::Op;
    use calico_vm::value::Value;

    fn test_engine() -> Engine {
        Engine::with_clock(Rc::new(ManualClock::new()))
    }

    /// A script that stores a constant into variable 0 and halts.
    fn set_var_script(cell: Rc<RefCell<Value>>, value: f64) -> Rc<Script> {
        let mut script = Script::new(vec![
            0,
            Op::Const as u32,
            0,
            Op::SetVar as u32,
            0,
            Op::Halt as u32,
        ]);
        script.set_constants(vec![Value::from(value)]);
        script.set_variables(vec![cell]);
        Rc::new(script)
    }

    /// forever { BREAK_ATOMIC; change var 0 by 1 }
    fn counting_loop_script(cell: Rc<RefCell<Value>>) -> Rc<Script> {
        let mut script = Script::new(vec![
            0,
            Op::ForeverLoop as u32,
            Op::BreakAtomic as u32,
            Op::Const as u32,
            0,
            Op::ChangeVar as u32,
            0,
            Op::LoopEnd as u32,
            Op::Halt as u32,
        ]);
        script.set_constants(vec![Value::from(1.0)]);
        script.set_variables(vec![cell]);
        Rc::new(script)
    }

    fn world_with_sprite(engine: &mut Engine, name: &str) -> TargetId {
        engine.add_target(Target::stage());
        engine.add_target(Target::sprite(name))
    }

    #[test]
    fn add_target_keeps_stage_first() {
        let mut engine = test_engine();
        let sprite = engine.add_target(Target::sprite("Cat"));
        let stage = engine.add_target(Target::stage());
        assert_eq!(engine.executable_targets(), &[stage, sprite]);
        assert_eq!(engine.target(sprite).unwrap().layer_order(), 1);
    }

    #[test]
    fn layer_moves_keep_the_stage_pinned() {
        let mut engine = test_engine();
        let stage = engine.add_target(Target::stage());
        let a = engine.add_target(Target::sprite("A"));
        let b = engine.add_target(Target::sprite("B"));
        let c = engine.add_target(Target::sprite("C"));

        engine.move_sprite_to_front(a);
        assert_eq!(engine.executable_targets(), &[stage, b, c, a]);

        engine.move_sprite_to_back(a);
        assert_eq!(engine.executable_targets(), &[stage, a, b, c]);

        engine.move_sprite_forward_layers(a, 2);
        assert_eq!(engine.executable_targets(), &[stage, b, c, a]);

        engine.move_sprite_backward_layers(a, 10);
        assert_eq!(engine.executable_targets(), &[stage, a, b, c]);

        engine.move_sprite_behind_other(c, b);
        assert_eq!(engine.executable_targets(), &[stage, a, c, b]);

        engine.move_sprite_to_front(stage);
        assert_eq!(engine.executable_targets()[0], stage);
    }

    #[test]
    fn green_flag_starts_registered_hats() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let cell = Rc::new(RefCell::new(Value::from(0.0)));
        engine.add_green_flag_script(sprite, set_var_script(Rc::clone(&cell), 42.0));

        engine.start();
        assert_eq!(engine.thread_count(), 1);
        engine.step();
        assert_eq!(cell.borrow().to_number(), 42.0);
        assert!(!engine.is_running());
    }

    #[test]
    fn green_flag_restarts_running_threads_in_place() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let cell = Rc::new(RefCell::new(Value::from(0.0)));
        engine.add_green_flag_script(sprite, counting_loop_script(cell));

        engine.start();
        engine.step();
        assert_eq!(engine.thread_count(), 1);

        let restarted = engine.start_hats(HatType::GreenFlag, None, None);
        assert_eq!(restarted.len(), 1);
        assert_eq!(engine.thread_count(), 1);
    }

    #[test]
    fn clone_init_hats_do_not_restart_live_threads() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let cell = Rc::new(RefCell::new(Value::from(0.0)));
        engine.add_clone_init_script(sprite, counting_loop_script(cell));

        let first = engine.start_hats(HatType::CloneInit, None, Some(sprite));
        assert_eq!(first.len(), 1);
        let second = engine.start_hats(HatType::CloneInit, None, Some(sprite));
        assert!(second.is_empty());
        assert_eq!(engine.thread_count(), 1);
    }

    #[test]
    fn clone_limit_refuses_silently() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        engine.set_clone_limit(2);
        assert!(engine.init_clone_of(sprite).is_some());
        assert!(engine.init_clone_of(sprite).is_some());
        assert!(engine.init_clone_of(sprite).is_none());
        assert_eq!(engine.clone_count(), 2);

        engine.set_clone_limit(-1);
        assert!(engine.init_clone_of(sprite).is_some());
    }

    #[test]
    fn deleted_clone_slots_are_reused() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let clone = engine.init_clone_of(sprite).unwrap();
        engine.delete_clone(clone);
        assert!(engine.target(clone).is_none());
        assert_eq!(engine.clone_count(), 0);

        let reused = engine.init_clone_of(sprite).unwrap();
        assert_eq!(reused, clone);
    }

    #[test]
    fn cloning_a_clone_tracks_the_original_root() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let clone = engine.init_clone_of(sprite).unwrap();
        let grandclone = engine.init_clone_of(clone).unwrap();
        assert_eq!(
            engine.target(grandclone).unwrap().clone_root(),
            Some(sprite)
        );
    }

    #[test]
    fn key_state_fires_key_hats_once_per_press() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let cell = Rc::new(RefCell::new(Value::from(0.0)));
        engine.add_key_press_script(sprite, counting_loop_script(cell), "Space");

        engine.set_key_state("SPACE", true);
        assert_eq!(engine.thread_count(), 1);
        assert!(engine.key_pressed("space"));
        assert!(engine.key_pressed("any"));

        // Still held: the live thread blocks a second start.
        engine.step();
        engine.set_key_state("space", true);
        assert_eq!(engine.thread_count(), 1);

        engine.set_key_state("space", false);
        assert!(!engine.key_pressed("space"));
    }

    #[test]
    fn broadcast_scripts_match_by_name() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let go = engine.add_broadcast("go");
        let other = engine.add_broadcast("other");
        let cell = Rc::new(RefCell::new(Value::from(0.0)));
        engine.add_broadcast_script(sprite, set_var_script(Rc::clone(&cell), 1.0), go);

        engine.broadcast(other);
        assert_eq!(engine.thread_count(), 0);

        engine.broadcast(go);
        assert_eq!(engine.thread_count(), 1);
        assert!(engine.broadcast_running(go));
        engine.step();
        assert!(!engine.broadcast_running(go));
    }

    #[test]
    fn external_events_are_applied_when_pumped() {
        let mut engine = test_engine();
        let sprite = world_with_sprite(&mut engine, "Cat");
        let go = engine.add_broadcast("go");
        let cell = Rc::new(RefCell::new(Value::from(0.0)));
        engine.add_broadcast_script(sprite, set_var_script(Rc::clone(&cell), 5.0), go);

        let handle = engine.handle();
        handle.broadcast("go");
        handle.set_mouse_position(12.0, -7.0);
        handle.set_mouse_pressed(true);
        assert_eq!(engine.thread_count(), 0);

        engine.process_external_events();
        assert_eq!(engine.thread_count(), 1);
        assert_eq!(engine.mouse_x(), 12.0);
        assert_eq!(engine.mouse_y(), -7.0);
        assert!(engine.mouse_pressed());
    }

    #[test]
    fn timer_follows_the_injected_clock() {
        let clock = Rc::new(ManualClock::new());
        let mut engine = Engine::with_clock(Rc::clone(&clock) as Rc<dyn Clock>);
        clock.advance(Duration::from_secs(2));
        assert_eq!(engine.timer(), 2.0);
        engine.reset_timer();
        assert_eq!(engine.timer(), 0.0);
    }
}
