//! Broadcast messages, identified by stable ids.

/// Index into the engine's broadcast table. Both scripts and hat registries
/// refer to broadcasts by this id, never by pointer or by interned name.
pub type BroadcastId = usize;

/// A broadcast message. Backdrop broadcasts are raised by backdrop switches
/// and start "when backdrop switches to" hats instead of "when I receive"
/// hats.
#[derive(Debug, Clone)]
pub struct Broadcast {
    name: String,
    is_backdrop: bool,
}

impl Broadcast {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_backdrop: false,
        }
    }

    pub fn backdrop(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_backdrop: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_backdrop(&self) -> bool {
        self.is_backdrop
    }

    /// Broadcast names match case-insensitively.
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}
