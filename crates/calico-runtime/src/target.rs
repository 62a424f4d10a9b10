//! Targets: the stage and its sprites, each owning variables, lists,
//! costumes, and (for sprites) position state.

use calico_vm::list::List;
use calico_vm::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Index into the engine's target table. Clones get fresh ids; ids of
/// deleted clones may be reused.
pub type TargetId = usize;

/// A named variable owned by a target. Scripts reference the value cell
/// directly; the engine and monitors go through the name.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    value: Rc<RefCell<Value>>,
    is_cloud: bool,
}

impl Variable {
    pub fn new(name: &str, initial: Value) -> Self {
        Self {
            name: name.to_string(),
            value: Rc::new(RefCell::new(initial)),
            is_cloud: false,
        }
    }

    pub fn cloud(name: &str, initial: Value) -> Self {
        Self {
            is_cloud: true,
            ..Self::new(name, initial)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell(&self) -> &Rc<RefCell<Value>> {
        &self.value
    }

    pub fn is_cloud(&self) -> bool {
        self.is_cloud
    }
}

/// A named list owned by a target.
#[derive(Debug, Clone)]
pub struct NamedList {
    name: String,
    list: Rc<RefCell<List>>,
}

impl NamedList {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            list: Rc::new(RefCell::new(List::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell(&self) -> &Rc<RefCell<List>> {
        &self.list
    }
}

/// How a sprite's costume responds to its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStyle {
    #[default]
    AllAround,
    LeftRight,
    DoNotRotate,
}

impl RotationStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            RotationStyle::AllAround => "all around",
            RotationStyle::LeftRight => "left-right",
            RotationStyle::DoNotRotate => "don't rotate",
        }
    }

    /// Parse the project-file spelling; unknown strings keep the default.
    pub fn from_str(name: &str) -> Self {
        match name {
            "left-right" => RotationStyle::LeftRight,
            "don't rotate" => RotationStyle::DoNotRotate,
            _ => RotationStyle::AllAround,
        }
    }
}

/// A sprite or the stage: the owning scope for variables, lists, costumes,
/// and layer position. Sprite-only state (position, size, direction) is
/// meaningless on the stage and left at its defaults there.
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    is_stage: bool,
    layer_order: usize,
    variables: Vec<Variable>,
    lists: Vec<NamedList>,
    costumes: Vec<String>,
    current_costume: usize,
    clone_root: Option<TargetId>,
    x: f64,
    y: f64,
    size: f64,
    direction: f64,
    visible: bool,
    draggable: bool,
    rotation_style: RotationStyle,
}

impl Target {
    pub fn sprite(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_stage: false,
            layer_order: 0,
            variables: Vec::new(),
            lists: Vec::new(),
            costumes: Vec::new(),
            current_costume: 0,
            clone_root: None,
            x: 0.0,
            y: 0.0,
            size: 100.0,
            direction: 90.0,
            visible: true,
            draggable: false,
            rotation_style: RotationStyle::AllAround,
        }
    }

    pub fn stage() -> Self {
        Self {
            is_stage: true,
            ..Self::sprite("Stage")
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stage(&self) -> bool {
        self.is_stage
    }

    pub fn is_clone(&self) -> bool {
        self.clone_root.is_some()
    }

    /// The sprite this clone was made from, if this target is a clone.
    pub fn clone_root(&self) -> Option<TargetId> {
        self.clone_root
    }

    pub fn layer_order(&self) -> usize {
        self.layer_order
    }

    pub(crate) fn set_layer_order(&mut self, layer: usize) {
        self.layer_order = layer;
    }

    // -- variables --------------------------------------------------------

    /// Add a variable and return its index.
    pub fn add_variable(&mut self, variable: Variable) -> usize {
        self.variables.push(variable);
        self.variables.len() - 1
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable_at(&self, index: usize) -> Option<&Variable> {
        self.variables.get(index)
    }

    /// The value cell at `index`, as referenced from compiled scripts.
    pub fn variable_cell(&self, index: usize) -> Option<Rc<RefCell<Value>>> {
        self.variables.get(index).map(|v| Rc::clone(v.cell()))
    }

    pub fn find_variable(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name() == name)
    }

    // -- lists ------------------------------------------------------------

    /// Add a list and return its index.
    pub fn add_list(&mut self, list: NamedList) -> usize {
        self.lists.push(list);
        self.lists.len() - 1
    }

    pub fn lists(&self) -> &[NamedList] {
        &self.lists
    }

    pub fn list_at(&self, index: usize) -> Option<&NamedList> {
        self.lists.get(index)
    }

    pub fn list_cell(&self, index: usize) -> Option<Rc<RefCell<List>>> {
        self.lists.get(index).map(|l| Rc::clone(l.cell()))
    }

    pub fn find_list(&self, name: &str) -> Option<usize> {
        self.lists.iter().position(|l| l.name() == name)
    }

    // -- costumes ---------------------------------------------------------

    pub fn add_costume(&mut self, name: &str) -> usize {
        self.costumes.push(name.to_string());
        self.costumes.len() - 1
    }

    pub fn costume_count(&self) -> usize {
        self.costumes.len()
    }

    pub fn current_costume(&self) -> usize {
        self.current_costume
    }

    pub fn costume_name(&self) -> Option<&str> {
        self.costumes.get(self.current_costume).map(|s| s.as_str())
    }

    /// Switch to the costume at `index`; out-of-range indices are ignored.
    pub fn set_costume(&mut self, index: usize) {
        if index < self.costumes.len() {
            self.current_costume = index;
        }
    }

    pub fn set_costume_by_name(&mut self, name: &str) -> bool {
        match self.costumes.iter().position(|c| c == name) {
            Some(index) => {
                self.current_costume = index;
                true
            }
            None => false,
        }
    }

    // -- sprite state -----------------------------------------------------

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn set_position(&mut self, x: f64, y: f64) {
        self.x = x;
        self.y = y;
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn set_size(&mut self, size: f64) {
        self.size = size;
    }

    pub fn direction(&self) -> f64 {
        self.direction
    }

    /// Set the heading, wrapped into (-180, 180] like the motion blocks do.
    pub fn set_direction(&mut self, direction: f64) {
        let mut wrapped = direction % 360.0;
        if wrapped > 180.0 {
            wrapped -= 360.0;
        } else if wrapped <= -180.0 {
            wrapped += 360.0;
        }
        self.direction = wrapped;
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn draggable(&self) -> bool {
        self.draggable
    }

    pub fn set_draggable(&mut self, draggable: bool) {
        self.draggable = draggable;
    }

    pub fn rotation_style(&self) -> RotationStyle {
        self.rotation_style
    }

    pub fn set_rotation_style(&mut self, style: RotationStyle) {
        self.rotation_style = style;
    }

    // -- clones -----------------------------------------------------------

    /// A runtime copy of this target: same names and scripts, fresh variable
    /// and list cells holding copies of the current values, current sprite
    /// state. `root` is the original sprite clones trace their hats to.
    pub fn instantiate_clone(&self, root: TargetId) -> Target {
        let mut clone = self.clone();
        clone.clone_root = Some(root);
        clone.variables = self
            .variables
            .iter()
            .map(|v| Variable {
                name: v.name.clone(),
                value: Rc::new(RefCell::new(v.cell().borrow().clone())),
                is_cloud: v.is_cloud,
            })
            .collect();
        clone.lists = self
            .lists
            .iter()
            .map(|l| {
                let copied = NamedList::new(l.name());
                *copied.cell().borrow_mut() = l.cell().borrow().clone();
                copied
            })
            .collect();
        clone
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
