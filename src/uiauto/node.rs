use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Symbolic accessibility role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Alert,
    AlertDialog,
    Button,
    CheckBox,
    ComboBoxSelect,
    Dialog,
    GenericContainer,
    Heading,
    Image,
    Link,
    List,
    ListBox,
    ListBoxOption,
    ListItem,
    Menu,
    MenuItem,
    MenuListOption,
    PopUpButton,
    RadioButton,
    RootWebArea,
    ScrollBar,
    SearchBox,
    Slider,
    StaticText,
    Switch,
    Tab,
    TabList,
    TextField,
    Toolbar,
    Tree,
    TreeItem,
    WebView,
    Window,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Alert => "alert",
            Role::AlertDialog => "alertDialog",
            Role::Button => "button",
            Role::CheckBox => "checkBox",
            Role::ComboBoxSelect => "comboBoxSelect",
            Role::Dialog => "dialog",
            Role::GenericContainer => "genericContainer",
            Role::Heading => "heading",
            Role::Image => "image",
            Role::Link => "link",
            Role::List => "list",
            Role::ListBox => "listBox",
            Role::ListBoxOption => "listBoxOption",
            Role::ListItem => "listItem",
            Role::Menu => "menu",
            Role::MenuItem => "menuItem",
            Role::MenuListOption => "menuListOption",
            Role::PopUpButton => "popUpButton",
            Role::RadioButton => "radioButton",
            Role::RootWebArea => "rootWebArea",
            Role::ScrollBar => "scrollBar",
            Role::SearchBox => "searchBox",
            Role::Slider => "slider",
            Role::StaticText => "staticText",
            Role::Switch => "switch",
            Role::Tab => "tab",
            Role::TabList => "tabList",
            Role::TextField => "textField",
            Role::Toolbar => "toolbar",
            Role::Tree => "tree",
            Role::TreeItem => "treeItem",
            Role::WebView => "webView",
            Role::Window => "window",
            Role::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accessibility event kinds observable through a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Alert,
    ChildrenChanged,
    Clicked,
    Focus,
    LoadComplete,
    LocationChanged,
    MenuStart,
    MenuEnd,
    ScrollPositionChanged,
    TextSelectionChanged,
    ValueChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Alert => "alert",
            EventKind::ChildrenChanged => "childrenChanged",
            EventKind::Clicked => "clicked",
            EventKind::Focus => "focus",
            EventKind::LoadComplete => "loadComplete",
            EventKind::LocationChanged => "locationChanged",
            EventKind::MenuStart => "menuStart",
            EventKind::MenuEnd => "menuEnd",
            EventKind::ScrollPositionChanged => "scrollPositionChanged",
            EventKind::TextSelectionChanged => "textSelectionChanged",
            EventKind::ValueChanged => "valueChanged",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Linear interpolation towards `to`; `t` in `0.0..=1.0`.
    pub fn lerp(self, to: Point, t: f64) -> Point {
        let t = t.clamp(0.0, 1.0);
        Point {
            x: self.x + ((to.x - self.x) as f64 * t).round() as i32,
            y: self.y + ((to.y - self.y) as f64 * t).round() as i32,
        }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Screen rectangle in integer pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.left + self.width / 2, self.top + self.height / 2)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left
            && point.x < self.left + self.width
            && point.y >= self.top
            && point.y < self.top + self.height
    }
}

/// One node of an accessibility tree snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub location: Rect,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub children: Vec<NodeInfo>,
}

impl NodeInfo {
    pub fn new(role: Role, name: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    pub fn at(mut self, location: Rect) -> Self {
        self.location = location;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_children(mut self, children: Vec<NodeInfo>) -> Self {
        self.children = children;
        self
    }

    pub fn attribute_bool(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Follow a child-index path from this node.
    pub fn at_path(&self, path: &[usize]) -> Option<&NodeInfo> {
        let mut current = self;
        for &index in path {
            current = current.children.get(index)?;
        }
        Some(current)
    }

    /// Copy of this node without its subtree.
    pub fn shallow(&self) -> NodeInfo {
        NodeInfo {
            children: Vec::new(),
            ..self.clone()
        }
    }
}

/// Transient handle to a located node: its path from the root plus the
/// node's properties when it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRef {
    pub path: Vec<usize>,
    pub info: NodeInfo,
}

impl NodeRef {
    pub fn location(&self) -> Rect {
        self.info.location
    }
}

/// An accessibility event captured by a watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEvent {
    pub kind: EventKind,
    pub target: NodeInfo,
}
