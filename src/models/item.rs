//! Item lifecycle states and typed property values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of an in-memory item (node or property).
///
/// Transitions are few and explicit:
///
/// - `New` items were created in this session and have never been saved.
/// - `Clean` items mirror the backend exactly.
/// - `Modified` items carry local changes that `save` must flush.
/// - `Moved` nodes had their path rewritten by a pending move.
/// - `Deleted` items were removed (directly or by cascade).
/// - `Dirty` items must be re-read from the backend before the next access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    New,
    Clean,
    Modified,
    Moved,
    Deleted,
    Dirty,
}

impl ItemState {
    /// True for states that `save` must push to the backend.
    pub fn needs_flush(&self) -> bool {
        matches!(self, ItemState::New | ItemState::Modified | ItemState::Moved)
    }
}

/// Declared type tag of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyType {
    String,
    Name,
    Path,
    Uri,
    Reference,
    WeakReference,
    Binary,
    Date,
    Long,
    Double,
    Decimal,
    Boolean,
}

impl PropertyType {
    /// Parse a payload type-metadata tag (case-insensitive).
    pub fn from_metadata(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "string" => Some(PropertyType::String),
            "name" => Some(PropertyType::Name),
            "path" => Some(PropertyType::Path),
            "uri" => Some(PropertyType::Uri),
            "reference" => Some(PropertyType::Reference),
            "weakreference" => Some(PropertyType::WeakReference),
            "binary" => Some(PropertyType::Binary),
            "date" => Some(PropertyType::Date),
            "long" => Some(PropertyType::Long),
            "double" => Some(PropertyType::Double),
            "decimal" => Some(PropertyType::Decimal),
            "boolean" => Some(PropertyType::Boolean),
            _ => None,
        }
    }

    /// Infer a type tag from the JSON shape of a payload value.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => PropertyType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => PropertyType::Long,
            Value::Number(_) => PropertyType::Double,
            _ => PropertyType::String,
        }
    }
}

/// A typed, named value (or ordered value list) attached to a node.
///
/// A removed property's prior object is retained by its parent node until
/// the removal is saved, so that a refresh can restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property name, unique within its parent node
    pub name: String,

    /// Declared type tag
    #[serde(rename = "type")]
    pub property_type: PropertyType,

    /// Whether the property holds an ordered list of values
    pub multi_valued: bool,

    /// Value(s); single-valued properties hold exactly one entry.
    /// Binary values are metadata only (the size or size list); the actual
    /// bytes are streamed on demand through the transport.
    pub values: Vec<Value>,

    /// Lifecycle state
    pub state: ItemState,

    /// State snapshot taken at `begin_transaction`, restored on rollback
    #[serde(skip)]
    saved_state: Option<ItemState>,
}

impl Property {
    /// Create a single-valued property, staged as new.
    pub fn new(name: impl Into<String>, property_type: PropertyType, value: Value) -> Self {
        Self {
            name: name.into(),
            property_type,
            multi_valued: false,
            values: vec![value],
            state: ItemState::New,
            saved_state: None,
        }
    }

    /// Create a multi-valued property, staged as new.
    pub fn new_multi(
        name: impl Into<String>,
        property_type: PropertyType,
        values: Vec<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            property_type,
            multi_valued: true,
            values,
            state: ItemState::New,
            saved_state: None,
        }
    }

    /// The single value; `None` for multi-valued properties.
    pub fn value(&self) -> Option<&Value> {
        if self.multi_valued {
            None
        } else {
            self.values.first()
        }
    }

    /// Replace the value(s), marking the property modified unless it is
    /// still new.
    pub fn set_values(&mut self, values: Vec<Value>, multi_valued: bool) {
        self.values = values;
        self.multi_valued = multi_valued;
        if self.state != ItemState::New {
            self.state = ItemState::Modified;
        }
    }

    /// Mark the property as saved.
    pub fn confirm_saved(&mut self) {
        self.state = ItemState::Clean;
    }

    pub fn is_new(&self) -> bool {
        self.state == ItemState::New
    }

    pub fn is_clean(&self) -> bool {
        self.state == ItemState::Clean
    }

    /// Snapshot the lifecycle state at transaction begin.
    pub fn begin_transaction(&mut self) {
        self.saved_state = Some(self.state);
    }

    /// Drop the transaction snapshot after a successful commit.
    pub fn commit_transaction(&mut self) {
        self.saved_state = None;
    }

    /// Restore the state recorded at transaction begin.
    pub fn rollback_transaction(&mut self) {
        if let Some(saved) = self.saved_state.take() {
            self.state = saved;
        }
    }
}
