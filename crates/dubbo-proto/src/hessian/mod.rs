//! Hessian 2.0 value model, encoder and decoder.
//!
//! Values are dynamically typed. Java classes travel as [`Value::Object`]
//! with their fully qualified class name and field values in declaration
//! order, so a peer written in Java sees the same shape it would have sent.

pub mod constants;
mod decoder;
mod encoder;

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

pub use decoder::Decoder;
pub use encoder::Encoder;

static ARG_TYPES_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(constants::ARG_TYPES_PATTERN).ok());

/// Errors raised while encoding or decoding Hessian data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HessianError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected tag 0x{0:02x}")]
    UnexpectedTag(u8),

    #[error("invalid string data")]
    InvalidString,

    #[error("unknown class definition {0}")]
    UnknownClassDef(usize),

    #[error("unknown type reference {0}")]
    UnknownTypeRef(usize),

    #[error("unknown object reference {0}")]
    UnknownRef(usize),

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("back references expand past {0} values")]
    TooLarge(usize),

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: &'static str,
    },
}

/// A Hessian value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    List {
        class: Option<String>,
        items: Vec<Value>,
    },
    Map {
        class: Option<String>,
        entries: Vec<(Value, Value)>,
    },
    Object {
        class: String,
        fields: Vec<(String, Value)>,
    },
}

impl Value {
    /// Builds an untyped list.
    #[must_use]
    pub fn list(items: Vec<Value>) -> Self {
        Self::List { class: None, items }
    }

    /// Builds an untyped map from string pairs.
    #[must_use]
    pub fn string_map<'a>(pairs: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut entries: Vec<(Value, Value)> = pairs
            .into_iter()
            .map(|(k, v)| (Value::String(k.clone()), Value::String(v.clone())))
            .collect();
        // HashMap iteration order is random; keep the wire bytes stable.
        entries.sort_by(|a, b| match (&a.0, &b.0) {
            (Value::String(x), Value::String(y)) => x.cmp(y),
            _ => std::cmp::Ordering::Equal,
        });
        Self::Map {
            class: None,
            entries,
        }
    }

    /// Builds a typed object.
    #[must_use]
    pub fn object(class: impl Into<String>, fields: Vec<(String, Value)>) -> Self {
        Self::Object {
            class: class.into(),
            fields,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) | Self::Date(v) => Some(*v),
            _ => None,
        }
    }

    /// Looks up a field on an object, or a string key on a map.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Object { fields, .. } => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            Self::Map { entries, .. } => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(name))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Name of the variant, used in error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Date(_) => "date",
            Self::List { .. } => "list",
            Self::Map { .. } => "map",
            Self::Object { .. } => "object",
        }
    }

    /// JVM type descriptor for this value as an argument.
    #[must_use]
    pub fn type_descriptor(&self) -> String {
        match self {
            Self::Null => "V".to_owned(),
            Self::Bool(_) => "Z".to_owned(),
            Self::Int(_) => "I".to_owned(),
            Self::Long(_) => "J".to_owned(),
            Self::Double(_) => "D".to_owned(),
            Self::String(_) => "Ljava/lang/String;".to_owned(),
            Self::Binary(_) => "[B".to_owned(),
            Self::Date(_) => "Ljava/util/Date;".to_owned(),
            Self::List { .. } => "Ljava/util/List;".to_owned(),
            Self::Map { .. } => "Ljava/util/Map;".to_owned(),
            Self::Object { class, .. } => format!("L{};", class.replace('.', "/")),
        }
    }

    /// Converts a decoded map into string attachments.
    ///
    /// Only pairs whose key and value are both strings survive.
    pub fn into_string_map(self) -> Result<HashMap<String, String>, HessianError> {
        match self {
            Self::Map { entries, .. } => Ok(entries
                .into_iter()
                .filter_map(|(k, v)| match (k, v) {
                    (Self::String(k), Self::String(v)) => Some((k, v)),
                    _ => None,
                })
                .collect()),
            Self::Null => Ok(HashMap::new()),
            other => Err(HessianError::TypeMismatch {
                expected: "map".to_owned(),
                found: other.kind(),
            }),
        }
    }

    /// Reshapes a decoded value into the caller's expected return type.
    pub fn coerce(self, expected: &ReturnType) -> Result<Self, HessianError> {
        let mismatch = |found: &Value| HessianError::TypeMismatch {
            expected: expected.to_string(),
            found: found.kind(),
        };

        match (expected, self) {
            (ReturnType::Any, v) | (_, v @ Self::Null) => Ok(v),
            (ReturnType::Void, _) => Ok(Self::Null),
            (ReturnType::Bool, v @ Self::Bool(_))
            | (ReturnType::Long, v @ Self::Long(_))
            | (ReturnType::Int, v @ Self::Int(_))
            | (ReturnType::Double, v @ Self::Double(_))
            | (ReturnType::String, v @ Self::String(_))
            | (ReturnType::Binary, v @ Self::Binary(_))
            | (ReturnType::Date, v @ Self::Date(_))
            | (ReturnType::List, v @ Self::List { .. })
            | (ReturnType::Map, v @ Self::Map { .. }) => Ok(v),
            (ReturnType::Long, Self::Int(v)) => Ok(Self::Long(i64::from(v))),
            (ReturnType::Int, Self::Long(v)) => i32::try_from(v)
                .map(Self::Int)
                .map_err(|_| mismatch(&Self::Long(v))),
            (ReturnType::Double, Self::Int(v)) => Ok(Self::Double(f64::from(v))),
            (ReturnType::Date, Self::Long(v)) => Ok(Self::Date(v)),
            (ReturnType::Map, Self::Object { fields, .. }) => Ok(Self::Map {
                class: None,
                entries: fields
                    .into_iter()
                    .map(|(k, v)| (Self::String(k), v))
                    .collect(),
            }),
            (ReturnType::Object(class), v @ Self::Object { .. }) => {
                if let Self::Object { class: found, .. } = &v {
                    if found != class {
                        return Err(HessianError::TypeMismatch {
                            expected: class.clone(),
                            found: "object",
                        });
                    }
                }
                Ok(v)
            }
            (ReturnType::Object(class), Self::Map { entries, .. }) => {
                let mut fields = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    match k {
                        Self::String(k) => fields.push((k, v)),
                        other => return Err(mismatch(&other)),
                    }
                }
                Ok(Self::Object {
                    class: class.clone(),
                    fields,
                })
            }
            (_, v) => Err(mismatch(&v)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Expected shape of a response value.
///
/// Registered with a pending call so the reply can be reshaped once it
/// arrives, e.g. an `int` on the wire read back as a Java `long`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReturnType {
    #[default]
    Any,
    Void,
    Bool,
    Int,
    Long,
    Double,
    String,
    Binary,
    Date,
    List,
    Map,
    Object(String),
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Void => write!(f, "void"),
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Long => write!(f, "long"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
            Self::Binary => write!(f, "binary"),
            Self::Date => write!(f, "date"),
            Self::List => write!(f, "list"),
            Self::Map => write!(f, "map"),
            Self::Object(class) => write!(f, "{class}"),
        }
    }
}

/// Concatenated type descriptors for an argument list.
#[must_use]
pub fn args_type_descriptor(args: &[Value]) -> String {
    args.iter().map(Value::type_descriptor).collect()
}

/// Number of arguments described by a descriptor string.
#[must_use]
pub fn count_arg_types(descriptor: &str) -> usize {
    ARG_TYPES_REGEX
        .as_ref()
        .map_or(0, |re| re.find_iter(descriptor).count())
}
