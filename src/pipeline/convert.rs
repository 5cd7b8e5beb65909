//! Conversion between typed values and byte streams at the pipeline boundary
//!
//! Caller-supplied converters are tried first, in order. Values and shapes no
//! converter accepts fall back to [`BuiltinConverter`].

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Owned byte stream handed into or out of a pipeline
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Value supplied to and returned from a pipeline run
#[derive(Clone)]
pub enum Value {
    /// Raw bytes
    Bytes(Vec<u8>),
    /// UTF-8 text
    Text(String),
    /// Structured JSON
    Json(serde_json::Value),
    /// Any other type, handled only by caller-supplied converters
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wrap an arbitrary value for a custom converter
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow an opaque value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Opaque(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Shape the built-in conversions would assign, if any
    pub fn builtin_shape(&self) -> Option<Shape> {
        match self {
            Value::Bytes(_) => Some(Shape::Bytes),
            Value::Text(_) => Some(Shape::Text),
            Value::Json(_) => Some(Shape::Json),
            Value::Opaque(_) => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Value::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Value::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Value::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// Describes the kind of value a byte stream encodes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Bytes,
    Text,
    Json,
    /// Shape owned by a caller-supplied converter
    Custom(Cow<'static, str>),
}

impl Shape {
    pub fn custom(name: impl Into<Cow<'static, str>>) -> Self {
        Shape::Custom(name.into())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Bytes => f.write_str("bytes"),
            Shape::Text => f.write_str("text"),
            Shape::Json => f.write_str("json"),
            Shape::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Extension point bridging a typed value to and from a byte stream
///
/// # Example
/// ```
/// use async_trait::async_trait;
/// use stagepipe::pipeline::{ByteStream, Shape, Value, ValueConverter};
/// use stagepipe::PipelineResult;
/// use tokio::io::AsyncReadExt;
///
/// struct Numbers;
///
/// #[async_trait]
/// impl ValueConverter for Numbers {
///     fn to_stream(&self, value: &Value) -> Option<PipelineResult<(ByteStream, Shape)>> {
///         let n = value.downcast_ref::<u64>()?;
///         let stream: ByteStream = Box::new(std::io::Cursor::new(n.to_string().into_bytes()));
///         Some(Ok((stream, Shape::custom("u64"))))
///     }
///
///     fn accepts(&self, shape: &Shape) -> bool {
///         *shape == Shape::custom("u64")
///     }
///
///     async fn from_stream(&self, mut stream: ByteStream, _shape: &Shape) -> PipelineResult<Value> {
///         let mut text = String::new();
///         stream.read_to_string(&mut text).await?;
///         let n: u64 = text.trim().parse().map_err(|e| {
///             stagepipe::PipelineError::Conversion(format!("not a number: {}", e))
///         })?;
///         Ok(Value::opaque(n))
///     }
/// }
/// ```
#[async_trait]
pub trait ValueConverter: Send + Sync {
    /// Convert `value` into a byte stream and its shape
    ///
    /// Returns `None` if this converter does not handle the value.
    fn to_stream(&self, value: &Value) -> Option<PipelineResult<(ByteStream, Shape)>>;

    /// Whether this converter can rebuild a value of `shape`
    fn accepts(&self, shape: &Shape) -> bool;

    /// Read `stream` to completion and rebuild a value of `shape`
    async fn from_stream(&self, stream: ByteStream, shape: &Shape) -> PipelineResult<Value>;
}

/// Built-in conversions for bytes, UTF-8 text and JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinConverter;

impl BuiltinConverter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ValueConverter for BuiltinConverter {
    fn to_stream(&self, value: &Value) -> Option<PipelineResult<(ByteStream, Shape)>> {
        let (bytes, shape) = match value {
            Value::Bytes(b) => (b.clone(), Shape::Bytes),
            Value::Text(s) => (s.clone().into_bytes(), Shape::Text),
            Value::Json(v) => match serde_json::to_vec(v) {
                Ok(bytes) => (bytes, Shape::Json),
                Err(e) => {
                    return Some(Err(PipelineError::Conversion(format!(
                        "failed to encode JSON input: {}",
                        e
                    ))))
                }
            },
            Value::Opaque(_) => return None,
        };
        let stream: ByteStream = Box::new(Cursor::new(bytes));
        Some(Ok((stream, shape)))
    }

    fn accepts(&self, shape: &Shape) -> bool {
        matches!(shape, Shape::Bytes | Shape::Text | Shape::Json)
    }

    async fn from_stream(&self, mut stream: ByteStream, shape: &Shape) -> PipelineResult<Value> {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        match shape {
            Shape::Bytes => Ok(Value::Bytes(bytes)),
            Shape::Text => String::from_utf8(bytes).map(Value::Text).map_err(|e| {
                PipelineError::Conversion(format!("output is not valid UTF-8: {}", e))
            }),
            Shape::Json => serde_json::from_slice(&bytes).map(Value::Json).map_err(|e| {
                PipelineError::Conversion(format!("output is not valid JSON: {}", e))
            }),
            Shape::Custom(name) => Err(PipelineError::Conversion(format!(
                "no converter for shape '{}'",
                name
            ))),
        }
    }
}

/// Convert `value` using the first matching converter, then the built-ins
pub fn to_stream(
    value: &Value,
    converters: &[Arc<dyn ValueConverter>],
) -> PipelineResult<(ByteStream, Shape)> {
    converters
        .iter()
        .find_map(|c| c.to_stream(value))
        .or_else(|| BuiltinConverter.to_stream(value))
        .unwrap_or_else(|| {
            Err(PipelineError::Conversion(
                "no converter accepts the input value".to_string(),
            ))
        })
}

/// Rebuild a value of `shape` using the first accepting converter, then the
/// built-ins
pub async fn from_stream(
    stream: ByteStream,
    shape: &Shape,
    converters: &[Arc<dyn ValueConverter>],
) -> PipelineResult<Value> {
    match converters.iter().find(|c| c.accepts(shape)) {
        Some(converter) => converter.from_stream(stream, shape).await,
        None if BuiltinConverter.accepts(shape) => {
            BuiltinConverter.from_stream(stream, shape).await
        }
        None => Err(PipelineError::Conversion(format!(
            "no converter accepts output shape '{}'",
            shape
        ))),
    }
}
