//! Call content and pipelining transforms.
//!
//! Message content is a small self-describing tree. Capabilities never appear
//! inline: a [`Value::Capability`] holds an index into the payload's
//! capability table, exactly as an interface pointer indexes the cap table of
//! a wire message.

use crate::capability::Client;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A content value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null pointer or absent field.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Data(Vec<u8>),
    /// List of values.
    List(Vec<Value>),
    /// Struct with pointer fields addressed by position.
    Struct(Vec<Value>),
    /// Index into the payload's capability table.
    Capability(u32),
}

static NULL: Value = Value::Null;

impl Value {
    /// Builds a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Returns the integer, if this is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text, if this is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the capability index, if this is a capability pointer.
    #[must_use]
    pub const fn as_capability(&self) -> Option<u32> {
        match self {
            Self::Capability(idx) => Some(*idx),
            _ => None,
        }
    }

    /// Returns pointer field `index` of a struct. Missing fields read as null.
    pub fn field(&self, index: u16) -> Result<&Self> {
        match self {
            Self::Struct(fields) => Ok(fields.get(usize::from(index)).unwrap_or(&NULL)),
            Self::Null => Ok(&NULL),
            other => Err(Error::failed(format!(
                "pointer field {index} read on non-struct {}",
                other.kind_name()
            ))),
        }
    }

    const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Data(_) => "data",
            Self::List(_) => "list",
            Self::Struct(_) => "struct",
            Self::Capability(_) => "capability",
        }
    }
}

/// One step of a promised-answer transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineOp {
    /// Identity step.
    Noop,
    /// Follow pointer field N of the current struct.
    GetPointerField(u16),
}

/// Applies `ops` to `value`, following pointer fields.
pub fn transform<'a>(value: &'a Value, ops: &[PipelineOp]) -> Result<&'a Value> {
    let mut cur = value;
    for op in ops {
        cur = match op {
            PipelineOp::Noop => cur,
            PipelineOp::GetPointerField(idx) => cur.field(*idx)?,
        };
    }
    Ok(cur)
}

/// Content plus the live capabilities it references.
///
/// Cloning a payload acquires a reference to every capability in its table.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    /// The content tree.
    pub content: Value,
    /// Capability table indexed by [`Value::Capability`].
    pub caps: Vec<Client>,
}

impl Payload {
    /// Builds a payload without capabilities.
    #[must_use]
    pub fn new(content: Value) -> Self {
        Self {
            content,
            caps: Vec::new(),
        }
    }

    /// Builds a payload from content and a capability table.
    #[must_use]
    pub fn with_caps(content: Value, caps: Vec<Client>) -> Self {
        Self { content, caps }
    }

    /// Builds a payload whose content is the single capability `client`.
    #[must_use]
    pub fn capability(client: Client) -> Self {
        Self {
            content: Value::Capability(0),
            caps: vec![client],
        }
    }

    /// Appends a capability and returns the pointer value that refers to it.
    pub fn push_cap(&mut self, client: Client) -> Value {
        self.caps.push(client);
        Value::Capability(self.caps.len() as u32 - 1)
    }

    /// Resolves the capability found at `ops`.
    ///
    /// Null yields the null client. A non-capability value or a failed
    /// transform yields an error client.
    #[must_use]
    pub fn client(&self, ops: &[PipelineOp]) -> Client {
        match transform(&self.content, ops) {
            Ok(Value::Capability(idx)) => self
                .caps
                .get(*idx as usize)
                .cloned()
                .unwrap_or_else(Client::null),
            Ok(Value::Null) => Client::null(),
            Ok(other) => Client::error(Error::failed(format!(
                "transform yielded {} instead of a capability",
                other.kind_name()
            ))),
            Err(err) => Client::error(err),
        }
    }

    /// Returns the capability-table index found at `ops`, if any.
    #[must_use]
    pub fn cap_index(&self, ops: &[PipelineOp]) -> Option<usize> {
        transform(&self.content, ops)
            .ok()
            .and_then(Value::as_capability)
            .map(|idx| idx as usize)
            .filter(|idx| *idx < self.caps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn nested() -> Value {
        Value::Struct(vec![
            Value::Int(1),
            Value::Struct(vec![Value::Null, Value::Capability(0)]),
        ])
    }

    #[test]
    fn transform_follows_pointer_fields() {
        init_test("transform_follows_pointer_fields");
        let v = nested();
        let ops = [PipelineOp::GetPointerField(1), PipelineOp::GetPointerField(1)];
        assert_eq!(transform(&v, &ops).unwrap(), &Value::Capability(0));
        assert_eq!(transform(&v, &[]).unwrap(), &v);
        assert_eq!(
            transform(&v, &[PipelineOp::Noop, PipelineOp::GetPointerField(0)]).unwrap(),
            &Value::Int(1)
        );
        crate::test_complete!("transform_follows_pointer_fields");
    }

    #[test]
    fn missing_fields_and_null_read_as_null() {
        init_test("missing_fields_and_null_read_as_null");
        let v = nested();
        assert_eq!(
            transform(&v, &[PipelineOp::GetPointerField(9)]).unwrap(),
            &Value::Null
        );
        let ops = [PipelineOp::GetPointerField(1), PipelineOp::GetPointerField(0)];
        assert_eq!(
            transform(&v, &[ops[0], ops[1], PipelineOp::GetPointerField(3)]).unwrap(),
            &Value::Null
        );
        crate::test_complete!("missing_fields_and_null_read_as_null");
    }

    #[test]
    fn field_on_scalar_is_an_error() {
        init_test("field_on_scalar_is_an_error");
        let v = nested();
        let err = transform(
            &v,
            &[PipelineOp::GetPointerField(0), PipelineOp::GetPointerField(0)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-struct int"), "{err}");
        crate::test_complete!("field_on_scalar_is_an_error");
    }

    #[test]
    fn payload_client_lookup() {
        init_test("payload_client_lookup");
        let p = Payload::with_caps(nested(), vec![Client::error(Error::failed("x"))]);
        let path = [PipelineOp::GetPointerField(1), PipelineOp::GetPointerField(1)];
        assert!(p.client(&path).is_error());
        assert_eq!(p.cap_index(&path), Some(0));
        assert!(p.client(&[PipelineOp::GetPointerField(5)]).is_null());
        assert!(p.client(&[PipelineOp::GetPointerField(0)]).is_error());
        assert_eq!(p.cap_index(&[PipelineOp::GetPointerField(0)]), None);
        crate::test_complete!("payload_client_lookup");
    }
}
