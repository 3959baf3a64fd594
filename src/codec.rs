//! Message codec: wire shape of requests and responses.
//!
//! Every message crosses the isolation boundary as an owned JSON byte frame.
//! Nothing is shared by reference: the receiving side always decodes its own
//! copy.

use std::fmt;

use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CodecError, ErrorRecord};
use crate::worker::task::{Task, TaskId};

/// A positional argument in wire form.
pub type Argument = Value;

/// Deepest array/object nesting accepted in a parameter or result.
///
/// Kept well under the decoder's recursion limit so that anything encoded
/// here is guaranteed to decode on the other side.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Request sent from the manager to an execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub task_id: TaskId,
    pub module_reference: String,
    pub tasker_name: String,
    pub parameters: Vec<Argument>,
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResponseMessage {
    Success { message: Value },
    Failure { error: ErrorRecord },
}

impl ResponseMessage {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A response tagged with the task it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub task_id: TaskId,
    pub outcome: ResponseMessage,
}

/// Convert a Rust value into an argument.
pub fn to_argument<T: Serialize + ?Sized>(value: &T) -> Result<Argument, CodecError> {
    value
        .serialize(&mut FiniteFloats)
        .map_err(|e| CodecError::Serialization(e.0))?;
    let arg = serde_json::to_value(value)?;
    check_depth(&arg)?;
    Ok(arg)
}

/// Package a task into a request frame.
pub fn encode(task_id: TaskId, task: &Task, limit: usize) -> Result<Vec<u8>, CodecError> {
    for param in &task.parameters {
        check_depth(param)?;
    }

    let request = RequestMessage {
        task_id,
        module_reference: task.module_reference.clone(),
        tasker_name: task.tasker_name.clone(),
        parameters: task.parameters.clone(),
    };
    let frame = serde_json::to_vec(&request)?;
    check_size(&frame, limit)?;
    Ok(frame)
}

/// Unpack a request frame (context side).
pub fn decode_request(frame: &[u8]) -> Result<RequestMessage, CodecError> {
    serde_json::from_slice(frame).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Pack a response envelope (context side).
pub fn encode_response(envelope: &ResponseEnvelope, limit: usize) -> Result<Vec<u8>, CodecError> {
    if let ResponseMessage::Success { message } = &envelope.outcome {
        check_depth(message)?;
    }
    let frame = serde_json::to_vec(envelope)?;
    check_size(&frame, limit)?;
    Ok(frame)
}

/// Pack a response, replacing an unencodable result with a serialization failure.
pub fn reply_frame(task_id: TaskId, outcome: ResponseMessage, limit: usize) -> Vec<u8> {
    let envelope = ResponseEnvelope { task_id, outcome };
    match encode_response(&envelope, limit) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(task_id = %task_id, error = %err, "Result could not be encoded");
            let fallback = ResponseEnvelope {
                task_id,
                outcome: ResponseMessage::Failure {
                    error: ErrorRecord::serialization(format!("Result cannot be returned: {err}")),
                },
            };
            // An empty frame is reported as malformed by the manager.
            serde_json::to_vec(&fallback).unwrap_or_default()
        }
    }
}

/// Unpack a response frame (manager side).
pub fn decode(frame: &[u8]) -> Result<ResponseEnvelope, CodecError> {
    serde_json::from_slice(frame).map_err(|e| CodecError::Malformed(e.to_string()))
}

fn check_size(frame: &[u8], limit: usize) -> Result<(), CodecError> {
    if frame.len() > limit {
        return Err(CodecError::MessageTooLarge {
            size: frame.len(),
            limit,
        });
    }
    Ok(())
}

fn check_depth(value: &Value) -> Result<(), CodecError> {
    let depth = nesting_depth(value);
    if depth > MAX_NESTING_DEPTH {
        return Err(CodecError::TooDeep {
            depth,
            limit: MAX_NESTING_DEPTH,
        });
    }
    Ok(())
}

/// Nesting depth of arrays and objects. Iterative so that hostile input
/// cannot overflow the stack.
fn nesting_depth(value: &Value) -> usize {
    let mut max = 0;
    let mut stack = vec![(value, 0usize)];
    while let Some((v, depth)) = stack.pop() {
        match v {
            Value::Array(items) => {
                let depth = depth + 1;
                max = max.max(depth);
                stack.extend(items.iter().map(|item| (item, depth)));
            }
            Value::Object(map) => {
                let depth = depth + 1;
                max = max.max(depth);
                stack.extend(map.values().map(|item| (item, depth)));
            }
            _ => {}
        }
    }
    max
}

/// Serializer that produces nothing and fails on NaN or infinite floats,
/// which `serde_json` would otherwise turn into `null`.
struct FiniteFloats;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct NotRepresentable(String);

impl ser::Error for NotRepresentable {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

fn finite(v: f64) -> Result<(), NotRepresentable> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(NotRepresentable(format!("{v} has no JSON representation")))
    }
}

impl<'a> Serializer for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _v: bool) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_i8(self, _v: i8) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_i16(self, _v: i16) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_i32(self, _v: i32) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_i64(self, _v: i64) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_i128(self, _v: i128) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_u8(self, _v: u8) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_u16(self, _v: u16) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_u32(self, _v: u32) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_u64(self, _v: u64) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_u128(self, _v: u128) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_f32(self, v: f32) -> Result<(), NotRepresentable> {
        finite(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<(), NotRepresentable> {
        finite(v)
    }

    fn serialize_char(self, _v: char) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_str(self, _v: &str) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), NotRepresentable> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), NotRepresentable> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), NotRepresentable> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), NotRepresentable> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, NotRepresentable> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, NotRepresentable> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, NotRepresentable> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, NotRepresentable> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, NotRepresentable> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, NotRepresentable> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, NotRepresentable> {
        Ok(self)
    }
}

impl<'a> ser::SerializeSeq for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<'a> ser::SerializeTuple for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleStruct for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<'a> ser::SerializeTupleVariant for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<'a> ser::SerializeMap for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), Self::Error> {
        key.serialize(&mut **self)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), Self::Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<'a> ser::SerializeStruct for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<'a> ser::SerializeStructVariant for &'a mut FiniteFloats {
    type Ok = ();
    type Error = NotRepresentable;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<(), Self::Error> {
        Ok(())
    }
}
