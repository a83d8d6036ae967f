//! ACK payloads: an ordered list of variable actions.
//!
//! ```text
//! SET-VAR   : [1][nb-args=3][scope (1B)][name][typed value]
//! UNSET-VAR : [2][nb-args=2][scope (1B)][name]
//! ```
//!
//! The proxy applies actions in wire order.

use std::fmt;

use bytes::BufMut;

use crate::error::{FrameError, Result};
use crate::value::TypedData;
use crate::varint::{decode_string, encode_bytes, varint_len};

pub const ACTION_SET_VAR: u8 = 1;
pub const ACTION_UNSET_VAR: u8 = 2;

/// Variable scope targeted by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Scope {
    Process = 0,
    Session = 1,
    Transaction = 2,
    Request = 3,
    Response = 4,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "proc",
            Self::Session => "sess",
            Self::Transaction => "txn",
            Self::Request => "req",
            Self::Response => "res",
        }
    }
}

impl TryFrom<u8> for Scope {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Process),
            1 => Ok(Self::Session),
            2 => Ok(Self::Transaction),
            3 => Ok(Self::Request),
            4 => Ok(Self::Response),
            other => Err(FrameError::UnknownScope(other)),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single variable mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetVar {
        scope: Scope,
        name: String,
        value: TypedData,
    },
    UnsetVar {
        scope: Scope,
        name: String,
    },
}

impl Action {
    pub fn set_var(scope: Scope, name: impl Into<String>, value: impl Into<TypedData>) -> Self {
        Self::SetVar {
            scope,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn unset_var(scope: Scope, name: impl Into<String>) -> Self {
        Self::UnsetVar {
            scope,
            name: name.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::SetVar { name, value, .. } => {
                3 + varint_len(name.len() as u64) + name.len() + value.encoded_len()
            }
            Self::UnsetVar { name, .. } => 3 + varint_len(name.len() as u64) + name.len(),
        }
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::SetVar { scope, name, value } => {
                dst.put_u8(ACTION_SET_VAR);
                dst.put_u8(3);
                dst.put_u8(*scope as u8);
                encode_bytes(name.as_bytes(), dst);
                value.encode(dst);
            }
            Self::UnsetVar { scope, name } => {
                dst.put_u8(ACTION_UNSET_VAR);
                dst.put_u8(2);
                dst.put_u8(*scope as u8);
                encode_bytes(name.as_bytes(), dst);
            }
        }
    }

    /// Decode one action, returning `(action, consumed)`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let &[action, count, scope, ..] = buf else {
            return Err(FrameError::TruncatedPayload {
                needed: 3,
                remaining: buf.len(),
            });
        };
        let scope = Scope::try_from(scope)?;
        let (name, name_len) = decode_string(&buf[3..])?;
        let offset = 3 + name_len;

        match (action, count) {
            (ACTION_SET_VAR, 3) => {
                let (value, value_len) = TypedData::decode(&buf[offset..])?;
                Ok((Self::set_var(scope, name, value), offset + value_len))
            }
            (ACTION_UNSET_VAR, 2) => Ok((Self::unset_var(scope, name), offset)),
            (ACTION_SET_VAR | ACTION_UNSET_VAR, _) => {
                Err(FrameError::InvalidActionArgs { action, count })
            }
            _ => Err(FrameError::UnknownActionType(action)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetVar { scope, name, value } => {
                write!(f, "set-var {scope}.{name} = {value} ({})", value.type_name())
            }
            Self::UnsetVar { scope, name } => write!(f, "unset-var {scope}.{name}"),
        }
    }
}

/// Ordered action accumulator handed to request handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actions(Vec<Action>);

impl Actions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_var(&mut self, scope: Scope, name: impl Into<String>, value: impl Into<TypedData>) {
        self.0.push(Action::set_var(scope, name, value));
    }

    pub fn unset_var(&mut self, scope: Scope, name: impl Into<String>) {
        self.0.push(Action::unset_var(scope, name));
    }

    pub fn push(&mut self, action: Action) {
        self.0.push(action);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop all actions, keeping the allocation.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn as_slice(&self) -> &[Action] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Action> {
        self.0
    }

    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(Action::encoded_len).sum()
    }

    /// Encode the ACK payload.
    pub fn encode(&self, dst: &mut impl BufMut) {
        for action in &self.0 {
            action.encode(dst);
        }
    }

    /// Decode an ACK payload.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut actions = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (action, used) = Action::decode(&buf[offset..])?;
            actions.push(action);
            offset += used;
        }
        Ok(Self(actions))
    }
}

impl From<Vec<Action>> for Actions {
    fn from(actions: Vec<Action>) -> Self {
        Self(actions)
    }
}

impl<'a> IntoIterator for &'a Actions {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
