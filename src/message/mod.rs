//! Bus messages.
//!
//! A [`Message`] is uniquely owned while it is being built. Sending it seals
//! it into a [`MessageRead`]: an immutable, reference-counted message with its
//! own read cursor. Cloning a `MessageRead` shares the message and copies the
//! cursor.

mod value;

pub use value::{BasicType, Value, array_of};

use crate::errors::BusError;
use crate::types::Destination;
use core::fmt;
use std::sync::Arc;

/// Typed read failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The body had no more values.
    #[error("expected '{expected}' but reached the end of the message")]
    UnexpectedEnd {
        /// Requested signature.
        expected: String,
    },
    /// The next value had a different type.
    #[error("expected '{expected}' but found '{found}'")]
    TypeMismatch {
        /// Requested signature.
        expected: String,
        /// Signature of the value found.
        found: String,
    },
}

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A method invocation.
    MethodCall = 1,
    /// A successful reply.
    MethodReturn = 2,
    /// An error reply.
    MethodError = 3,
    /// A broadcast signal.
    Signal = 4,
}

#[derive(Debug, Clone)]
struct Header {
    kind: MessageType,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u64>,
    expect_reply: bool,
    auto_start: bool,
    allow_interactive_authorization: bool,
}

impl Header {
    const fn new(kind: MessageType) -> Self {
        Self {
            kind,
            path: None,
            interface: None,
            member: None,
            destination: None,
            error_name: None,
            reply_serial: None,
            expect_reply: matches!(kind, MessageType::MethodCall),
            auto_start: true,
            allow_interactive_authorization: false,
        }
    }
}

fn signature_of(body: &[Value]) -> String {
    body.iter().map(Value::signature).collect()
}

/// A message under construction.
#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    body: Vec<Value>,
}

impl Message {
    /// A method call addressed to `destination`.
    #[must_use]
    pub fn method_call(destination: &Destination) -> Self {
        let mut header = Header::new(MessageType::MethodCall);
        header.destination = Some(destination.service_name().to_owned());
        header.path = Some(destination.object_path().to_owned());
        header.interface = Some(destination.interface_name().to_owned());
        header.member = Some(destination.member_name().to_owned());
        Self {
            header,
            body: Vec::new(),
        }
    }

    /// A signal emitted from `path`.
    #[must_use]
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut header = Header::new(MessageType::Signal);
        header.path = Some(path.to_owned());
        header.interface = Some(interface.to_owned());
        header.member = Some(member.to_owned());
        Self {
            header,
            body: Vec::new(),
        }
    }

    /// A successful reply to `call`.
    #[must_use]
    pub fn method_return(call: &MessageRead) -> Self {
        let mut header = Header::new(MessageType::MethodReturn);
        header.destination = call.sender().map(str::to_owned);
        header.reply_serial = Some(call.cookie());
        Self {
            header,
            body: Vec::new(),
        }
    }

    /// An error reply to `call`. The error message becomes the first body value.
    #[must_use]
    pub fn method_error(call: &MessageRead, error: &BusError) -> Self {
        let mut header = Header::new(MessageType::MethodError);
        header.destination = call.sender().map(str::to_owned);
        header.reply_serial = Some(call.cookie());
        header.error_name = Some(error.name().to_owned());
        let body = error
            .message()
            .map(|m| vec![Value::from(m)])
            .unwrap_or_default();
        Self { header, body }
    }

    /// Appends one value.
    pub fn append(&mut self, value: impl Into<Value>) -> &mut Self {
        self.body.push(value.into());
        self
    }

    /// Appends a typed array built from a contiguous slice.
    pub fn append_array<T: BasicType + Clone>(&mut self, items: &[T]) -> &mut Self {
        self.body.push(array_of(items));
        self
    }

    /// Sets or clears the destination.
    pub fn set_destination(&mut self, destination: Option<&str>) {
        self.header.destination = destination.map(str::to_owned);
    }

    /// Whether the sender wants a reply. Only meaningful for method calls.
    pub fn set_expect_reply(&mut self, expect_reply: bool) {
        self.header.expect_reply = expect_reply;
    }

    /// Whether the bus may start the destination service.
    pub fn set_auto_start(&mut self, auto_start: bool) {
        self.header.auto_start = auto_start;
    }

    /// Whether the receiver may prompt for interactive authorization.
    pub fn set_allow_interactive_authorization(&mut self, allow: bool) {
        self.header.allow_interactive_authorization = allow;
    }

    /// Kind of message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.header.kind
    }

    /// Destination bus name.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.header.destination.as_deref()
    }

    /// Body signature so far.
    #[must_use]
    pub fn signature(&self) -> String {
        signature_of(&self.body)
    }

    /// Seals the message with its serial, sender and originating bus.
    #[must_use]
    pub fn seal(self, serial: u64, sender: Option<&str>, bus_id: u64) -> MessageRead {
        MessageRead {
            inner: Arc::new(Sealed {
                header: self.header,
                body: self.body,
                serial,
                sender: sender.map(str::to_owned),
                bus_id,
            }),
            cursor: 0,
        }
    }
}

#[derive(Debug)]
struct Sealed {
    header: Header,
    body: Vec<Value>,
    serial: u64,
    sender: Option<String>,
    bus_id: u64,
}

/// A sealed, shared message with a read cursor.
#[derive(Clone)]
pub struct MessageRead {
    inner: Arc<Sealed>,
    cursor: usize,
}

impl MessageRead {
    /// Reads the next value as `T`.
    pub fn read<T: BasicType>(&mut self) -> Result<T, CodecError> {
        let expected = T::TAG.to_string();
        let value = self.next_value(&expected)?;
        T::from_value(value).ok_or_else(|| CodecError::TypeMismatch {
            expected,
            found: value.signature(),
        })
    }

    /// Reads the next value as an array of `T`.
    pub fn read_array<T: BasicType>(&mut self) -> Result<Vec<T>, CodecError> {
        let expected = format!("a{}", T::TAG);
        let value = self.next_value(&expected)?;
        let mismatch = || CodecError::TypeMismatch {
            expected: expected.clone(),
            found: value.signature(),
        };
        match value {
            Value::Array { element, items } if *element == T::TAG => items
                .iter()
                .map(|item| T::from_value(item).ok_or_else(mismatch))
                .collect(),
            _ => Err(mismatch()),
        }
    }

    fn next_value(&mut self, expected: &str) -> Result<&Value, CodecError> {
        let Some(value) = self.inner.body.get(self.cursor) else {
            return Err(CodecError::UnexpectedEnd {
                expected: expected.to_owned(),
            });
        };
        self.cursor += 1;
        Ok(value)
    }

    /// Signature of the next value, without consuming it.
    #[must_use]
    pub fn peek_type(&self) -> Option<String> {
        self.inner.body.get(self.cursor).map(Value::signature)
    }

    /// Returns true if every value has been read.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.cursor >= self.inner.body.len()
    }

    /// Moves the cursor back to the first value.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// All body values.
    #[must_use]
    pub fn body(&self) -> &[Value] {
        &self.inner.body
    }

    /// Kind of message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.inner.header.kind
    }

    /// Returns true for a signal, optionally checking interface and member.
    #[must_use]
    pub fn is_signal(&self, interface: Option<&str>, member: Option<&str>) -> bool {
        self.message_type() == MessageType::Signal && self.matches(interface, member)
    }

    /// Returns true for a method call, optionally checking interface and member.
    #[must_use]
    pub fn is_method_call(&self, interface: Option<&str>, member: Option<&str>) -> bool {
        self.message_type() == MessageType::MethodCall && self.matches(interface, member)
    }

    /// Returns true for an error reply, optionally checking the error name.
    #[must_use]
    pub fn is_method_error(&self, name: Option<&str>) -> bool {
        self.message_type() == MessageType::MethodError
            && name.is_none_or(|n| self.inner.header.error_name.as_deref() == Some(n))
    }

    fn matches(&self, interface: Option<&str>, member: Option<&str>) -> bool {
        interface.is_none_or(|i| self.interface() == Some(i))
            && member.is_none_or(|m| self.member() == Some(m))
    }

    /// The structured error carried by an error reply.
    #[must_use]
    pub fn error(&self) -> Option<BusError> {
        if self.message_type() != MessageType::MethodError {
            return None;
        }
        let name = self.inner.header.error_name.clone()?;
        match self.inner.body.first() {
            Some(Value::String(message)) => Some(BusError::new(name, message.clone())),
            _ => Some(BusError::named(name)),
        }
    }

    /// Serial number assigned when the message was sent.
    #[must_use]
    pub fn cookie(&self) -> u64 {
        self.inner.serial
    }

    /// Serial of the call this message answers.
    #[must_use]
    pub fn reply_cookie(&self) -> Option<u64> {
        self.inner.header.reply_serial
    }

    /// Unique name of the sender.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.inner.sender.as_deref()
    }

    /// Destination bus name.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.inner.header.destination.as_deref()
    }

    /// Object path.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.inner.header.path.as_deref()
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.inner.header.interface.as_deref()
    }

    /// Member name.
    #[must_use]
    pub fn member(&self) -> Option<&str> {
        self.inner.header.member.as_deref()
    }

    /// Whether the sender expects a reply.
    #[must_use]
    pub fn expect_reply(&self) -> bool {
        self.message_type() == MessageType::MethodCall && self.inner.header.expect_reply
    }

    /// Whether the bus may auto-start the destination.
    #[must_use]
    pub fn auto_start(&self) -> bool {
        self.inner.header.auto_start
    }

    /// Whether interactive authorization is allowed.
    #[must_use]
    pub fn allow_interactive_authorization(&self) -> bool {
        self.inner.header.allow_interactive_authorization
    }

    /// Returns true if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.body.is_empty()
    }

    /// Body signature.
    #[must_use]
    pub fn signature(&self) -> String {
        signature_of(&self.inner.body)
    }

    /// Returns true if the body signature equals `signature`.
    #[must_use]
    pub fn has_signature(&self, signature: &str) -> bool {
        self.signature() == signature
    }

    /// Identifier of the bus connection the message was sealed on.
    #[must_use]
    pub fn bus_id(&self) -> u64 {
        self.inner.bus_id
    }
}

impl fmt::Debug for MessageRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRead")
            .field("type", &self.message_type())
            .field("cookie", &self.cookie())
            .field("sender", &self.sender())
            .field("path", &self.path())
            .field("member", &self.member())
            .field("signature", &self.signature())
            .finish_non_exhaustive()
    }
}
