//! Asynchronous method call.

use crate::broker::Broker;
use crate::connection::slot::{Registration, ReplyCell};
use crate::error::{Error, Result};
use crate::message::{Message, MessageRead};
use crate::sync::{Condition, TaskCtl};
use crate::tracing_compat::trace;
use crate::types::{BrokerKey, Destination};
use std::sync::Arc;

type Params = Box<dyn FnOnce(&mut Message) + Send>;

/// Calls one method on a brokered connection and waits for the reply.
///
/// An error reply surfaces as [`Error::Remote`]. Dropping the future before
/// the reply arrives releases the pending call; a late reply is discarded.
#[must_use = "a method call does nothing until run"]
pub struct MethodCall {
    broker: Broker,
    key: BrokerKey,
    destination: Destination,
    params: Option<Params>,
    yield_lock_on_reply: bool,
}

impl std::fmt::Debug for MethodCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodCall")
            .field("key", &self.key)
            .field("destination", &self.destination)
            .field("yield_lock_on_reply", &self.yield_lock_on_reply)
            .finish_non_exhaustive()
    }
}

impl MethodCall {
    /// A call to `destination` over the connection for `key`.
    pub fn new(broker: &Broker, key: BrokerKey, destination: Destination) -> Self {
        Self {
            broker: broker.clone(),
            key,
            destination,
            params: None,
            yield_lock_on_reply: false,
        }
    }

    /// Fills the call's arguments just before sending.
    pub fn with_params(mut self, params: impl FnOnce(&mut Message) + Send + 'static) -> Self {
        self.params = Some(Box::new(params));
        self
    }

    /// Releases the connection lock from the reply callback, so this task
    /// resumes before the pump drains further messages.
    pub fn yield_lock_on_reply(mut self, yield_lock: bool) -> Self {
        self.yield_lock_on_reply = yield_lock;
        self
    }

    /// Sends the call and waits for the reply.
    pub async fn run(self) -> Result<MessageRead> {
        let Self {
            broker,
            key,
            destination,
            params,
            yield_lock_on_reply,
        } = self;
        let ctl = TaskCtl::new("MethodCall");
        let handle = broker.request(&key, &ctl).await?;
        let connection = handle.connection();

        let cell = ReplyCell::new(ctl.signal().clone(), Condition::HAVE_REPLY);
        let mut registration = Registration::new(connection.clone());
        {
            let lock = connection.lock(ctl.signal()).await?;
            let mut message = Message::method_call(&destination);
            if let Some(params) = params {
                params(&mut message);
            }
            let yield_to = yield_lock_on_reply.then(|| Arc::downgrade(connection));
            let handler = cell.reply_handler(registration.armed(), yield_to);
            let slot = lock
                .bus()
                .call_async(message, handler)
                .map_err(|errno| Error::bus("call_async", errno))?;
            registration.set_slot(slot);
            trace!(%destination, task = %ctl.id(), "method call sent");
        }

        ctl.wait(Condition::HAVE_REPLY).await?;
        registration.consumed();
        let reply = cell.take().ok_or(Error::Aborted)?;
        match reply.error() {
            Some(error) => Err(Error::Remote(error)),
            None => Ok(reply),
        }
    }
}
