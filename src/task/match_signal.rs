//! One-shot signal subscription.

use crate::broker::Broker;
use crate::bus::{Bus, Disposition, MatchRule};
use crate::connection::slot::{Registration, ReplyCell};
use crate::error::{Error, Result};
use crate::message::MessageRead;
use crate::sync::{Condition, TaskCtl};
use crate::tracing_compat::trace;
use crate::types::{BrokerKey, Destination};
use std::sync::atomic::Ordering;

/// Waits for the next signal matching a destination.
///
/// The destination's service name filters the sender, and its path,
/// interface and member filter the signal. The subscription is dropped after
/// the first match.
#[derive(Debug)]
#[must_use = "a signal match does nothing until run"]
pub struct MatchSignal {
    broker: Broker,
    key: BrokerKey,
    destination: Destination,
}

impl MatchSignal {
    /// Subscribes over the connection for `key`.
    pub fn new(broker: &Broker, key: BrokerKey, destination: Destination) -> Self {
        Self {
            broker: broker.clone(),
            key,
            destination,
        }
    }

    /// Installs the subscription and waits for the first matching signal.
    pub async fn run(self) -> Result<MessageRead> {
        let ctl = TaskCtl::new("MatchSignal");
        let handle = self.broker.request(&self.key, &ctl).await?;
        let connection = handle.connection();

        let cell = ReplyCell::new(ctl.signal().clone(), Condition::HAVE_MATCH_CALLBACK);
        let mut registration = Registration::new(connection.clone());
        {
            let lock = connection.lock(ctl.signal()).await?;
            let armed = registration.armed();
            let target = cell.clone();
            let handler = Box::new(move |_: &mut dyn Bus, signal: &MessageRead| {
                if armed.load(Ordering::Acquire) {
                    target.complete(signal.clone());
                }
                Disposition::Release
            });
            let slot = lock
                .bus()
                .match_signal_async(MatchRule::from(&self.destination), handler)
                .map_err(|errno| Error::bus("match_signal_async", errno))?;
            registration.set_slot(slot);
            trace!(destination = %self.destination, task = %ctl.id(), "signal match installed");
        }

        ctl.wait(Condition::HAVE_MATCH_CALLBACK).await?;
        registration.consumed();
        cell.take().ok_or(Error::Aborted)
    }
}
