//! E2E: a concatenator service and its clients over the loopback bus.
//!
//! Server and clients run as lab tasks on one executor; the bus sockets are
//! driven by the native reactor.

#[macro_use]
mod common;

use common::*;
use dbus_task::errors::{Errno, ErrorDomainRegistry};
use dbus_task::bus::{Bus, Disposition};
use dbus_task::errors::BusError;
use dbus_task::message::MessageRead;
use dbus_task::types::{BrokerKey, Destination, Interface, NameFlags};
use dbus_task::{Error, MatchSignal, MethodCall, ObjectExport, abortable};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

fn concatenate(
    fixture: &Fixture,
    numbers: &'static [i32],
    separator: &'static str,
) -> dbus_task::lab::JoinHandle<dbus_task::Result<String>> {
    let call = MethodCall::new(&fixture.broker, BrokerKey::user(), method("concatenate"))
        .with_params(move |message| {
            message.append_array(numbers);
            message.append(separator);
        });
    fixture.spawn("concatenate", async move {
        let mut reply = call.run().await?;
        Ok::<_, Error>(reply.read::<String>()?)
    })
}

#[test]
fn e2e_concatenate_returns_joined_numbers() {
    init_test("e2e_concatenate_returns_joined_numbers");
    let fixture = Fixture::new();
    let service = fixture.start_concatenator();

    test_section!("call");
    let reply = concatenate(&fixture, &[1, 2, 3], ":");
    assert_eq!(fixture.finish(&reply).expect("reply"), "1:2:3");
    assert_eq!(service.calls(), 1);

    test_section!("stop");
    service.stop.stop();
    fixture.finish(&service.task).expect("export stopped cleanly");
    fixture.broker.shutdown();
    test_complete!("e2e_concatenate_returns_joined_numbers");
}

#[test]
fn e2e_empty_list_maps_to_registered_domain() {
    init_test("e2e_empty_list_maps_to_registered_domain");
    let fixture = Fixture::new();
    let _service = fixture.start_concatenator();

    let reply = concatenate(&fixture, &[], ":");
    let err = fixture.finish(&reply).expect_err("no numbers");
    let remote = err.remote().expect("remote error").clone();
    assert_eq!(remote.name(), "org.sdbuscpp.Concatenator.Error.NoNumbers");
    assert_eq!(remote.message(), Some("No numbers provided"));

    let code = remote.code();
    assert_eq!(code.category(), "DBus:org.sdbuscpp.Concatenator.Error");
    assert_eq!(code.value(), 1);
    assert_eq!(
        ErrorDomainRegistry::global()
            .error_name("org.sdbuscpp.Concatenator.Error", code.value())
            .as_deref(),
        Some("org.sdbuscpp.Concatenator.Error.NoNumbers")
    );
    fixture.broker.shutdown();
    test_complete!("e2e_empty_list_maps_to_registered_domain");
}

#[test]
fn e2e_unknown_member_is_answered_by_the_bus() {
    init_test("e2e_unknown_member_is_answered_by_the_bus");
    let fixture = Fixture::new();
    let _service = fixture.start_concatenator();

    let call = MethodCall::new(&fixture.broker, BrokerKey::user(), method("reverse"));
    let reply = fixture.spawn("reverse", call.run());
    let err = fixture.finish(&reply).expect_err("unknown member");
    assert!(err.remote().expect("remote").is_standard("UnknownMethod"));
    fixture.broker.shutdown();
    test_complete!("e2e_unknown_member_is_answered_by_the_bus");
}

#[test]
fn e2e_signal_reaches_match_installed_first() {
    init_test("e2e_signal_reaches_match_installed_first");
    let fixture = Fixture::new();
    let _service = fixture.start_concatenator();

    test_section!("install match");
    let matched = fixture.spawn(
        "match",
        MatchSignal::new(&fixture.broker, BrokerKey::user(), signal("concatenated")).run(),
    );
    assert!(fixture.run_until(|| fixture.broker.cached(&BrokerKey::user()).is_some()));
    fixture.settle(3);
    assert!(!matched.is_finished());

    test_section!("trigger");
    let reply = concatenate(&fixture, &[4, 5], "-");
    assert_eq!(fixture.finish(&reply).expect("reply"), "4-5");
    let mut signal = fixture.finish(&matched).expect("signal");
    assert!(signal.is_signal(Some(INTERFACE), Some("concatenated")));
    assert_eq!(signal.read::<String>().expect("body"), "4-5");
    fixture.broker.shutdown();
    test_complete!("e2e_signal_reaches_match_installed_first");
}

#[test]
fn e2e_broker_shares_one_setup_per_key() {
    init_test("e2e_broker_shares_one_setup_per_key");
    let fixture = Fixture::new();
    const REQUESTS: usize = 5;

    test_section!("concurrent user requests");
    let handles: Vec<_> = (0..REQUESTS)
        .map(|_| {
            let broker = fixture.broker.clone();
            fixture.spawn("connect", async move {
                broker.connection(&BrokerKey::user()).await
            })
        })
        .collect();
    let connections: Vec<_> = handles
        .iter()
        .map(|h| fixture.finish(h).expect("connection"))
        .collect();
    assert_eq!(fixture.broker.setup_count(), 1);
    assert!(connections.iter().all(|c| c.id() == connections[0].id()));
    assert_eq!(fixture.factory.user_hub().peer_count(), 1);

    test_section!("system bus is a different key");
    let broker = fixture.broker.clone();
    let system = fixture.spawn("system", async move {
        broker.connection(&BrokerKey::system()).await
    });
    let system = fixture.finish(&system).expect("system connection");
    assert_eq!(fixture.broker.setup_count(), 2);
    assert_ne!(system.id(), connections[0].id());
    assert_eq!(fixture.factory.system_hub().peer_count(), 1);

    test_section!("cached");
    let broker = fixture.broker.clone();
    let again = fixture.spawn("again", async move {
        broker.connection(&BrokerKey::user()).await
    });
    assert_eq!(fixture.finish(&again).expect("cached").id(), connections[0].id());
    assert_eq!(fixture.broker.setup_count(), 2);

    fixture.broker.shutdown();
    assert!(connections[0].is_closed());
    test_complete!("e2e_broker_shares_one_setup_per_key", setups = 2);
}

#[test]
fn e2e_taken_name_fails_every_waiter() {
    init_test("e2e_taken_name_fails_every_waiter");
    let fixture = Fixture::new();
    let _service = fixture.start_concatenator();

    let rival = BrokerKey::user().with_service_name(SERVICE, NameFlags::ALLOW_REPLACEMENT);
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let broker = fixture.broker.clone();
            let key = rival.clone();
            fixture.spawn("rival", async move { broker.connection(&key).await })
        })
        .collect();
    for handle in &handles {
        let err = fixture.finish(handle).expect_err("name is taken");
        assert!(matches!(err, Error::Setup(_)));
        let code = err.remote().expect("remote").code();
        assert_eq!(code.value(), Errno::EEXIST.code());
    }
    assert_eq!(fixture.broker.setup_count(), 2);
    assert!(fixture.broker.cached(&rival).is_none());
    // The failed setup's connection is gone again.
    assert!(fixture.run_until(|| fixture.factory.user_hub().peer_count() == 1));
    fixture.broker.shutdown();
    test_complete!("e2e_taken_name_fails_every_waiter");
}

#[test]
fn e2e_queued_name_request_succeeds() {
    init_test("e2e_queued_name_request_succeeds");
    let fixture = Fixture::new();
    let _service = fixture.start_concatenator();

    let queued = BrokerKey::user().with_service_name(SERVICE, NameFlags::QUEUE);
    let broker = fixture.broker.clone();
    let key = queued.clone();
    let handle = fixture.spawn("queued", async move { broker.connection(&key).await });
    let connection = fixture.finish(&handle).expect("queued owner");
    assert_eq!(connection.service_name(), Some(SERVICE));
    let owner = fixture.broker.cached(&server_key()).expect("server");
    assert_eq!(
        fixture.factory.user_hub().owner_of(SERVICE).as_deref(),
        Some(owner.unique_name())
    );
    assert_ne!(owner.id(), connection.id());
    fixture.broker.shutdown();
    test_complete!("e2e_queued_name_request_succeeds");
}

#[test]
fn e2e_concurrent_calls_with_lock_yield() {
    init_test("e2e_concurrent_calls_with_lock_yield");
    let fixture = Fixture::new();
    let service = fixture.start_concatenator();
    const CALLS: i32 = 8;

    let handles: Vec<_> = (0..CALLS)
        .map(|i| {
            let call = MethodCall::new(&fixture.broker, BrokerKey::user(), method("concatenate"))
                .with_params(move |message| {
                    message.append_array(&[i, i + 1]);
                    message.append(",");
                })
                .yield_lock_on_reply(i % 2 == 0);
            fixture.spawn("concurrent", async move {
                let mut reply = call.run().await?;
                Ok::<_, Error>(reply.read::<String>()?)
            })
        })
        .collect();
    for (i, handle) in (0..CALLS).zip(&handles) {
        assert_eq!(fixture.finish(handle).expect("reply"), format!("{i},{}", i + 1));
    }
    assert_eq!(service.calls(), CALLS as usize);
    let client = fixture.broker.cached(&BrokerKey::user()).expect("client");
    assert_eq!(client.connection().mutex().waiter_count(), 0);
    assert_eq!(client.connection().deferred_count(), 0);
    fixture.broker.shutdown();
    test_complete!("e2e_concurrent_calls_with_lock_yield", calls = CALLS);
}

#[test]
fn e2e_abort_pending_call_keeps_connection_usable() {
    init_test("e2e_abort_pending_call_keeps_connection_usable");
    let fixture = Fixture::new();
    let service = fixture.start_concatenator();

    test_section!("pending call");
    let (held, abort) = abortable(
        MethodCall::new(&fixture.broker, BrokerKey::user(), method("hold")).run(),
    );
    let held = fixture.spawn("hold", held);
    assert!(fixture.run_until(|| service.calls() == 1));
    assert!(!held.is_finished());

    test_section!("abort");
    abort.abort();
    assert!(matches!(fixture.finish(&held), Err(Error::Aborted)));
    assert!(abort.is_aborted());

    test_section!("connection still serves calls");
    let reply = concatenate(&fixture, &[7], ":");
    assert_eq!(fixture.finish(&reply).expect("reply"), "7");
    let client = fixture.broker.cached(&BrokerKey::user()).expect("client");
    assert!(!client.is_closed());
    assert_eq!(client.connection().deferred_count(), 0);
    fixture.broker.shutdown();
    test_complete!("e2e_abort_pending_call_keeps_connection_usable");
}

#[test]
fn e2e_stopped_export_no_longer_answers() {
    init_test("e2e_stopped_export_no_longer_answers");
    let fixture = Fixture::new();
    let service = fixture.start_concatenator();

    service.stop.stop();
    fixture.finish(&service.task).expect("stopped");

    let reply = concatenate(&fixture, &[1], ":");
    let err = fixture.finish(&reply).expect_err("object is gone");
    assert!(err.remote().expect("remote").is_standard("UnknownObject"));
    fixture.broker.shutdown();
    test_complete!("e2e_stopped_export_no_longer_answers");
}

#[test]
fn e2e_fully_handled_export_answers_once() {
    init_test("e2e_fully_handled_export_answers_once");
    let fixture = Fixture::new();
    const PATH: &str = "/org/sdbuscpp/once";
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let handler = move |bus: &mut dyn Bus, call: &MessageRead| -> Result<Disposition, BusError> {
        seen.fetch_add(1, Ordering::SeqCst);
        bus.reply_method_return(call, |reply| {
            reply.append("done");
        })
        .map_err(BusError::from)?;
        Ok(Disposition::Release)
    };
    let export = ObjectExport::new(
        &fixture.broker,
        server_key(),
        Interface::new(SERVICE, PATH, INTERFACE),
        handler,
    );
    let task = fixture.spawn("once", export.run());
    assert!(fixture.run_until(|| fixture.broker.cached(&server_key()).is_some()));
    fixture.executor.run_until_quiescent();

    test_section!("first call is answered and ends the export");
    let destination = Destination::new(SERVICE, PATH, INTERFACE, "ping");
    let call = MethodCall::new(&fixture.broker, BrokerKey::user(), destination.clone());
    let reply = fixture.spawn("first", async move {
        let mut reply = call.run().await?;
        Ok::<_, Error>(reply.read::<String>()?)
    });
    assert_eq!(fixture.finish(&reply).expect("reply"), "done");
    fixture.finish(&task).expect("export finished");

    test_section!("second call never reaches the handler");
    let call = MethodCall::new(&fixture.broker, BrokerKey::user(), destination);
    let again = fixture.spawn("second", call.run());
    let err = fixture.finish(&again).expect_err("object is gone");
    assert!(err.remote().expect("remote").is_standard("UnknownObject"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    fixture.broker.shutdown();
    test_complete!("e2e_fully_handled_export_answers_once");
}
