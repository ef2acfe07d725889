//! Property tests for the interceptor protocol around queued tasks.
//!
//! For every drained task the start callback fires exactly once before the
//! command runs and the end callback exactly once after it, whatever the
//! command does.

mod common;

use std::sync::Arc;

use common::{init_test_logging, test_proptest_config};
use parking_lot::Mutex;
use proptest::prelude::*;
use session_access::{
    AccessError, CommandError, CommandInfo, CommandInterceptor, ErrorEvent, ExecutionContext,
    ServiceBuilder, SessionGuard,
};

// ============================================================================
// Generators
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Succeed,
    Fail,
    Panic,
}

fn arb_outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        3 => Just(Outcome::Succeed),
        2 => Just(Outcome::Fail),
        1 => Just(Outcome::Panic),
    ]
}

// ============================================================================
// Recording interceptor
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String),
    Run(String),
    Exception(String),
    End(String, usize),
}

struct Recorder {
    label: &'static str,
    events: Arc<Mutex<Vec<Event>>>,
}

impl CommandInterceptor for Recorder {
    fn command_execution_start(
        &self,
        ctx: ExecutionContext,
        command: &CommandInfo<'_>,
    ) -> ExecutionContext {
        let name = command.name.unwrap_or_default().to_string();
        self.events.lock().push(Event::Start(format!("{}:{name}", self.label)));
        ctx.with(self.label, name)
    }

    fn handle_exception(
        &self,
        ctx: &ExecutionContext,
        _command: &CommandInfo<'_>,
        _error: &CommandError,
    ) {
        let name = ctx.get(self.label).unwrap_or_default();
        self.events
            .lock()
            .push(Event::Exception(format!("{}:{name}", self.label)));
    }

    fn command_execution_end(&self, ctx: &ExecutionContext, command: &CommandInfo<'_>) {
        let name = command.name.unwrap_or_default();
        self.events
            .lock()
            .push(Event::End(format!("{}:{name}", self.label), ctx.len()));
    }
}

fn expected_events(outcomes: &[Outcome]) -> Vec<Event> {
    let mut expected = Vec::new();
    for (index, outcome) in outcomes.iter().enumerate() {
        let name = format!("task-{index}");
        expected.push(Event::Start(format!("outer:{name}")));
        expected.push(Event::Start(format!("inner:{name}")));
        expected.push(Event::Run(name.clone()));
        if !matches!(outcome, Outcome::Succeed) {
            expected.push(Event::Exception(format!("outer:{name}")));
            expected.push(Event::Exception(format!("inner:{name}")));
        }
        expected.push(Event::End(format!("outer:{name}"), 2));
        expected.push(Event::End(format!("inner:{name}"), 2));
    }
    expected
}

proptest! {
    #![proptest_config(test_proptest_config(128))]

    /// Start precedes the command and end follows it, once per task.
    #[test]
    fn start_and_end_bracket_every_task(outcomes in prop::collection::vec(arb_outcome(), 1..24)) {
        init_test_logging();
        let events = Arc::new(Mutex::new(Vec::new()));
        let delivered = Arc::new(Mutex::new(0_usize));
        let sink = Arc::clone(&delivered);
        let service = ServiceBuilder::new()
            .command_interceptor(Recorder { label: "outer", events: Arc::clone(&events) })
            .command_interceptor(Recorder { label: "inner", events: Arc::clone(&events) })
            .default_error_handler(move |_: &ErrorEvent| *sink.lock() += 1)
            .build::<()>()
            .expect("valid config");
        let session = service.get_or_create_session("prop");

        let guard = session.lock();
        let futures: Vec<_> = outcomes
            .iter()
            .enumerate()
            .map(|(index, outcome)| {
                let outcome = *outcome;
                let events = Arc::clone(&events);
                let name = format!("task-{index}");
                let command = session_access::Command::new(move |_: &SessionGuard<'_, ()>| {
                    events.lock().push(Event::Run(format!("task-{index}")));
                    match outcome {
                        Outcome::Succeed => Ok(()),
                        Outcome::Fail => Err(CommandError::msg("expected failure")),
                        Outcome::Panic => panic!("expected panic"),
                    }
                })
                .named(name);
                session.access_command(command)
            })
            .collect();
        session.run_pending_access_tasks().expect("holder drains");
        drop(guard);

        let recorded = events.lock().clone();
        prop_assert_eq!(recorded, expected_events(&outcomes));

        let failures = outcomes.iter().filter(|o| !matches!(o, Outcome::Succeed)).count();
        prop_assert_eq!(*delivered.lock(), failures);
        for (future, outcome) in futures.iter().zip(&outcomes) {
            let result = future.get();
            match outcome {
                Outcome::Succeed => prop_assert!(result.is_ok()),
                Outcome::Fail | Outcome::Panic => {
                    prop_assert!(matches!(result, Err(AccessError::ExecutionFailed(_))));
                }
            }
        }
    }

    /// Cancelled tasks never reach any interceptor.
    #[test]
    fn cancelled_tasks_never_reach_interceptors(
        cancel_mask in prop::collection::vec(any::<bool>(), 1..16)
    ) {
        init_test_logging();
        let events = Arc::new(Mutex::new(Vec::new()));
        let service = ServiceBuilder::new()
            .command_interceptor(Recorder { label: "only", events: Arc::clone(&events) })
            .build::<()>()
            .expect("valid config");
        let session = service.get_or_create_session("cancel");

        let guard = session.lock();
        for (index, cancel) in cancel_mask.iter().enumerate() {
            let future = session.access_command(
                session_access::Command::new(|_: &SessionGuard<'_, ()>| Ok(()))
                    .named(format!("task-{index}")),
            );
            if *cancel {
                prop_assert!(future.cancel());
            }
        }
        drop(guard);

        let starts = events
            .lock()
            .iter()
            .filter(|event| matches!(event, Event::Start(_)))
            .count();
        let kept = cancel_mask.iter().filter(|cancel| !**cancel).count();
        prop_assert_eq!(starts, kept);
    }
}
