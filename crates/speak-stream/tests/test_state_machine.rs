//! Transition table tests for the playback state machine

use rstest::rstest;
use speak_stream::{BufferThresholds, StreamEvent, StreamState, StreamStateMachine};

fn thresholds() -> BufferThresholds {
    BufferThresholds::new(3.0, 0.5, 1.5)
}

/// Drive a fresh machine into `state` through legal transitions
fn machine_in(state: StreamState) -> StreamStateMachine {
    let mut sm = StreamStateMachine::new(thresholds());
    let chunk = StreamEvent::ChunkReceived {
        samples: 1,
        chunk_id: 0,
    };

    match state {
        StreamState::Idle => {}
        StreamState::Buffering => {
            sm.dispatch(StreamEvent::Start, 0.0);
        }
        StreamState::Playing => {
            sm.dispatch(StreamEvent::Start, 0.0);
            sm.dispatch(chunk, 3.0);
        }
        StreamState::Rebuffering => {
            sm.dispatch(StreamEvent::Start, 0.0);
            sm.dispatch(chunk, 3.0);
            sm.dispatch(StreamEvent::BufferLow { buffered_seconds: 0.1 }, 0.1);
        }
        StreamState::Draining => {
            sm.dispatch(StreamEvent::Start, 0.0);
            sm.dispatch(StreamEvent::GenerationComplete { total_chunks: 0 }, 0.0);
        }
        StreamState::Finished => {
            sm.dispatch(StreamEvent::Cancel { reason: "setup".into() }, 0.0);
        }
        StreamState::Error => {
            sm.dispatch(StreamEvent::Start, 0.0);
            sm.dispatch(StreamEvent::GenerationError { error: "setup".into() }, 0.0);
        }
    }

    assert_eq!(sm.state(), state, "setup failed");
    sm
}

fn chunk() -> StreamEvent {
    StreamEvent::ChunkReceived {
        samples: 2400,
        chunk_id: 1,
    }
}

#[rstest]
#[case::start(StreamState::Idle, StreamEvent::Start, 0.0, StreamState::Buffering)]
#[case::below_initial(StreamState::Buffering, chunk(), 2.0, StreamState::Buffering)]
#[case::at_initial(StreamState::Buffering, chunk(), 3.0, StreamState::Playing)]
#[case::above_initial(StreamState::Buffering, chunk(), 4.2, StreamState::Playing)]
#[case::short_clip(StreamState::Buffering, StreamEvent::GenerationComplete { total_chunks: 1 }, 0.8, StreamState::Draining)]
#[case::error_with_audio(StreamState::Buffering, StreamEvent::GenerationError { error: "x".into() }, 0.4, StreamState::Draining)]
#[case::error_without_audio(StreamState::Buffering, StreamEvent::GenerationError { error: "x".into() }, 0.0, StreamState::Error)]
#[case::low_buffer(StreamState::Playing, StreamEvent::BufferLow { buffered_seconds: 0.3 }, 0.3, StreamState::Rebuffering)]
#[case::low_but_above_min(StreamState::Playing, StreamEvent::BufferLow { buffered_seconds: 0.5 }, 0.5, StreamState::Playing)]
#[case::playing_complete(StreamState::Playing, StreamEvent::GenerationComplete { total_chunks: 9 }, 2.0, StreamState::Draining)]
#[case::playing_error(StreamState::Playing, StreamEvent::GenerationError { error: "x".into() }, 2.0, StreamState::Draining)]
#[case::resume(StreamState::Rebuffering, StreamEvent::BufferOk { buffered_seconds: 1.5 }, 1.5, StreamState::Playing)]
#[case::not_yet_resumed(StreamState::Rebuffering, StreamEvent::BufferOk { buffered_seconds: 1.2 }, 1.2, StreamState::Rebuffering)]
#[case::rebuffering_complete(StreamState::Rebuffering, StreamEvent::GenerationComplete { total_chunks: 9 }, 0.2, StreamState::Draining)]
#[case::drained(StreamState::Draining, StreamEvent::BufferEmpty, 0.0, StreamState::Finished)]
#[case::draining_ignores_chunks(StreamState::Draining, chunk(), 5.0, StreamState::Draining)]
#[case::cancel_while_rebuffering(StreamState::Rebuffering, StreamEvent::Cancel { reason: "user".into() }, 0.2, StreamState::Finished)]
#[case::cancel_while_draining(StreamState::Draining, StreamEvent::Cancel { reason: "user".into() }, 0.8, StreamState::Finished)]
#[case::idle_ignores_empty(StreamState::Idle, StreamEvent::BufferEmpty, 0.0, StreamState::Idle)]
#[case::playing_ignores_empty(StreamState::Playing, StreamEvent::BufferEmpty, 0.0, StreamState::Playing)]
fn test_transition_table(
    #[case] from: StreamState,
    #[case] event: StreamEvent,
    #[case] buffered: f64,
    #[case] expected: StreamState,
) {
    let mut sm = machine_in(from);
    let before = sm.transition_count();

    let record = sm.dispatch(event.clone(), buffered);

    assert_eq!(sm.state(), expected);
    if expected == from {
        assert!(record.is_none());
        assert_eq!(sm.transition_count(), before);
    } else {
        let record = record.expect("Should record the transition");
        assert_eq!(record.from, from);
        assert_eq!(record.to, expected);
        assert_eq!(record.event, event);
        assert_eq!(record.sequence, before + 1);
    }
}

#[rstest]
#[case(StreamState::Idle)]
#[case(StreamState::Buffering)]
#[case(StreamState::Playing)]
#[case(StreamState::Rebuffering)]
#[case(StreamState::Draining)]
fn test_cancel_finishes_any_live_state(#[case] from: StreamState) {
    let mut sm = machine_in(from);
    sm.dispatch(StreamEvent::Cancel { reason: "user".into() }, 1.0);
    assert_eq!(sm.state(), StreamState::Finished);
    assert!(sm.is_terminal());
}

#[rstest]
#[case(StreamState::Finished)]
#[case(StreamState::Error)]
fn test_terminal_states_accept_nothing(#[case] terminal: StreamState) {
    let mut sm = machine_in(terminal);
    let count = sm.transition_count();

    for event in [
        StreamEvent::Start,
        chunk(),
        StreamEvent::GenerationComplete { total_chunks: 1 },
        StreamEvent::GenerationError { error: "late".into() },
        StreamEvent::BufferLow { buffered_seconds: 0.0 },
        StreamEvent::BufferOk { buffered_seconds: 9.0 },
        StreamEvent::BufferEmpty,
        StreamEvent::Cancel { reason: "late".into() },
    ] {
        assert!(sm.dispatch(event, 9.0).is_none());
    }

    assert_eq!(sm.state(), terminal);
    assert_eq!(sm.transition_count(), count);
}

#[test]
fn test_history_records_thresholds() {
    let mut sm = machine_in(StreamState::Rebuffering);
    sm.dispatch(StreamEvent::BufferOk { buffered_seconds: 1.6 }, 1.6);
    sm.dispatch(StreamEvent::GenerationComplete { total_chunks: 2 }, 1.6);
    sm.dispatch(StreamEvent::BufferEmpty, 0.0);

    let history = sm.history();
    assert_eq!(history.len(), 6);
    assert!(history.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
    assert!(history.iter().all(|r| r.thresholds == thresholds()));
    assert_eq!(sm.rebuffer_count(), 1);
    assert_eq!(
        history.iter().map(|r| r.to).collect::<Vec<_>>(),
        vec![
            StreamState::Buffering,
            StreamState::Playing,
            StreamState::Rebuffering,
            StreamState::Playing,
            StreamState::Draining,
            StreamState::Finished,
        ]
    );
}
