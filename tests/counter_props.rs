//! Property tests: the arrival count and the frozen display under arbitrary
//! interleavings of arrivals, pauses and mode changes.

mod common;

use std::sync::Arc;

use common::image;
use feed_sync::generate::FixedGenerator;
use feed_sync::{ArrivalCounter, ControllerOptions, ImagePanel, ImageParameters, Mode, StreamSource};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Arrive,
    Pause,
    Resume,
    ToggleMode,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Arrive),
        1 => Just(Op::Pause),
        1 => Just(Op::Resume),
        1 => Just(Op::ToggleMode),
    ]
}

proptest! {
    #[test]
    fn prop_total_equals_arrivals(ops in prop::collection::vec(op(), 0..80)) {
        let stream = StreamSource::<ImageParameters>::detached();
        let counter = ArrivalCounter::count(&stream);
        let mut arrivals = 0u64;

        for (i, op) in ops.iter().enumerate() {
            match op {
                Op::Arrive => {
                    stream.ingest(image(&format!("p{i}"), i as u64));
                    arrivals += 1;
                }
                Op::Pause | Op::ToggleMode => stream.pause(true),
                Op::Resume => stream.pause(false),
            }
            prop_assert_eq!(counter.total(), arrivals);
        }
        prop_assert_eq!(counter.total(), arrivals);
    }

    #[test]
    fn prop_edit_mode_display_never_follows_stream(ops in prop::collection::vec(op(), 0..60)) {
        let panel = ImagePanel::new(
            StreamSource::detached(),
            Arc::new(FixedGenerator::succeeding("unused")),
            ControllerOptions::default(),
        );
        let mut arrivals = 0u64;

        for (i, op) in ops.iter().enumerate() {
            let before = panel.displayed();
            match op {
                Op::Arrive => {
                    let artifact = panel.stream().ingest(image(&format!("p{i}"), i as u64));
                    arrivals += 1;
                    match panel.mode() {
                        Mode::Edit => {
                            let after = panel.displayed();
                            prop_assert_eq!(
                                after.as_ref().map(|a| a.id),
                                before.as_ref().map(|a| a.id)
                            );
                        }
                        Mode::Feed => {
                            prop_assert!(Arc::ptr_eq(&panel.displayed().unwrap(), &artifact));
                        }
                    }
                }
                Op::ToggleMode => {
                    panel.toggle_mode();
                }
                // The mode switch owns the pause flag inside a panel.
                Op::Pause | Op::Resume => {}
            }
            prop_assert_eq!(panel.total(), arrivals);
        }

        if panel.mode() == Mode::Edit {
            panel.set_mode(Mode::Feed);
        }
        prop_assert_eq!(
            panel.displayed().map(|a| a.id),
            panel.stream().latest().map(|a| a.id)
        );
    }
}
