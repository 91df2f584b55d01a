//! Bus message handling.

use crate::graph::PipelineGraph;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use osdcast_types::RuntimeNotification;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Map a bus message to a runtime notification.
///
/// Element state changes are not lifecycle changes and yield `None`.
pub fn classify(msg: &gst::Message) -> Option<RuntimeNotification> {
    use gst::MessageView;

    let source = msg.src().map(|s| s.name().to_string());
    match msg.view() {
        MessageView::Eos(_) => Some(RuntimeNotification::EndOfStream),
        MessageView::Error(err) => Some(RuntimeNotification::Error {
            source,
            message: err.error().to_string(),
            debug: err.debug().map(|d| d.to_string()),
        }),
        MessageView::Warning(w) => Some(RuntimeNotification::Warning {
            source,
            message: w.error().to_string(),
            debug: w.debug().map(|d| d.to_string()),
        }),
        MessageView::Info(inf) => Some(RuntimeNotification::Info {
            source,
            message: inf.error().to_string(),
        }),
        _ => None,
    }
}

/// Install the pipeline's bus watch.
///
/// Notifications are logged and fed to the graph's lifecycle. End-of-stream
/// and errors quit `main_loop`.
pub fn watch(
    bus: &gst::Bus,
    graph: Arc<Mutex<PipelineGraph>>,
    main_loop: glib::MainLoop,
) -> glib::SignalHandlerId {
    bus.add_signal_watch();

    bus.connect_message(None, move |_bus, msg| {
        trace!("Bus message type: {:?}", msg.type_());

        if let gst::MessageView::StateChanged(changed) = msg.view() {
            if msg.src().is_some_and(|s| s.type_() == gst::Pipeline::static_type()) {
                info!(
                    "GStreamer pipeline state changed: {:?} -> {:?} (pending: {:?})",
                    changed.old(),
                    changed.current(),
                    changed.pending()
                );
            }
            return;
        }

        let Some(notification) = classify(msg) else {
            return;
        };
        match &notification {
            RuntimeNotification::Error { debug: details, .. } => {
                error!("{} (debug: {:?})", notification.description(), details)
            }
            RuntimeNotification::Warning { debug: details, .. } => {
                warn!("{} (debug: {:?})", notification.description(), details)
            }
            RuntimeNotification::EndOfStream => info!("Pipeline reached end of stream"),
            other => info!("{}", other.description()),
        }

        let mut graph = graph.lock();
        let old = graph.state();
        if let Some(new) = graph.lifecycle_mut().on_notification(&notification) {
            debug!(
                "{}",
                RuntimeNotification::StateChanged { old, new }.description()
            );
        }
        if notification.requests_stop() {
            main_loop.quit();
        }
    })
}

/// Remove a watch installed by [`watch`].
pub fn unwatch(bus: &gst::Bus, handler: glib::SignalHandlerId) {
    bus.disconnect(handler);
    bus.remove_signal_watch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::assembler::{build, AssemblerConfig, AssumeAvailable};
    use osdcast_types::PipelineState;

    #[test]
    fn test_classify() {
        gst::init().unwrap();
        let element = gst::ElementFactory::make("fakesink")
            .name("udp-sink")
            .build()
            .unwrap();

        let eos = gst::message::Eos::new();
        assert_eq!(classify(&eos), Some(RuntimeNotification::EndOfStream));

        let err = gst::message::Error::builder(gst::CoreError::Failed, "boom")
            .src(&element)
            .build();
        match classify(&err) {
            Some(RuntimeNotification::Error {
                source, message, ..
            }) => {
                assert_eq!(source.as_deref(), Some("udp-sink"));
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }

        let state = gst::message::StateChanged::builder(
            gst::State::Null,
            gst::State::Ready,
            gst::State::VoidPending,
        )
        .build();
        assert_eq!(classify(&state), None);
    }

    #[test]
    fn test_eos_stops_running_pipeline() {
        gst::init().unwrap();
        let config = AssemblerConfig {
            input: "/dev/video0".to_string(),
            ..Default::default()
        };
        let mut graph = build(&config, &AssumeAvailable).unwrap();
        graph.start().unwrap();
        let graph = Arc::new(Mutex::new(graph));

        let bus = gst::Bus::new();
        let main_loop = glib::MainLoop::new(None, false);
        let handler = watch(&bus, graph.clone(), main_loop.clone());

        // Emitting the signal directly runs the handler synchronously
        bus.emit_by_name::<()>("message", &[&gst::message::Eos::new()]);
        assert_eq!(graph.lock().state(), PipelineState::Stopped);

        unwatch(&bus, handler);
    }
}
