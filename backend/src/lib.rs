//! osdcast library.
//!
//! Assembles a detection pipeline as a graph model, realizes it on
//! GStreamer, annotates every frame with its labels and the stream's frame
//! rate, and republishes the encoded result over RTSP.

pub mod annotate;
pub mod config;
pub mod fps;
pub mod graph;
pub mod gst;
pub mod publisher;
pub mod tracker_config;
